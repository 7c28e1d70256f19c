//! Type encoding strings for method signatures and ivars.
//!
//! Encodings follow the familiar `@encode` grammar. A method signature is the
//! return type followed by the argument types, each optionally followed by a
//! frame offset that is ignored here. The first two arguments are always the
//! receiver (`@`) and the selector (`:`).
//!
//! - `v` void, `B` bool, `c`/`C` 8-bit, `s`/`S` 16-bit, `i`/`I` 32-bit
//! - `l`/`L` C long, `q`/`Q` 64-bit, `f` float, `d` double, `D` long double
//! - `@` object (optionally `@"ClassName"` or `@?` for blocks)
//! - `#` class, `:` selector, `*` C string, `?` unknown
//! - `^type` pointer, `[Ntype]` array
//! - `{name=types}` struct, `(name=types)` union
//! - leading qualifiers `r n N o O R V A j` are skipped
//!
//! Example signatures:
//! - `"v@:"` - no arguments, no return value
//! - `"q@:q"` - takes and returns a 64-bit integer
//! - `"{Point=dd}24@0:8"` - returns a struct, with frame offsets

// Different types share a byte size; the arms are kept apart for readability
#![allow(clippy::match_same_arms)]

use crate::error::{Error, Result};
use std::mem;

/// Type encoding constant definitions.
pub mod types {
    /// Void type encoding
    pub const VOID: &str = "v";

    /// Object (id) type encoding
    pub const OBJECT: &str = "@";

    /// Selector type encoding
    pub const SELECTOR: &str = ":";

    /// Bool type encoding
    pub const BOOL: &str = "B";

    /// Int (i32) type encoding
    pub const INT: &str = "i";

    /// C long type encoding
    pub const LONG: &str = "l";

    /// Long long (i64) type encoding
    pub const LONG_LONG: &str = "q";

    /// Unsigned long long (u64) type encoding
    pub const UNSIGNED_LONG_LONG: &str = "Q";

    /// Float (f32) type encoding
    pub const FLOAT: &str = "f";

    /// Double (f64) type encoding
    pub const DOUBLE: &str = "d";

    /// C string (char*) type encoding
    pub const C_STRING: &str = "*";

    /// Untyped pointer type encoding
    pub const POINTER: &str = "^v";

    /// Class type encoding
    pub const CLASS: &str = "#";
}

/// Size and alignment of an encoded type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeInfo {
    /// Size in bytes.
    pub size: usize,
    /// Required alignment in bytes (a power of two).
    pub align: usize,
}

impl TypeInfo {
    const fn new(size: usize, align: usize) -> Self {
        TypeInfo { size, align }
    }

    const fn of<T>() -> Self {
        TypeInfo::new(mem::size_of::<T>(), mem::align_of::<T>())
    }
}

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Parser { src, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn skip_qualifiers(&mut self) {
        while matches!(
            self.peek(),
            Some(b'r' | b'n' | b'N' | b'o' | b'O' | b'R' | b'V' | b'A' | b'j')
        ) {
            self.pos += 1;
        }
    }

    fn skip_offset(&mut self) {
        while matches!(self.peek(), Some(b'0'..=b'9' | b'-')) {
            self.pos += 1;
        }
    }

    fn number(&mut self) -> Option<usize> {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        self.src[start..self.pos].parse().ok()
    }

    fn skip_quoted(&mut self) -> Option<()> {
        if self.peek() != Some(b'"') {
            return Some(());
        }
        self.pos += 1;
        let rest = &self.src[self.pos..];
        let close = rest.find('"')?;
        self.pos += close + 1;
        Some(())
    }

    /// Parses one type, returning its layout and the slice it covers
    /// (qualifiers excluded).
    fn parse_type(&mut self) -> Option<(&'a str, TypeInfo)> {
        self.skip_qualifiers();
        let start = self.pos;
        let info = match self.bump()? {
            b'v' => TypeInfo::new(0, 1),
            b'c' | b'C' => TypeInfo::of::<u8>(),
            b'B' => TypeInfo::of::<bool>(),
            b's' | b'S' => TypeInfo::of::<u16>(),
            b'i' | b'I' => TypeInfo::of::<u32>(),
            b'l' | b'L' => TypeInfo::of::<std::ffi::c_long>(),
            b'q' | b'Q' => TypeInfo::of::<u64>(),
            b'f' => TypeInfo::of::<f32>(),
            b'd' => TypeInfo::of::<f64>(),
            b'D' => TypeInfo::new(16, 16),
            b'@' => {
                match self.peek() {
                    Some(b'"') => self.skip_quoted()?,
                    Some(b'?') => self.pos += 1,
                    _ => {}
                }
                TypeInfo::of::<usize>()
            }
            b'#' | b':' | b'*' | b'?' => TypeInfo::of::<usize>(),
            b'^' => {
                self.parse_type()?;
                TypeInfo::of::<usize>()
            }
            b'[' => {
                let count = self.number()?;
                let (_, elem) = self.parse_type()?;
                if self.bump()? != b']' {
                    return None;
                }
                TypeInfo::new(elem.size.checked_mul(count)?, elem.align)
            }
            open @ (b'{' | b'(') => self.parse_aggregate(open == b'(')?,
            _ => return None,
        };
        Some((&self.src[start..self.pos], info))
    }

    fn parse_aggregate(&mut self, union: bool) -> Option<TypeInfo> {
        let close = if union { b')' } else { b'}' };

        // Name runs up to '=' (members follow) or the closing bracket (opaque)
        loop {
            match self.bump()? {
                b'=' => break,
                c if c == close => return Some(TypeInfo::new(0, 1)),
                _ => {}
            }
        }

        let mut size = 0usize;
        let mut align = 1usize;
        while self.peek()? != close {
            self.skip_quoted()?;
            let (_, member) = self.parse_type()?;
            align = align.max(member.align);
            size = if union {
                size.max(member.size)
            } else {
                align_up(size, member.align) + member.size
            };
        }
        self.pos += 1;
        Some(TypeInfo::new(align_up(size, align), align))
    }
}

fn invalid(encoding: &str) -> Error {
    Error::InvalidEncoding {
        encoding: encoding.to_owned(),
    }
}

/// Returns the layout of a single encoded type.
///
/// # Example
///
/// ```
/// use objrt::runtime::encoding::type_info;
///
/// assert_eq!(type_info("i").unwrap().size, 4);
/// assert_eq!(type_info("{Point=dd}").unwrap().size, 16);
/// assert_eq!(type_info("{Pair=ci}").unwrap().size, 8);
/// assert_eq!(type_info("[4s]").unwrap().size, 8);
/// assert!(type_info("ii").is_err());
/// ```
///
/// # Errors
///
/// Returns [`Error::InvalidEncoding`] unless `encoding` is exactly one
/// well-formed type.
pub fn type_info(encoding: &str) -> Result<TypeInfo> {
    let mut parser = Parser::new(encoding);
    match parser.parse_type() {
        Some((_, info)) if parser.at_end() => Ok(info),
        _ => Err(invalid(encoding)),
    }
}

/// Splits a method signature into its return type and argument types.
///
/// Frame offsets are dropped and each element is returned as a slice of
/// `encoding`.
///
/// # Example
///
/// ```
/// use objrt::runtime::encoding::parse_signature;
///
/// let (ret, args) = parse_signature("{Point=dd}24@0:8d16").unwrap();
/// assert_eq!(ret, "{Point=dd}");
/// assert_eq!(args, vec!["@", ":", "d"]);
/// ```
///
/// # Errors
///
/// Returns [`Error::InvalidEncoding`] if the encoding is malformed or does
/// not begin its argument list with the receiver and selector.
pub fn parse_signature(encoding: &str) -> Result<(&str, Vec<&str>)> {
    let mut parser = Parser::new(encoding);
    let mut elements = Vec::new();
    while !parser.at_end() {
        let (element, _) = parser.parse_type().ok_or_else(|| invalid(encoding))?;
        elements.push(element);
        parser.skip_offset();
    }

    if elements.len() < 3 || !elements[1].starts_with('@') || elements[2] != ":" {
        return Err(invalid(encoding));
    }

    let ret = elements.remove(0);
    Ok((ret, elements))
}

/// Validates a method signature encoding.
///
/// ```
/// use objrt::runtime::encoding::validate_encoding;
///
/// assert!(validate_encoding("v@:").is_ok());
/// assert!(validate_encoding("i@:i").is_ok());
/// assert!(validate_encoding("xyz").is_err());
/// assert!(validate_encoding("@").is_err());
/// ```
///
/// # Errors
///
/// Returns [`Error::InvalidEncoding`] under the same conditions as
/// [`parse_signature`].
pub fn validate_encoding(encoding: &str) -> Result<()> {
    parse_signature(encoding).map(|_| ())
}

/// Number of explicit arguments (receiver and selector excluded).
///
/// # Errors
///
/// Returns [`Error::InvalidEncoding`] if the signature is malformed.
pub fn argument_count(encoding: &str) -> Result<usize> {
    parse_signature(encoding).map(|(_, args)| args.len() - 2)
}

/// Returns true if the signature's return type is `void`.
///
/// Malformed signatures are treated as non-void.
#[must_use]
pub fn is_void_return(encoding: &str) -> bool {
    matches!(parse_signature(encoding), Ok(("v", _)))
}

/// Returns true if the signature returns a struct or union by value.
#[must_use]
pub fn is_struct_return(encoding: &str) -> bool {
    matches!(parse_signature(encoding), Ok((ret, _)) if ret.starts_with(['{', '(']))
}

/// Returns true if `encoding` describes an object reference.
#[must_use]
pub fn is_object_type(encoding: &str) -> bool {
    encoding.trim_start_matches(['r', 'n', 'N', 'o', 'O', 'R', 'V', 'A', 'j']).starts_with('@')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_encoding_valid() {
        assert!(validate_encoding("v@:").is_ok());
        assert!(validate_encoding("i@:i").is_ok());
        assert!(validate_encoding("@@:@").is_ok());
        assert!(validate_encoding("q@:dq").is_ok());
        assert!(validate_encoding("v24@0:8@\"NSString\"16").is_ok());
        assert!(validate_encoding("Vv@:").is_ok());
    }

    #[test]
    fn test_validate_encoding_invalid() {
        assert!(validate_encoding("").is_err());
        assert!(validate_encoding("xyz").is_err());
        assert!(validate_encoding("v@:x").is_err());
        assert!(validate_encoding("@").is_err());
        assert!(validate_encoding("v:@").is_err());
        assert!(validate_encoding("v@:{Point=dd").is_err());
    }

    #[test]
    fn test_scalar_sizes() {
        assert_eq!(type_info("c").unwrap(), TypeInfo::new(1, 1));
        assert_eq!(type_info("s").unwrap(), TypeInfo::new(2, 2));
        assert_eq!(type_info("i").unwrap(), TypeInfo::new(4, 4));
        assert_eq!(type_info("q").unwrap(), TypeInfo::new(8, 8));
        assert_eq!(type_info("d").unwrap(), TypeInfo::new(8, 8));
        assert_eq!(type_info("v").unwrap().size, 0);
        assert_eq!(type_info("@").unwrap().size, mem::size_of::<usize>());
        assert!(type_info("x").is_err());
    }

    #[test]
    fn test_aggregate_layout() {
        assert_eq!(type_info("{Point=dd}").unwrap(), TypeInfo::new(16, 8));
        assert_eq!(type_info("{Pad=cq}").unwrap(), TypeInfo::new(16, 8));
        assert_eq!(type_info("{Named=\"x\"i\"y\"i}").unwrap(), TypeInfo::new(8, 4));
        assert_eq!(type_info("(Either=cq)").unwrap(), TypeInfo::new(8, 8));
        assert_eq!(type_info("[3{Point=dd}]").unwrap().size, 48);
        assert_eq!(type_info("^{Opaque}").unwrap().size, mem::size_of::<usize>());
    }

    #[test]
    fn test_parse_signature_with_offsets() {
        let (ret, args) = parse_signature("q24@0:8q16").unwrap();
        assert_eq!(ret, "q");
        assert_eq!(args, vec!["@", ":", "q"]);
        assert_eq!(argument_count("q24@0:8q16").unwrap(), 1);
    }

    #[test]
    fn test_return_kind() {
        assert!(is_void_return("v@:"));
        assert!(!is_void_return("q@:"));
        assert!(is_struct_return("{Point=dd}@:"));
        assert!(!is_struct_return("d@:"));
        assert!(is_object_type("@\"Counter\""));
        assert!(is_object_type("r@"));
        assert!(!is_object_type("q"));
    }
}
