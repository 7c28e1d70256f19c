//! Error types for the `objrt` runtime.
//!
//! Registry and lifecycle violations are reported at the call that detected
//! them. Conformance queries never produce an error: absence of conformance
//! is a plain `false`.

use std::fmt;

/// Errors that can occur in the `objrt` runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Object storage could not be described by a valid layout.
    OutOfMemory,

    /// A class with this name is already registered.
    ClassAlreadyExists {
        /// Name of the class.
        name: String,
    },

    /// No registered class has this name.
    ClassNotFound {
        /// Name that was looked up.
        name: String,
    },

    /// The class (or the superclass it was derived from) is not registered.
    ClassNotRegistered {
        /// Name of the class.
        name: String,
    },

    /// Structural change attempted on a class that is already registered.
    ClassAlreadyRegistered {
        /// Name of the class.
        name: String,
    },

    /// The class already declares a method for this selector.
    MethodAlreadyExists {
        /// Name of the selector.
        selector: String,
    },

    /// The class (or an ancestor) already declares an ivar with this name.
    IvarAlreadyExists {
        /// Name of the ivar.
        name: String,
    },

    /// Access to an ivar with a value of the wrong size or kind.
    IvarTypeMismatch {
        /// Name of the ivar.
        ivar: String,
        /// Size recorded in the ivar's layout entry.
        expected: usize,
        /// Size of the value supplied by the caller.
        got: usize,
    },

    /// The ivar is declared by a class the object is not an instance of.
    IvarNotInClass {
        /// Name of the ivar.
        ivar: String,
        /// Class of the object.
        class: String,
    },

    /// Invalid type encoding string.
    InvalidEncoding {
        /// The rejected encoding.
        encoding: String,
    },

    /// No implementation, forwarding target or forward handler exists for
    /// the selector.
    UnrecognizedSelector {
        /// Class of the receiver.
        class: String,
        /// Name of the selector.
        selector: String,
    },

    /// Argument count mismatch for method signature.
    ArgumentCountMismatch {
        /// Number of arguments the type encoding declares
        expected: usize,
        /// Number of arguments provided
        got: usize,
    },

    /// Forwarding loop detected (exceeded max forwarding depth).
    ForwardingLoopDetected {
        /// The selector that triggered the loop.
        selector: String,
        /// The forwarding depth when the loop was detected.
        depth: u32,
    },

    /// Category name already attached to this class.
    CategoryAlreadyExists {
        /// Name of the category.
        name: String,
    },

    /// The category is already attached to a class.
    CategoryAlreadyAttached {
        /// Name of the category.
        name: String,
    },

    /// Protocol name already exists.
    ProtocolAlreadyExists {
        /// Name of the protocol.
        name: String,
    },

    /// Protocol already adopted by class.
    ProtocolAlreadyAdopted {
        /// Name of the protocol.
        name: String,
    },

    /// Method already registered in protocol.
    ProtocolMethodAlreadyRegistered {
        /// Name of the selector.
        selector: String,
    },

    /// Missing required protocol method.
    MissingProtocolMethod {
        /// The selector that is missing
        selector: String,
    },

    /// `sync_exit` on an object the calling thread does not hold.
    UnlockFailed {
        /// Address of the object.
        object: usize,
    },

    /// `autorelease` with no autorelease pool on the calling thread.
    NoAutoreleasePool,

    /// `release` with no outstanding ownership.
    OverRelease {
        /// Class of the object.
        class: String,
    },

    /// Reference count overflow detected.
    RefCountOverflow,

    /// The new class needs more instance storage than the object has.
    InstanceSizeMismatch {
        /// Name of the new class.
        class: String,
        /// Bytes of instance storage the new class needs.
        required: usize,
        /// Bytes of instance storage the object was allocated with.
        available: usize,
    },

    /// The new class places object references at different offsets.
    IncompatibleLayout {
        /// Name of the new class.
        class: String,
    },

    /// Metaclasses have exactly one instance, the class object.
    NotInstantiable {
        /// Name of the metaclass.
        class: String,
    },

    /// A collection was mutated while being enumerated and no mutation
    /// handler is installed.
    EnumerationMutated {
        /// Class of the mutated collection.
        class: String,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfMemory => write!(f, "Out of memory"),
            Error::ClassAlreadyExists { name } => {
                write!(f, "Class '{name}' already exists in registry")
            }
            Error::ClassNotFound { name } => {
                write!(f, "Class '{name}' not found")
            }
            Error::ClassNotRegistered { name } => {
                write!(f, "Class '{name}' is not registered")
            }
            Error::ClassAlreadyRegistered { name } => {
                write!(f, "Class '{name}' is already registered")
            }
            Error::MethodAlreadyExists { selector } => {
                write!(f, "Method '{selector}' already declared by class")
            }
            Error::IvarAlreadyExists { name } => {
                write!(f, "Instance variable '{name}' already exists")
            }
            Error::IvarTypeMismatch {
                ivar,
                expected,
                got,
            } => {
                write!(
                    f,
                    "Instance variable '{ivar}' holds {expected} bytes, got {got}"
                )
            }
            Error::IvarNotInClass { ivar, class } => {
                write!(f, "Instance variable '{ivar}' does not belong to class '{class}'")
            }
            Error::InvalidEncoding { encoding } => {
                write!(f, "Invalid type encoding string: '{encoding}'")
            }
            Error::UnrecognizedSelector { class, selector } => {
                write!(
                    f,
                    "Unrecognized selector '{selector}' sent to instance of '{class}'"
                )
            }
            Error::ArgumentCountMismatch { expected, got } => {
                write!(
                    f,
                    "Argument count mismatch: expected {expected}, got {got}"
                )
            }
            Error::ForwardingLoopDetected { selector, depth } => {
                write!(
                    f,
                    "Forwarding loop detected for selector '{selector}' at depth {depth}"
                )
            }
            Error::CategoryAlreadyExists { name } => {
                write!(f, "Category '{name}' already exists for this class")
            }
            Error::CategoryAlreadyAttached { name } => {
                write!(f, "Category '{name}' is already attached to a class")
            }
            Error::ProtocolAlreadyExists { name } => {
                write!(f, "Protocol '{name}' already exists")
            }
            Error::ProtocolAlreadyAdopted { name } => {
                write!(f, "Protocol '{name}' already adopted by class")
            }
            Error::ProtocolMethodAlreadyRegistered { selector } => {
                write!(f, "Method '{selector}' already registered in protocol")
            }
            Error::MissingProtocolMethod { selector } => {
                write!(f, "Missing required protocol method: {selector}")
            }
            Error::UnlockFailed { object } => {
                write!(f, "Unlock failed: object {object:#x} not held by this thread")
            }
            Error::NoAutoreleasePool => {
                write!(f, "Autorelease with no autorelease pool in place")
            }
            Error::OverRelease { class } => {
                write!(f, "Over-release of instance of '{class}'")
            }
            Error::RefCountOverflow => {
                write!(f, "Reference count overflow detected")
            }
            Error::InstanceSizeMismatch {
                class,
                required,
                available,
            } => {
                write!(
                    f,
                    "Class '{class}' needs {required} bytes of instance storage, object has {available}"
                )
            }
            Error::IncompatibleLayout { class } => {
                write!(f, "Class '{class}' has an incompatible object layout")
            }
            Error::NotInstantiable { class } => {
                write!(f, "Metaclass of '{class}' cannot be instantiated")
            }
            Error::EnumerationMutated { class } => {
                write!(f, "Instance of '{class}' was mutated during enumeration")
            }
        }
    }
}

impl std::error::Error for Error {}

/// Result type for `objrt` runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", Error::OutOfMemory), "Out of memory");
        assert_eq!(
            format!(
                "{}",
                Error::UnrecognizedSelector {
                    class: "Counter".into(),
                    selector: "decrement".into(),
                }
            ),
            "Unrecognized selector 'decrement' sent to instance of 'Counter'"
        );
        assert_eq!(
            format!("{}", Error::UnlockFailed { object: 0x1000 }),
            "Unlock failed: object 0x1000 not held by this thread"
        );
    }

    #[test]
    fn test_error_equality() {
        assert_eq!(Error::NoAutoreleasePool, Error::NoAutoreleasePool);
        assert_ne!(
            Error::ClassAlreadyExists { name: "A".into() },
            Error::ClassAlreadyExists { name: "B".into() }
        );
    }
}
