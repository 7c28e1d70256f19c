//! Argument packs and return buffers for message sends.
//!
//! Arguments travel type-erased as machine words. Return values travel the
//! other way through a byte buffer: scalar sends hand the implementation a
//! [`SCALAR_RETURN_SIZE`]-byte buffer, struct-returning sends hand it the
//! caller's own buffer.
//!
//! ```rust
//! use objrt::runtime::message::{MessageArgs, read_return, write_return};
//!
//! let args = MessageArgs::two(3, 4);
//! assert_eq!(args.count(), 2);
//! assert_eq!(args.get(1), Some(4));
//!
//! let mut ret = [0u8; 16];
//! write_return(&mut ret, 7.5f64);
//! assert_eq!(read_return::<f64>(&ret), 7.5);
//! ```

/// Size of the return buffer used by scalar sends.
pub const SCALAR_RETURN_SIZE: usize = 16;

/// Arguments of a message send, excluding the receiver and selector.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum MessageArgs {
    /// No arguments
    #[default]
    None,

    /// One argument
    One(usize),

    /// Two arguments
    Two([usize; 2]),

    /// Three arguments
    Three([usize; 3]),

    /// Four arguments
    Four([usize; 4]),

    /// Any other count
    Many(Box<[usize]>),
}

impl MessageArgs {
    #[must_use]
    pub const fn none() -> Self {
        MessageArgs::None
    }

    #[must_use]
    pub const fn one(arg: usize) -> Self {
        MessageArgs::One(arg)
    }

    #[must_use]
    pub const fn two(arg1: usize, arg2: usize) -> Self {
        MessageArgs::Two([arg1, arg2])
    }

    #[must_use]
    pub const fn three(args: [usize; 3]) -> Self {
        MessageArgs::Three(args)
    }

    #[must_use]
    pub const fn four(args: [usize; 4]) -> Self {
        MessageArgs::Four(args)
    }

    /// Builds the smallest variant that holds `args`.
    ///
    /// ```rust
    /// use objrt::runtime::MessageArgs;
    ///
    /// assert_eq!(MessageArgs::from_slice(&[]), MessageArgs::None);
    /// assert_eq!(MessageArgs::from_slice(&[1, 2]), MessageArgs::two(1, 2));
    /// assert_eq!(MessageArgs::from_slice(&[1, 2, 3, 4, 5]).count(), 5);
    /// ```
    #[must_use]
    pub fn from_slice(args: &[usize]) -> Self {
        match *args {
            [] => MessageArgs::None,
            [a] => MessageArgs::One(a),
            [a, b] => MessageArgs::Two([a, b]),
            [a, b, c] => MessageArgs::Three([a, b, c]),
            [a, b, c, d] => MessageArgs::Four([a, b, c, d]),
            _ => MessageArgs::Many(args.into()),
        }
    }

    /// Number of arguments.
    #[must_use]
    pub fn count(&self) -> usize {
        self.as_slice().len()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[usize] {
        match self {
            MessageArgs::None => &[],
            MessageArgs::One(arg) => std::slice::from_ref(arg),
            MessageArgs::Two(args) => args,
            MessageArgs::Three(args) => args,
            MessageArgs::Four(args) => args,
            MessageArgs::Many(args) => args,
        }
    }

    /// Returns the argument at `index`, if present.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<usize> {
        self.as_slice().get(index).copied()
    }
}

/// Plain values that may be read back from any byte pattern.
///
/// Implemented for the primitive integers, floats and arrays of them.
pub trait PlainValue: Copy + sealed::Sealed {}

mod sealed {
    pub trait Sealed {}
}

macro_rules! plain_values {
    ($($t:ty),*) => {
        $(
            impl sealed::Sealed for $t {}
            impl PlainValue for $t {}
        )*
    };
}

plain_values!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64);

impl<T: PlainValue, const N: usize> sealed::Sealed for [T; N] {}
impl<T: PlainValue, const N: usize> PlainValue for [T; N] {}

/// Writes `value` at the start of a return buffer.
///
/// # Panics
///
/// Panics if `ret` is smaller than `T`. Implementations must not return more
/// than the buffer the send was given.
pub fn write_return<T: Copy>(ret: &mut [u8], value: T) {
    let size = std::mem::size_of::<T>();
    assert!(
        ret.len() >= size,
        "return buffer holds {} bytes, value needs {size}",
        ret.len()
    );
    // SAFETY: the buffer holds at least size_of::<T>() bytes (checked above)
    // and the write is unaligned
    unsafe { ret.as_mut_ptr().cast::<T>().write_unaligned(value) };
}

/// Reads a `T` from the start of a return buffer.
///
/// # Panics
///
/// Panics if `ret` is smaller than `T`.
#[must_use]
pub fn read_return<T: PlainValue>(ret: &[u8]) -> T {
    let size = std::mem::size_of::<T>();
    assert!(
        ret.len() >= size,
        "return buffer holds {} bytes, value needs {size}",
        ret.len()
    );
    // SAFETY: bounds checked above; every bit pattern is a valid PlainValue
    unsafe { ret.as_ptr().cast::<T>().read_unaligned() }
}
