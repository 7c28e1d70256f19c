// Exceptions
//
// Exceptions travel as Rust panics carrying a private payload, so ordinary
// unwinding runs `Drop` for every frame they cross: an `Object` held on the
// stack between the throw and the catch is released exactly once.
//
// `try_catch` opens a catch frame. `throw`/`raise` with no catch frame on
// the thread are uncaught: the uncaught handler runs (if one is set), the
// error is logged and the thread panics. Panics that did not come from
// `throw`/`raise` pass through `try_catch` untouched.

use crate::error::Error;
use crate::runtime::object::Object;
use objrt_log::{debug, error};
use parking_lot::RwLock;
use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// Called with an exception no `try_catch` frame will receive.
pub type UncaughtExceptionHandler = fn(&Exception);

static UNCAUGHT_HANDLER: RwLock<Option<UncaughtExceptionHandler>> = RwLock::new(None);

thread_local! {
    static CATCH_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// A thrown value.
#[derive(Debug, Clone, PartialEq)]
pub enum Exception {
    /// An object passed to [`throw`].
    Object(Object),
    /// A runtime error passed to [`raise`].
    Runtime(Error),
}

impl Exception {
    #[must_use]
    pub fn object(&self) -> Option<&Object> {
        match self {
            Exception::Object(object) => Some(object),
            Exception::Runtime(_) => None,
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&Error> {
        match self {
            Exception::Runtime(err) => Some(err),
            Exception::Object(_) => None,
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exception::Object(object) => write!(f, "instance of '{}'", object.class().name()),
            Exception::Runtime(err) => write!(f, "{err}"),
        }
    }
}

/// Panic payload marking an unwind as a runtime exception.
struct Thrown(Exception);

struct CatchFrame;

impl CatchFrame {
    fn enter() -> Self {
        CATCH_DEPTH.with(|depth| depth.set(depth.get() + 1));
        CatchFrame
    }
}

impl Drop for CatchFrame {
    fn drop(&mut self) {
        CATCH_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Installs the uncaught exception handler, returning the previous one.
pub fn set_uncaught_exception_handler(
    handler: Option<UncaughtExceptionHandler>,
) -> Option<UncaughtExceptionHandler> {
    std::mem::replace(&mut *UNCAUGHT_HANDLER.write(), handler)
}

/// Throws `object` to the nearest enclosing [`try_catch`].
///
/// # Panics
///
/// Panics after running the uncaught handler if no `try_catch` is active on
/// this thread.
pub fn throw(object: Object) -> ! {
    unwind(Exception::Object(object))
}

/// Raises a runtime error as an exception; see [`throw`].
///
/// # Panics
///
/// As for [`throw`].
pub fn raise(err: Error) -> ! {
    unwind(Exception::Runtime(err))
}

fn unwind(exception: Exception) -> ! {
    if CATCH_DEPTH.with(Cell::get) == 0 {
        uncaught(exception);
    }
    debug!("throwing {}", exception);
    panic::resume_unwind(Box::new(Thrown(exception)))
}

#[cold]
fn uncaught(exception: Exception) -> ! {
    error!("uncaught exception: {}", exception);
    #[cfg(feature = "uncaught_backtrace")]
    error!("{:?}", backtrace::Backtrace::new());

    let handler = *UNCAUGHT_HANDLER.read();
    if let Some(handler) = handler {
        handler(&exception);
    }
    panic!("uncaught exception: {exception}");
}

/// Runs `f`, catching any exception thrown inside it.
///
/// # Example
///
/// ```rust
/// use objrt::{Error, Exception, raise, try_catch};
///
/// let caught = try_catch(|| -> u32 { raise(Error::NoAutoreleasePool) });
/// assert_eq!(caught, Err(Exception::Runtime(Error::NoAutoreleasePool)));
///
/// assert_eq!(try_catch(|| 7), Ok(7));
/// ```
///
/// # Errors
///
/// Returns the exception if `f` threw one.
pub fn try_catch<R>(f: impl FnOnce() -> R) -> Result<R, Exception> {
    let frame = CatchFrame::enter();
    let outcome = panic::catch_unwind(AssertUnwindSafe(f));
    drop(frame);

    match outcome {
        Ok(value) => Ok(value),
        Err(payload) => match payload.downcast::<Thrown>() {
            Ok(thrown) => {
                debug!("caught {}", thrown.0);
                Err(thrown.0)
            }
            Err(other) => panic::resume_unwind(other),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::class::Class;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn test_catch_runtime_error() {
        let caught = try_catch(|| {
            raise(Error::RefCountOverflow);
        });
        assert_eq!(caught.unwrap_err().error(), Some(&Error::RefCountOverflow));
    }

    #[test]
    fn test_catch_object_and_unwind_releases() {
        let class = Class::new_root("ExceptionTestThrown").unwrap();
        let payload = Object::new(&class).unwrap();
        let scoped = Object::new(&class).unwrap();

        let thrown = payload.clone();
        let held = scoped.clone();
        let caught = try_catch(move || {
            let _held = held;
            throw(thrown);
        });

        let exception = caught.unwrap_err();
        assert_eq!(exception.object(), Some(&payload));
        assert_eq!(scoped.retain_count(), 1);
        drop(exception);
        assert_eq!(payload.retain_count(), 1);
    }

    #[test]
    fn test_nested_catch() {
        let outer = try_catch(|| {
            let inner = try_catch(|| {
                raise(Error::NoAutoreleasePool);
            });
            assert!(inner.is_err());
            raise(Error::RefCountOverflow);
        });
        assert_eq!(outer, Err(Exception::Runtime(Error::RefCountOverflow)));
        assert_eq!(CATCH_DEPTH.with(Cell::get), 0);
    }

    #[test]
    fn test_foreign_panic_passes_through() {
        let result = panic::catch_unwind(|| {
            let _ = try_catch(|| {
                panic!("not an exception");
            });
        });
        assert!(result.is_err());
        assert_eq!(CATCH_DEPTH.with(Cell::get), 0);
    }

    static HANDLER_RAN: AtomicBool = AtomicBool::new(false);

    fn note_uncaught(exception: &Exception) {
        if exception.error() == Some(&Error::OverRelease { class: "uncaught".into() }) {
            HANDLER_RAN.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_uncaught_handler() {
        let previous = set_uncaught_exception_handler(Some(note_uncaught));

        let joined = thread::spawn(|| {
            raise(Error::OverRelease {
                class: "uncaught".into(),
            });
        })
        .join();

        assert!(joined.is_err());
        assert!(HANDLER_RAN.load(Ordering::SeqCst));
        set_uncaught_exception_handler(previous);
    }
}
