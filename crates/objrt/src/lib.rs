//! `objrt`: a dynamic object runtime for Rust
//!
//! `objrt` provides late-bound message dispatch over a class hierarchy that
//! is built and extended at runtime:
//!
//! - **Selectors** interned process-wide and compared by uid
//! - **Classes** with ivar layout, per-class methods, categories and
//!   protocols, registered by name, each paired with a metaclass holding
//!   its class methods
//! - **Dispatch** through per-class tables, invalidated on every method
//!   change, with forwarding for selectors nobody implements
//! - **Lifecycle** by reference counting, with zeroing weak references and
//!   per-thread autorelease pools
//! - **Exceptions** that unwind through Rust frames and a recursive
//!   per-object monitor
//!
//! # Architecture
//!
//! - **Public API Layer**: [`Class`], [`Object`], [`Selector`] and the free
//!   functions re-exported here
//! - **Runtime Layer**: [`runtime`], where each concern lives in its own
//!   module
//! - **Memory Layer**: `objrt-mem`, which owns the arena for names and
//!   encodings and the handle tables for classes and protocols
//!
//! Logging goes through `objrt-log`; set `OBJRT_LOG` and call
//! `objrt_log::init_from_env()` to raise the default `warn` level.
//!
//! # Example
//!
//! ```rust
//! use objrt::runtime::message::write_return;
//! use objrt::{Class, MessageArgs, Method, Object, Selector, send_message};
//!
//! fn answer(_obj: &Object, _sel: &Selector, _args: &MessageArgs, ret: &mut [u8]) {
//!     write_return(ret, 42usize);
//! }
//!
//! let class = Class::new_root("DocAnswer").unwrap();
//! let sel = Selector::with_types("answer", "Q@:").unwrap();
//! class.add_method(Method::new(sel, answer)).unwrap();
//!
//! let obj = Object::new(&class).unwrap();
//! assert_eq!(send_message(&obj, &sel, &MessageArgs::None).unwrap(), Some(42));
//! ```

pub mod error;
pub mod runtime;

// Re-export commonly used types
pub use error::{Error, Result};
pub use runtime::{
    AutoreleasePool, Category, Class, Exception, Imp, Ivar, MessageArgs, Method, Object,
    ObjectPtr, Protocol, Selector, SyncGuard, WeakRef,
    autorelease, autoreleasepool, raise, release, retain, retain_autorelease,
    send_class_message, send_message, send_message_stret, send_super, store_strong, sync_enter,
    sync_exit, synchronized, throw, try_catch,
};
