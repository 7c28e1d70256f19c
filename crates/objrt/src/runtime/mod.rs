//! `objrt` runtime module.
//!
//! - [`selector`]: selector interning
//! - [`encoding`]: type encoding strings
//! - [`class`]: type registry, ivar layout and the initialization barrier
//! - [`category`]: method sets attached to an existing class
//! - [`protocol`]: interface contracts and conformance
//! - [`dispatch`]: dispatch tables and message sending
//! - [`forwarding`]: the paths taken when a selector has no implementation
//! - [`message`]: argument packs and return buffers
//! - [`object`]: allocation, reference counting and teardown
//! - [`weak`]: zeroing weak references
//! - [`autorelease`]: per-thread autorelease pools
//! - [`exception`]: throwing, catching and the uncaught handler
//! - [`enumeration`]: reporting mutation during enumeration
//! - [`sync`]: recursive per-object monitors
//! - [`property`]: ivar accessors with optional atomicity
//!
//! Names and encodings live for the whole program in the
//! [`objrt_mem::global_arena`]; classes and protocols are addressed through
//! `u32` handles into [`objrt_mem::HandleArena`]s.

pub mod autorelease;
pub mod category;
pub mod class;
pub mod dispatch;
pub mod encoding;
pub mod enumeration;
pub mod exception;
pub mod forwarding;
pub mod message;
pub mod object;
pub mod property;
pub mod protocol;
pub mod selector;
pub mod sync;
pub mod weak;

pub use autorelease::{AutoreleasePool, autorelease, autoreleasepool, retain_autorelease};
pub use category::Category;
pub use class::{Class, Imp, Ivar, Method};
pub use dispatch::{
    msg_lookup, msg_lookup_stret, send_class_message, send_message, send_message_stret, send_super,
};
pub use enumeration::{
    EnumerationMutationHandler, enumeration_mutation, set_enumeration_mutation_handler,
};
pub use exception::{
    Exception, UncaughtExceptionHandler, raise, set_uncaught_exception_handler, throw, try_catch,
};
pub use forwarding::{ForwardingEvent, set_forward_handler, set_forwarding_event_callback};
pub use message::MessageArgs;
pub use object::{Object, ObjectPtr, release, retain, store_strong};
pub use property::{get_property, get_property_struct, set_property, set_property_struct};
pub use protocol::Protocol;
pub use selector::Selector;
pub use sync::{SyncGuard, sync_enter, sync_exit, synchronized};
pub use weak::WeakRef;

use std::alloc::{Layout, handle_alloc_error};

/// Hash map used by the runtime's hot tables.
pub(crate) type FastMap<K, V> = hashbrown::HashMap<K, V, fxhash::FxBuildHasher>;

/// Copies `s` into the global arena.
///
/// Arena exhaustion is treated like any other allocation failure.
pub(crate) fn intern_str(s: &str) -> &'static str {
    match objrt_mem::global_arena().alloc_str(s) {
        Ok(interned) => interned,
        Err(e) => {
            objrt_log::error!("{}", e);
            handle_alloc_error(Layout::from_size_align(e.requested, 1).unwrap_or(Layout::new::<u8>()))
        }
    }
}

/// Reports exhaustion of a handle space and aborts the caller.
pub(crate) fn handles_exhausted(what: &str) -> ! {
    objrt_log::error!("{} handle space exhausted", what);
    panic!("{what} handle space exhausted");
}
