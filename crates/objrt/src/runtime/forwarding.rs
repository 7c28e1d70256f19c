// Message forwarding
//
// When a receiver's dispatch table has no entry for a selector, the send is
// resolved here, in priority order:
//
// 1. the per-class forwarding hook (searched up the superclass chain), which
//    may name a replacement receiver
// 2. the global forwarding hook, same contract
// 3. the global forward handler, an implementation invoked in place of the
//    missing one (separate handlers for scalar and struct returns)
//
// If none applies the send fails with `Error::UnrecognizedSelector`.
// Redirected sends run inside a `ForwardingScope`; a thread-local depth
// counter turns forwarding cycles into `Error::ForwardingLoopDetected`.

use crate::error::{Error, Result};
use crate::runtime::class::{Class, Imp};
use crate::runtime::object::Object;
use crate::runtime::selector::Selector;
use objrt_log::{debug, error, warn};
use parking_lot::RwLock;
use std::cell::Cell;

/// Per-class forwarding hook.
///
/// Called when an instance of the class (or a subclass without a hook of
/// its own) receives a selector it does not implement. Returning a target
/// re-sends the message to it.
pub type ClassForwardingHook = fn(receiver: &Object, sel: &Selector) -> Option<Object>;

/// Global forwarding hook, consulted after the per-class hooks.
pub type GlobalForwardingHook = fn(receiver: &Object, sel: &Selector) -> Option<Object>;

/// Callback observing forwarding activity.
pub type ForwardingEventCallback = fn(&ForwardingEvent);

/// Maximum nesting of redirected sends on one thread.
pub const MAX_FORWARDING_DEPTH: u32 = 32;

thread_local! {
    static FORWARDING_DEPTH: Cell<u32> = const { Cell::new(0) };
}

static GLOBAL_FORWARDING_HOOK: RwLock<Option<GlobalForwardingHook>> = RwLock::new(None);

static FORWARD_HANDLERS: RwLock<(Option<Imp>, Option<Imp>)> = RwLock::new((None, None));

static EVENT_CALLBACK: RwLock<Option<ForwardingEventCallback>> = RwLock::new(None);

/// Something that happened while resolving an unimplemented selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardingEvent {
    /// Resolution started.
    Attempt {
        class: Class,
        selector: Selector,
        depth: u32,
    },
    /// A hook supplied a replacement receiver.
    Redirected {
        class: Class,
        selector: Selector,
        target: Class,
    },
    /// The global forward handler took the send.
    Handled { class: Class, selector: Selector },
    /// Nothing could take the send.
    Unrecognized { class: Class, selector: Selector },
    /// The nesting limit was reached.
    LoopDetected {
        class: Class,
        selector: Selector,
        depth: u32,
    },
}

/// How an unimplemented selector will be handled.
pub(crate) enum Forwarded {
    /// Re-send to this receiver.
    Redirect(Object),
    /// Call this implementation with the original receiver.
    Handler(Imp),
}

/// Installs the global forward handlers, replacing any previous ones.
///
/// `forward` handles scalar sends and `forward_stret` struct-returning
/// sends. They are called with the original receiver, selector, arguments
/// and return buffer. Passing `None` removes a handler.
pub fn set_forward_handler(forward: Option<Imp>, forward_stret: Option<Imp>) {
    *FORWARD_HANDLERS.write() = (forward, forward_stret);
}

pub(crate) fn forward_handler(stret: bool) -> Option<Imp> {
    let handlers = FORWARD_HANDLERS.read();
    if stret { handlers.1 } else { handlers.0 }
}

/// Sets (or with `None`, clears) the global forwarding hook.
pub fn set_global_forwarding_hook(hook: Option<GlobalForwardingHook>) {
    *GLOBAL_FORWARDING_HOOK.write() = hook;
}

/// Sets (or with `None`, clears) the forwarding event callback.
pub fn set_forwarding_event_callback(callback: Option<ForwardingEventCallback>) {
    *EVENT_CALLBACK.write() = callback;
}

fn emit(event: ForwardingEvent) {
    let callback = *EVENT_CALLBACK.read();
    if let Some(callback) = callback {
        callback(&event);
    }
}

/// Current nesting of redirected sends on this thread.
#[must_use]
pub fn forwarding_depth() -> u32 {
    FORWARDING_DEPTH.with(Cell::get)
}

/// One level of redirected-send nesting, released on drop.
pub(crate) struct ForwardingScope {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl ForwardingScope {
    pub(crate) fn enter(class: Class, sel: &Selector) -> Result<Self> {
        let depth = FORWARDING_DEPTH.with(|depth| {
            let current = depth.get();
            if current < MAX_FORWARDING_DEPTH {
                depth.set(current + 1);
            }
            current
        });

        if depth >= MAX_FORWARDING_DEPTH {
            warn!(
                "forwarding loop: {} on {} at depth {}",
                sel.name(),
                class.name(),
                depth
            );
            emit(ForwardingEvent::LoopDetected {
                class,
                selector: *sel,
                depth,
            });
            return Err(Error::ForwardingLoopDetected {
                selector: sel.name().to_owned(),
                depth,
            });
        }

        Ok(ForwardingScope {
            _not_send: std::marker::PhantomData,
        })
    }
}

impl Drop for ForwardingScope {
    fn drop(&mut self) {
        FORWARDING_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Decides what happens to a send `receiver` has no implementation for.
pub(crate) fn resolve(receiver: &Object, sel: &Selector, stret: bool) -> Result<Forwarded> {
    let class = receiver.class();
    debug!("forwarding {} sent to {}", sel.name(), class.name());
    emit(ForwardingEvent::Attempt {
        class,
        selector: *sel,
        depth: forwarding_depth(),
    });

    let hook = class.forwarding_hook();
    let global = *GLOBAL_FORWARDING_HOOK.read();
    let target = hook
        .and_then(|hook| hook(receiver, sel))
        .or_else(|| global.and_then(|hook| hook(receiver, sel)));

    if let Some(target) = target {
        emit(ForwardingEvent::Redirected {
            class,
            selector: *sel,
            target: target.class(),
        });
        return Ok(Forwarded::Redirect(target));
    }

    if let Some(handler) = forward_handler(stret) {
        emit(ForwardingEvent::Handled {
            class,
            selector: *sel,
        });
        return Ok(Forwarded::Handler(handler));
    }

    error!(
        "unrecognized selector {} sent to instance of {}",
        sel.name(),
        class.name()
    );
    emit(ForwardingEvent::Unrecognized {
        class,
        selector: *sel,
    });
    Err(Error::UnrecognizedSelector {
        class: class.name().to_owned(),
        selector: sel.name().to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarding_scope_depth() {
        let class = Class::new_root("ForwardingTestScope").unwrap();
        let sel: Selector = "forwardingTestScope".parse().unwrap();

        assert_eq!(forwarding_depth(), 0);
        {
            let _outer = ForwardingScope::enter(class, &sel).unwrap();
            assert_eq!(forwarding_depth(), 1);
            {
                let _inner = ForwardingScope::enter(class, &sel).unwrap();
                assert_eq!(forwarding_depth(), 2);
            }
            assert_eq!(forwarding_depth(), 1);
        }
        assert_eq!(forwarding_depth(), 0);
    }

    #[test]
    fn test_forwarding_scope_limit() {
        let class = Class::new_root("ForwardingTestLimit").unwrap();
        let sel: Selector = "forwardingTestLimit".parse().unwrap();

        let scopes: Vec<_> = (0..MAX_FORWARDING_DEPTH)
            .map(|_| ForwardingScope::enter(class, &sel).unwrap())
            .collect();
        assert!(matches!(
            ForwardingScope::enter(class, &sel),
            Err(Error::ForwardingLoopDetected { depth: 32, .. })
        ));
        drop(scopes);
        assert_eq!(forwarding_depth(), 0);
    }
}
