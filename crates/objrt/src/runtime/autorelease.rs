//! Per-thread autorelease pools.
//!
//! Autoreleasing an object hands one of its references to the innermost
//! pool on the current thread; the reference is released when that pool is
//! drained. Pools nest as a stack and are drained in the order objects were
//! added. A pool left open when its thread exits is drained then.

use crate::error::{Error, Result};
use crate::runtime::object::{Object, ObjectPtr, release};
use objrt_log::{trace, warn};
use std::cell::RefCell;
use std::marker::PhantomData;

#[derive(Default)]
struct PoolStack {
    objects: Vec<ObjectPtr>,
    /// Start index in `objects` of each open pool, innermost last.
    frames: Vec<usize>,
}

impl Drop for PoolStack {
    fn drop(&mut self) {
        if !self.frames.is_empty() {
            trace!("thread exit: draining {} pending objects", self.objects.len());
        }
        self.frames.clear();
        for ptr in std::mem::take(&mut self.objects) {
            // SAFETY: every entry owns one reference
            unsafe { release(ptr) };
        }
    }
}

thread_local! {
    static POOLS: RefCell<PoolStack> = RefCell::new(PoolStack::default());
}

/// An open autorelease pool; drains when dropped.
///
/// Pools must be dropped in reverse order of creation, which scoping
/// guarantees. Dropping an outer pool first also drains the pools nested
/// in it.
///
/// # Example
///
/// ```rust
/// use objrt::{AutoreleasePool, Class, Object, autorelease};
///
/// let class = Class::new_root("DocPooled").unwrap();
/// let obj = Object::new(&class).unwrap();
/// let keep = obj.clone();
///
/// {
///     let _pool = AutoreleasePool::new();
///     autorelease(obj).unwrap();
///     assert_eq!(keep.retain_count(), 2);
/// }
/// assert_eq!(keep.retain_count(), 1);
/// ```
pub struct AutoreleasePool {
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

impl AutoreleasePool {
    #[must_use]
    pub fn new() -> Self {
        let depth = POOLS.with(|pools| {
            let mut pools = pools.borrow_mut();
            let start = pools.objects.len();
            pools.frames.push(start);
            pools.frames.len()
        });
        AutoreleasePool {
            depth,
            _not_send: PhantomData,
        }
    }

    /// Nesting depth of this pool, starting at 1.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl Default for AutoreleasePool {
    fn default() -> Self {
        AutoreleasePool::new()
    }
}

impl Drop for AutoreleasePool {
    fn drop(&mut self) {
        drain_to(self.depth - 1);
    }
}

/// Drains pools until only `depth` remain open.
///
/// Releases happen outside the borrow: teardown code may autorelease into
/// the pool being drained, and those objects are picked up by the next
/// round.
fn drain_to(depth: usize) {
    loop {
        let batch = POOLS.try_with(|pools| {
            let mut pools = pools.borrow_mut();
            let start = *pools.frames.get(depth..)?.last()?;
            if pools.objects.len() > start {
                Some(pools.objects.split_off(start))
            } else {
                pools.frames.pop();
                Some(Vec::new())
            }
        });

        match batch {
            Ok(Some(objects)) => {
                for ptr in objects {
                    // SAFETY: every entry owns one reference
                    unsafe { release(ptr) };
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
}

/// Runs `f` inside a fresh autorelease pool.
pub fn autoreleasepool<R>(f: impl FnOnce() -> R) -> R {
    let _pool = AutoreleasePool::new();
    f()
}

/// Hands `object`'s reference to the innermost pool on this thread.
///
/// The returned pointer stays valid until that pool drains.
///
/// # Errors
///
/// Returns [`Error::NoAutoreleasePool`] if no pool is open; the reference
/// is released immediately.
pub fn autorelease(object: Object) -> Result<ObjectPtr> {
    let ptr = object.into_raw();
    let queued = POOLS
        .try_with(|pools| {
            let mut pools = pools.borrow_mut();
            if pools.frames.is_empty() {
                return false;
            }
            pools.objects.push(ptr);
            true
        })
        .unwrap_or(false);

    if queued {
        return Ok(ptr);
    }

    warn!("autorelease of {:?} with no pool in place", ptr);
    // SAFETY: `object` owned this reference
    unsafe { release(ptr) };
    Err(Error::NoAutoreleasePool)
}

/// Retains `object` and autoreleases the new reference.
///
/// # Errors
///
/// As for [`autorelease`].
pub fn retain_autorelease(object: &Object) -> Result<ObjectPtr> {
    autorelease(object.clone())
}

/// Objects waiting in this thread's open pools.
#[must_use]
pub fn pending_count() -> usize {
    POOLS.try_with(|pools| pools.borrow().objects.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::class::{Class, Method};
    use crate::runtime::message::MessageArgs;
    use crate::runtime::selector::Selector;
    use parking_lot::Mutex;
    use std::str::FromStr;
    use std::thread;

    static ORDER: Mutex<Vec<u64>> = Mutex::new(Vec::new());

    fn record_dealloc(obj: &Object, _sel: &Selector, _args: &MessageArgs, _ret: &mut [u8]) {
        let tag = obj.class().ivar("tag").unwrap();
        ORDER.lock().push(unsafe { obj.get_ivar::<u64>(&tag).unwrap() });
    }

    fn tagged_class(name: &str) -> Class {
        let class = Class::allocate(None, name, 0).unwrap();
        class.add_ivar("tag", "Q").unwrap();
        class.register().unwrap();
        class
            .add_method(Method::new(Selector::from_str("dealloc").unwrap(), record_dealloc))
            .unwrap();
        class
    }

    fn tagged(class: &Class, tag: u64) -> Object {
        let obj = Object::new(class).unwrap();
        let ivar = class.ivar("tag").unwrap();
        unsafe { obj.set_ivar(&ivar, tag).unwrap() };
        obj
    }

    #[test]
    fn test_drain_in_registration_order() {
        let class = tagged_class("AutoreleaseTestOrder");
        ORDER.lock().clear();

        autoreleasepool(|| {
            for tag in 1..=3 {
                autorelease(tagged(&class, tag)).unwrap();
            }
            assert_eq!(pending_count(), 3);
            assert!(ORDER.lock().is_empty());
        });

        assert_eq!(*ORDER.lock(), vec![1, 2, 3]);
        assert_eq!(pending_count(), 0);
    }

    #[test]
    fn test_nested_pools() {
        let class = Class::new_root("AutoreleaseTestNested").unwrap();
        let obj = Object::new(&class).unwrap();

        let outer = AutoreleasePool::new();
        retain_autorelease(&obj).unwrap();
        {
            let inner = AutoreleasePool::new();
            assert_eq!(inner.depth(), outer.depth() + 1);
            retain_autorelease(&obj).unwrap();
            assert_eq!(obj.retain_count(), 3);
        }
        assert_eq!(obj.retain_count(), 2);
        drop(outer);
        assert_eq!(obj.retain_count(), 1);
    }

    #[test]
    fn test_without_pool_releases_immediately() {
        let class = Class::new_root("AutoreleaseTestNoPool").unwrap();
        let obj = Object::new(&class).unwrap();

        assert_eq!(retain_autorelease(&obj), Err(Error::NoAutoreleasePool));
        assert_eq!(obj.retain_count(), 1);
    }

    #[test]
    fn test_thread_exit_drains() {
        let class = Class::new_root("AutoreleaseTestThreadExit").unwrap();
        let obj = Object::new(&class).unwrap();

        let shared = obj.clone();
        thread::spawn(move || {
            let pool = AutoreleasePool::new();
            autorelease(shared).unwrap();
            std::mem::forget(pool);
        })
        .join()
        .unwrap();

        assert_eq!(obj.retain_count(), 1);
    }
}
