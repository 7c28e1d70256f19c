//! Per-object recursive monitors.
//!
//! [`sync_enter`] acquires a monitor keyed by the object's address, creating
//! it on first use; the owning thread may enter again without blocking.
//! [`sync_exit`] undoes one enter. The monitor is discarded once no thread
//! holds or waits for it.
//!
//! The monitor table lock is only held to find or create an entry and to
//! count its users; waiting for a monitor happens outside it.

use crate::error::{Error, Result};
use crate::runtime::FastMap;
use crate::runtime::object::Object;
use objrt_log::{trace, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, LazyLock};
use std::thread::{self, ThreadId};

#[derive(Default)]
struct MonitorState {
    owner: Option<ThreadId>,
    depth: usize,
}

#[derive(Default)]
struct Monitor {
    state: Mutex<MonitorState>,
    released: Condvar,
}

struct Entry {
    monitor: Arc<Monitor>,
    /// Threads holding or waiting for the monitor.
    users: usize,
}

static MONITORS: LazyLock<Mutex<FastMap<usize, Entry>>> =
    LazyLock::new(|| Mutex::new(FastMap::default()));

/// Acquires the monitor for `object`, blocking while another thread holds
/// it. Never fails.
pub fn sync_enter(object: &Object) {
    let key = object.as_ptr().addr();
    let me = thread::current().id();

    let monitor = {
        let mut table = MONITORS.lock();
        let entry = table.entry(key).or_insert_with(|| Entry {
            monitor: Arc::default(),
            users: 0,
        });
        entry.users += 1;
        Arc::clone(&entry.monitor)
    };

    let mut state = monitor.state.lock();
    if state.owner == Some(me) {
        state.depth += 1;
        // A re-entry is not a new user
        drop(state);
        if let Some(entry) = MONITORS.lock().get_mut(&key) {
            entry.users -= 1;
        }
        return;
    }

    while state.owner.is_some() {
        monitor.released.wait(&mut state);
    }
    state.owner = Some(me);
    state.depth = 1;
    trace!("monitor {:#x} acquired", key);
}

/// Releases one level of the monitor for `object`.
///
/// # Errors
///
/// Returns [`Error::UnlockFailed`] if the current thread does not hold the
/// monitor.
pub fn sync_exit(object: &Object) -> Result<()> {
    let key = object.as_ptr().addr();
    let me = thread::current().id();

    let mut table = MONITORS.lock();
    let Some(entry) = table.get_mut(&key) else {
        warn!("sync_exit on {:#x} without a matching sync_enter", key);
        return Err(Error::UnlockFailed { object: key });
    };

    {
        let mut state = entry.monitor.state.lock();
        if state.owner != Some(me) {
            warn!("sync_exit on {:#x} from a thread that does not hold it", key);
            return Err(Error::UnlockFailed { object: key });
        }
        state.depth -= 1;
        if state.depth > 0 {
            return Ok(());
        }
        state.owner = None;
        entry.monitor.released.notify_one();
    }

    entry.users -= 1;
    if entry.users == 0 {
        table.remove(&key);
    }
    trace!("monitor {:#x} released", key);
    Ok(())
}

/// Holds the monitor for an object until dropped.
#[must_use = "the monitor is released when the guard is dropped"]
pub struct SyncGuard<'a> {
    object: &'a Object,
}

impl<'a> SyncGuard<'a> {
    /// Enters the monitor for `object`.
    pub fn new(object: &'a Object) -> Self {
        sync_enter(object);
        SyncGuard { object }
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        let _ = sync_exit(self.object);
    }
}

/// Runs `f` while holding the monitor for `object`.
///
/// The monitor is released even if `f` throws.
///
/// # Example
///
/// ```rust
/// use objrt::{Class, Object, synchronized};
///
/// let class = Class::new_root("DocLocked").unwrap();
/// let obj = Object::new(&class).unwrap();
/// let answer = synchronized(&obj, || synchronized(&obj, || 42));
/// assert_eq!(answer, 42);
/// ```
pub fn synchronized<R>(object: &Object, f: impl FnOnce() -> R) -> R {
    let _guard = SyncGuard::new(object);
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::class::Class;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn monitor_count(object: &Object) -> usize {
        MONITORS
            .lock()
            .get(&object.as_ptr().addr())
            .map_or(0, |entry| entry.users)
    }

    #[test]
    fn test_recursive_enter() {
        let class = Class::new_root("SyncTestRecursive").unwrap();
        let obj = Object::new(&class).unwrap();

        sync_enter(&obj);
        sync_enter(&obj);
        assert_eq!(monitor_count(&obj), 1);
        sync_exit(&obj).unwrap();
        assert_eq!(monitor_count(&obj), 1);
        sync_exit(&obj).unwrap();
        assert_eq!(monitor_count(&obj), 0);
    }

    #[test]
    fn test_exit_without_enter() {
        let class = Class::new_root("SyncTestUnbalanced").unwrap();
        let obj = Object::new(&class).unwrap();

        assert!(matches!(sync_exit(&obj), Err(Error::UnlockFailed { .. })));
    }

    #[test]
    fn test_exit_from_other_thread() {
        let class = Class::new_root("SyncTestWrongThread").unwrap();
        let obj = Object::new(&class).unwrap();

        sync_enter(&obj);
        let other = obj.clone();
        let result = thread::spawn(move || sync_exit(&other)).join().unwrap();
        assert!(matches!(result, Err(Error::UnlockFailed { .. })));
        sync_exit(&obj).unwrap();
    }

    #[test]
    fn test_mutual_exclusion() {
        let class = Class::new_root("SyncTestExclusion").unwrap();
        let obj = Object::new(&class).unwrap();
        let inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let obj = obj.clone();
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..200 {
                        synchronized(&obj, || {
                            assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                            inside.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(monitor_count(&obj), 0);
    }
}
