//! Zeroing weak references.
//!
//! A weak slot holds an object address without owning a reference. Every
//! non-null slot is recorded in a side table keyed by the object's address;
//! when the object's count reaches zero, teardown zeroes all of its slots
//! before anything else happens, so a load can never observe a destroyed
//! object.
//!
//! The table is split into stripes, each with its own mutex. A load locks
//! the stripe of the address it read, checks the slot still holds it, and
//! retains only if the count is still nonzero. Teardown zeroes slots under
//! the same lock, so a load either wins a reference before the count hits
//! zero or sees the slot cleared.
//!
//! [`WeakRef`] wraps a boxed slot for ordinary use. The `weak_*` functions
//! expose the raw slot operations for slots embedded in other storage.

use crate::error::Result;
use crate::runtime::FastMap;
use crate::runtime::autorelease;
use crate::runtime::object::{DEALLOCATING, Object, ObjectHeader, ObjectPtr, WEAKLY_REFERENCED};
use objrt_log::trace;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::ptr;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicPtr, Ordering};

const WEAK_STRIPES: usize = 64;

/// Object address -> addresses of the slots pointing at it.
type SlotTable = FastMap<usize, Vec<usize>>;

static WEAK_TABLE: LazyLock<[Mutex<SlotTable>; WEAK_STRIPES]> =
    LazyLock::new(|| std::array::from_fn(|_| Mutex::new(SlotTable::default())));

fn stripe(addr: usize) -> MutexGuard<'static, SlotTable> {
    let index = fxhash::hash64(&addr) as usize & (WEAK_STRIPES - 1);
    WEAK_TABLE[index].lock()
}

/// Storage for one weak reference.
///
/// A registered slot must not move until [`weak_destroy`] (or
/// [`weak_move`] away from it) has run.
#[repr(transparent)]
pub struct WeakSlot(AtomicPtr<ObjectHeader>);

impl WeakSlot {
    /// An empty slot. Not registered anywhere, so it may be moved freely.
    #[must_use]
    pub const fn new() -> Self {
        WeakSlot(AtomicPtr::new(ptr::null_mut()))
    }

    fn addr(&self) -> usize {
        ptr::from_ref(self) as usize
    }

    fn current(&self) -> *mut ObjectHeader {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for WeakSlot {
    fn default() -> Self {
        WeakSlot::new()
    }
}

/// Points `slot` at `object`, which the caller keeps alive.
///
/// An object already in teardown (reachable only from its own `dealloc`)
/// is not registered; the slot stays null.
fn attach(slot: &WeakSlot, object: &Object) {
    let target = object.as_ptr();
    let mut table = stripe(target.addr());

    // SAFETY: object is alive for the duration of this call
    let header = unsafe { target.header() };
    if header.flags.load(Ordering::Acquire) & DEALLOCATING != 0 {
        slot.0.store(ptr::null_mut(), Ordering::Release);
        return;
    }

    header.flags.fetch_or(WEAKLY_REFERENCED, Ordering::AcqRel);
    table.entry(target.addr()).or_default().push(slot.addr());
    slot.0.store(target.as_raw(), Ordering::Release);
}

/// Unregisters `slot` and leaves it null.
fn detach(slot: &WeakSlot) {
    let current = slot.current();
    if current.is_null() {
        return;
    }

    let addr = current as usize;
    let mut table = stripe(addr);
    // Teardown may have zeroed the slot (and dropped the entry) meanwhile
    if slot.current() != current {
        return;
    }
    if let Some(slots) = table.get_mut(&addr) {
        slots.retain(|s| *s != slot.addr());
        if slots.is_empty() {
            table.remove(&addr);
        }
    }
    slot.0.store(ptr::null_mut(), Ordering::Release);
}

fn load(slot: &WeakSlot) -> Option<Object> {
    loop {
        let current = slot.current();
        if current.is_null() {
            return None;
        }

        let _table = stripe(current as usize);
        if slot.current() != current {
            continue;
        }

        // SAFETY: the slot still names the object under its stripe lock, so
        // teardown has not reached the zeroing step and the storage is live
        let header = unsafe { &*current };
        let mut count = header.refcount.load(Ordering::Relaxed);
        loop {
            if count == 0 {
                return None;
            }
            match header.refcount.compare_exchange_weak(
                count,
                count + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let ptr = ObjectPtr::from_addr(current as usize)?;
                    // SAFETY: the reference was just taken
                    return Some(unsafe { Object::from_raw(ptr) });
                }
                Err(actual) => count = actual,
            }
        }
    }
}

/// Zeroes every weak slot registered for `ptr`.
///
/// # Safety
///
/// `ptr` must be an object in teardown, with a count of zero.
pub(crate) unsafe fn clear_weak_references(ptr: ObjectPtr) {
    // SAFETY: teardown has not freed the storage yet
    let header = unsafe { ptr.header() };
    if header.flags.load(Ordering::Acquire) & WEAKLY_REFERENCED == 0 {
        return;
    }

    let mut table = stripe(ptr.addr());
    if let Some(slots) = table.remove(&ptr.addr()) {
        trace!("zeroing {} weak slots for {:?}", slots.len(), ptr);
        for slot in slots {
            // SAFETY: registered slots stay put until they are detached,
            // which needs this lock
            unsafe { (*(slot as *const WeakSlot)).0.store(ptr::null_mut(), Ordering::Release) };
        }
    }
}

/// Initializes an uninitialized (or empty) slot to point at `value`.
///
/// # Safety
///
/// `slot` must be valid, not currently registered, and must not move until
/// it is destroyed.
pub unsafe fn weak_init(slot: *const WeakSlot, value: Option<&Object>) {
    // SAFETY: upheld by the caller
    let slot = unsafe { &*slot };
    slot.0.store(ptr::null_mut(), Ordering::Relaxed);
    if let Some(object) = value {
        attach(slot, object);
    }
}

/// Repoints an initialized slot.
///
/// # Safety
///
/// `slot` must have been initialized with [`weak_init`] and must not be
/// written by another thread concurrently.
pub unsafe fn weak_store(slot: *const WeakSlot, value: Option<&Object>) {
    // SAFETY: upheld by the caller
    let slot = unsafe { &*slot };
    detach(slot);
    if let Some(object) = value {
        attach(slot, object);
    }
}

/// Loads the referent with a new strong reference, or `None` if it is gone.
///
/// # Safety
///
/// `slot` must have been initialized with [`weak_init`].
pub unsafe fn weak_load_retained(slot: *const WeakSlot) -> Option<Object> {
    // SAFETY: upheld by the caller
    load(unsafe { &*slot })
}

/// Loads the referent and hands the strong reference to the current
/// autorelease pool.
///
/// # Safety
///
/// As for [`weak_load_retained`]. The returned pointer is valid until the
/// pool drains.
///
/// # Errors
///
/// Returns [`Error::NoAutoreleasePool`](crate::Error::NoAutoreleasePool) if
/// no pool is in place; the reference is released immediately.
pub unsafe fn weak_load(slot: *const WeakSlot) -> Result<Option<ObjectPtr>> {
    // SAFETY: upheld by the caller
    match unsafe { weak_load_retained(slot) } {
        Some(object) => autorelease::autorelease(object).map(Some),
        None => Ok(None),
    }
}

/// Unregisters a slot before its storage goes away.
///
/// # Safety
///
/// `slot` must have been initialized with [`weak_init`].
pub unsafe fn weak_destroy(slot: *const WeakSlot) {
    // SAFETY: upheld by the caller
    detach(unsafe { &*slot });
}

/// Initializes `dest` to the current referent of `src`.
///
/// # Safety
///
/// `src` must be initialized; `dest` must satisfy the [`weak_init`]
/// contract.
pub unsafe fn weak_copy(dest: *const WeakSlot, src: *const WeakSlot) {
    // SAFETY: upheld by the caller
    let object = unsafe { weak_load_retained(src) };
    // SAFETY: upheld by the caller
    unsafe { weak_init(dest, object.as_ref()) };
}

/// Initializes `dest` to the referent of `src` and leaves `src` empty.
///
/// # Safety
///
/// As for [`weak_copy`]. `src` stays initialized (and null).
pub unsafe fn weak_move(dest: *const WeakSlot, src: *const WeakSlot) {
    // SAFETY: upheld by the caller
    unsafe {
        weak_copy(dest, src);
        weak_destroy(src);
    }
}

/// An owned zeroing weak reference.
///
/// # Example
///
/// ```rust
/// use objrt::{Class, Object, WeakRef};
///
/// let class = Class::new_root("DocWeakTarget").unwrap();
/// let obj = Object::new(&class).unwrap();
/// let weak = WeakRef::new(&obj);
///
/// assert_eq!(weak.load(), Some(obj.clone()));
/// drop(obj);
/// assert_eq!(weak.load(), None);
/// ```
pub struct WeakRef {
    slot: Box<WeakSlot>,
}

impl WeakRef {
    #[must_use]
    pub fn new(object: &Object) -> Self {
        let weak = WeakRef::empty();
        attach(&weak.slot, object);
        weak
    }

    /// A weak reference to nothing.
    #[must_use]
    pub fn empty() -> Self {
        WeakRef {
            slot: Box::new(WeakSlot::new()),
        }
    }

    /// A strong reference to the referent, if it is still alive.
    #[must_use]
    pub fn load(&self) -> Option<Object> {
        load(&self.slot)
    }

    pub fn store(&mut self, object: Option<&Object>) {
        detach(&self.slot);
        if let Some(object) = object {
            attach(&self.slot, object);
        }
    }

    /// Moves the referent into a new `WeakRef`, leaving this one empty.
    #[must_use]
    pub fn take(&mut self) -> WeakRef {
        let moved = WeakRef::empty();
        // SAFETY: both slots are boxed, initialized and owned here
        unsafe { weak_move(&*moved.slot, &*self.slot) };
        moved
    }

    /// Returns true once the referent has been torn down (or if there never
    /// was one).
    #[must_use]
    pub fn is_cleared(&self) -> bool {
        self.slot.current().is_null()
    }
}

impl Clone for WeakRef {
    fn clone(&self) -> Self {
        let copy = WeakRef::empty();
        // SAFETY: both slots are boxed and initialized
        unsafe { weak_copy(&*copy.slot, &*self.slot) };
        copy
    }
}

impl Drop for WeakRef {
    fn drop(&mut self) {
        detach(&self.slot);
    }
}

impl Default for WeakRef {
    fn default() -> Self {
        WeakRef::empty()
    }
}

impl fmt::Debug for WeakRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakRef")
            .field("target", &self.slot.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::autorelease::AutoreleasePool;
    use crate::runtime::class::{Class, Method};
    use crate::runtime::message::MessageArgs;
    use crate::runtime::selector::Selector;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_weak_zeroing() {
        let class = Class::new_root("WeakTestZeroing").unwrap();
        let obj = Object::new(&class).unwrap();
        let first = WeakRef::new(&obj);
        let second = first.clone();

        assert_eq!(first.load().as_ref(), Some(&obj));
        assert_eq!(obj.retain_count(), 1);

        drop(obj);
        assert!(first.is_cleared());
        assert!(second.load().is_none());
    }

    #[test]
    fn test_weak_store_and_take() {
        let class = Class::new_root("WeakTestStore").unwrap();
        let a = Object::new(&class).unwrap();
        let b = Object::new(&class).unwrap();

        let mut weak = WeakRef::new(&a);
        weak.store(Some(&b));
        assert_eq!(weak.load(), Some(b.clone()));

        // The old registration is gone: dropping `a` leaves the slot alone
        drop(a);
        assert_eq!(weak.load(), Some(b.clone()));

        let moved = weak.take();
        assert!(weak.is_cleared());
        assert_eq!(moved.load(), Some(b.clone()));

        weak.store(None);
        drop(b);
        assert!(moved.is_cleared());
    }

    #[test]
    fn test_raw_slot_load_autoreleased() {
        let class = Class::new_root("WeakTestRawSlot").unwrap();
        let obj = Object::new(&class).unwrap();
        let slot = WeakSlot::new();

        unsafe {
            weak_init(&slot, Some(&obj));
            {
                let _pool = AutoreleasePool::new();
                let loaded = weak_load(&slot).unwrap();
                assert_eq!(loaded, Some(obj.as_ptr()));
                assert_eq!(obj.retain_count(), 2);
            }
            assert_eq!(obj.retain_count(), 1);
            weak_destroy(&slot);
        }
        drop(obj);
        assert!(slot.current().is_null());
    }

    static SAW_CLEARED: AtomicBool = AtomicBool::new(false);

    fn observe_dealloc(obj: &Object, _sel: &Selector, _args: &MessageArgs, _ret: &mut [u8]) {
        // Registering a weak reference from teardown yields an empty slot
        let fresh = WeakRef::new(obj);
        SAW_CLEARED.store(fresh.is_cleared(), Ordering::SeqCst);
    }

    #[test]
    fn test_weak_during_dealloc_stays_null() {
        let class = Class::new_root("WeakTestDuringDealloc").unwrap();
        class
            .add_method(Method::new(Selector::from_str("dealloc").unwrap(), observe_dealloc))
            .unwrap();

        drop(Object::new(&class).unwrap());
        assert!(SAW_CLEARED.load(Ordering::SeqCst));
    }

    #[test]
    fn test_concurrent_load_and_release() {
        let class = Class::new_root("WeakTestRace").unwrap();

        for _ in 0..50 {
            let obj = Object::new(&class).unwrap();
            let weak = Arc::new(WeakRef::new(&obj));
            let barrier = Arc::new(Barrier::new(5));
            let loaded = Arc::new(AtomicUsize::new(0));

            let readers: Vec<_> = (0..4)
                .map(|_| {
                    let weak = Arc::clone(&weak);
                    let barrier = Arc::clone(&barrier);
                    let loaded = Arc::clone(&loaded);
                    thread::spawn(move || {
                        barrier.wait();
                        for _ in 0..100 {
                            if let Some(strong) = weak.load() {
                                assert!(strong.retain_count() >= 1);
                                loaded.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    })
                })
                .collect();

            barrier.wait();
            drop(obj);
            for reader in readers {
                reader.join().unwrap();
            }
            assert!(weak.load().is_none());
        }
    }
}
