//! Object allocation and reference counting for the `objrt` runtime.
//!
//! Every object is one heap block: an [`ObjectHeader`] followed by the
//! instance storage of its class, zeroed at allocation. The header holds the
//! class handle, the reference count and lifecycle flags.
//!
//! # Lifecycle
//!
//! ```text
//! allocated (count 1) -> retain/release* -> count reaches 0
//!   -> weak slots zeroed -> `dealloc` message -> object ivars released
//!   -> storage freed
//! ```
//!
//! Counting uses the same orderings as `std::sync::Arc`: relaxed increments,
//! release decrements and an acquire fence before teardown. Releasing more
//! often than retaining, or overflowing the count, is fatal.
//!
//! [`Object`] is an owning handle: cloning retains, dropping releases. The
//! raw [`retain`]/[`release`]/[`store_strong`] intrinsics work on
//! [`ObjectPtr`]s for code that manages ownership by hand.

use crate::error::{Error, Result};
use crate::runtime::class::{Class, Ivar};
use crate::runtime::dispatch;
use crate::runtime::message::{MessageArgs, SCALAR_RETURN_SIZE};
use crate::runtime::selector::Selector;
use crate::runtime::weak;
use objrt_log::{error, trace};
use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::mem::{self, ManuallyDrop};
use std::ptr::NonNull;
use std::sync::LazyLock;
use std::sync::atomic::{self, AtomicU32, Ordering};

/// Teardown has started; the count has reached zero.
pub(crate) const DEALLOCATING: u32 = 1 << 0;
/// At least one weak slot has been registered for the object.
pub(crate) const WEAKLY_REFERENCED: u32 = 1 << 1;

/// Header at the start of every object.
#[repr(C, align(16))]
pub(crate) struct ObjectHeader {
    class: AtomicU32,
    pub(crate) flags: AtomicU32,
    pub(crate) refcount: AtomicU32,
    _reserved: u32,
    /// Bytes of instance storage allocated after the header.
    storage: usize,
}

const HEADER_SIZE: usize = mem::size_of::<ObjectHeader>();
const OBJECT_ALIGN: usize = mem::align_of::<ObjectHeader>();

static DEALLOC: LazyLock<Selector> = LazyLock::new(|| Selector::named("dealloc"));

/// A raw, non-owning object address.
///
/// Holding an `ObjectPtr` does not keep the object alive. Converting it back
/// into an [`Object`] or passing it to [`retain`]/[`release`] is `unsafe`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ObjectPtr(NonNull<ObjectHeader>);

// SAFETY: an ObjectPtr is an address; all shared state behind it is atomic
unsafe impl Send for ObjectPtr {}
// SAFETY: as above
unsafe impl Sync for ObjectPtr {}

impl ObjectPtr {
    /// The object's address, usable as an identity key.
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Rebuilds a pointer from an address produced by [`ObjectPtr::addr`].
    ///
    /// Returns `None` for zero.
    #[must_use]
    pub fn from_addr(addr: usize) -> Option<ObjectPtr> {
        NonNull::new(addr as *mut ObjectHeader).map(ObjectPtr)
    }

    pub(crate) fn as_raw(self) -> *mut ObjectHeader {
        self.0.as_ptr()
    }

    /// # Safety
    ///
    /// The object must not have been freed.
    pub(crate) unsafe fn header<'a>(self) -> &'a ObjectHeader {
        // SAFETY: upheld by the caller
        unsafe { self.0.as_ref() }
    }
}

impl fmt::Debug for ObjectPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectPtr({:#x})", self.addr())
    }
}

/// An owned, strong reference to an object.
///
/// # Example
///
/// ```rust
/// use objrt::{Class, Object};
///
/// let class = Class::new_root("DocWidget").unwrap();
/// let obj = Object::new(&class).unwrap();
/// assert_eq!(obj.retain_count(), 1);
///
/// let second = obj.clone();
/// assert_eq!(obj.retain_count(), 2);
/// assert_eq!(obj, second);
///
/// drop(second);
/// assert_eq!(obj.retain_count(), 1);
/// ```
pub struct Object {
    ptr: ObjectPtr,
}

// SAFETY: reference counting and flags are atomic; instance storage is only
// reached through accessors whose contracts cover concurrent use
unsafe impl Send for Object {}
// SAFETY: as above
unsafe impl Sync for Object {}

impl Object {
    /// Allocates a zeroed instance of `class` with a reference count of 1.
    ///
    /// Runs the class's initialization barrier first.
    ///
    /// # Errors
    ///
    /// - [`Error::ClassNotRegistered`] if `class` is not registered
    /// - [`Error::NotInstantiable`] if `class` is a metaclass; use
    ///   [`Class::class_object`]
    /// - [`Error::OutOfMemory`] if the instance size cannot be laid out
    ///
    /// An allocator failure is fatal, as for any other allocation.
    pub fn new(class: &Class) -> Result<Object> {
        if class.is_meta() {
            return Err(Error::NotInstantiable {
                class: class.name().to_owned(),
            });
        }
        Object::allocate(class)
    }

    pub(crate) fn allocate(class: &Class) -> Result<Object> {
        if !class.is_registered() {
            return Err(Error::ClassNotRegistered {
                name: class.name().to_owned(),
            });
        }
        class.ensure_initialized();

        let storage = class.instance_size();
        let layout = HEADER_SIZE
            .checked_add(storage)
            .and_then(|size| Layout::from_size_align(size, OBJECT_ALIGN).ok())
            .ok_or(Error::OutOfMemory)?;

        // SAFETY: layout has non-zero size (the header is never empty)
        let raw = unsafe { alloc_zeroed(layout) }.cast::<ObjectHeader>();
        let Some(raw) = NonNull::new(raw) else {
            handle_alloc_error(layout)
        };

        // SAFETY: raw is a fresh, suitably aligned allocation for the header
        unsafe {
            raw.as_ptr().write(ObjectHeader {
                class: AtomicU32::new(class.id()),
                flags: AtomicU32::new(0),
                refcount: AtomicU32::new(1),
                _reserved: 0,
                storage,
            });
        }

        trace!("allocated {} at {:p}", class.name(), raw);
        Ok(Object { ptr: ObjectPtr(raw) })
    }

    fn header(&self) -> &ObjectHeader {
        // SAFETY: an Object owns a reference, so the object is alive
        unsafe { self.ptr.header() }
    }

    #[must_use]
    pub fn as_ptr(&self) -> ObjectPtr {
        self.ptr
    }

    /// Gives up ownership without releasing, returning the raw pointer.
    #[must_use]
    pub fn into_raw(self) -> ObjectPtr {
        ManuallyDrop::new(self).ptr
    }

    /// Takes ownership of one reference held through `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live object and the caller must own one
    /// reference to it, which moves into the returned `Object`.
    #[must_use]
    pub unsafe fn from_raw(ptr: ObjectPtr) -> Object {
        Object { ptr }
    }

    /// Retains `ptr` and wraps the new reference.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live object.
    #[must_use]
    pub unsafe fn retained(ptr: ObjectPtr) -> Object {
        // SAFETY: upheld by the caller
        unsafe { Object::from_raw(retain(ptr)) }
    }

    /// Views `ptr` as an `Object` without touching its count.
    ///
    /// # Safety
    ///
    /// `ptr` must point to an object that stays allocated while the result
    /// is in use.
    pub(crate) unsafe fn borrowed(ptr: ObjectPtr) -> ManuallyDrop<Object> {
        ManuallyDrop::new(Object { ptr })
    }

    /// The object's current class.
    #[must_use]
    pub fn class(&self) -> Class {
        let id = self.header().class.load(Ordering::Acquire);
        match Class::from_id(id) {
            Some(class) => class,
            None => unreachable!("object {:?} has no class", self.ptr),
        }
    }

    /// Replaces the object's class, returning the previous one.
    ///
    /// # Errors
    ///
    /// - [`Error::ClassNotRegistered`] if `class` is not registered
    /// - [`Error::NotInstantiable`] if `class` is a metaclass or this is a
    ///   class object
    /// - [`Error::InstanceSizeMismatch`] if `class` needs more instance
    ///   storage than this object was allocated with
    /// - [`Error::IncompatibleLayout`] if `class` keeps object references
    ///   at other offsets than the current class
    pub fn set_class(&self, class: &Class) -> Result<Class> {
        if !class.is_registered() {
            return Err(Error::ClassNotRegistered {
                name: class.name().to_owned(),
            });
        }
        if class.is_meta() || self.class().is_meta() {
            return Err(Error::NotInstantiable {
                class: class.name().to_owned(),
            });
        }
        let available = self.header().storage;
        if class.instance_size() > available {
            return Err(Error::InstanceSizeMismatch {
                class: class.name().to_owned(),
                required: class.instance_size(),
                available,
            });
        }
        if object_offsets(class) != object_offsets(&self.class()) {
            return Err(Error::IncompatibleLayout {
                class: class.name().to_owned(),
            });
        }
        class.ensure_initialized();

        let old = self.header().class.swap(class.id(), Ordering::AcqRel);
        trace!("{:?} changed class to {}", self.ptr, class.name());
        Ok(Class::from_id(old).unwrap_or(*class))
    }

    /// Current reference count. Racy by nature; use for diagnostics.
    #[must_use]
    pub fn retain_count(&self) -> u32 {
        self.header().refcount.load(Ordering::Relaxed)
    }

    /// Returns true if the object's class is `class` or a subclass of it.
    #[must_use]
    pub fn is_kind_of(&self, class: &Class) -> bool {
        self.class().is_subclass_of(class)
    }

    #[must_use]
    pub fn responds_to(&self, sel: &Selector) -> bool {
        self.class().responds_to(sel)
    }

    /// Sends a message to this object; see [`dispatch::send_message`].
    ///
    /// # Errors
    ///
    /// As for [`dispatch::send_message`].
    pub fn send(&self, sel: &Selector, args: &MessageArgs) -> Result<Option<usize>> {
        dispatch::send_message(self, sel, args)
    }

    /// Bytes of instance storage this object was allocated with.
    #[must_use]
    pub fn storage_size(&self) -> usize {
        self.header().storage
    }

    fn storage(&self) -> *mut u8 {
        // SAFETY: the storage starts right after the header, inside the
        // same allocation
        unsafe { self.ptr.as_raw().cast::<u8>().add(HEADER_SIZE) }
    }

    /// Pointer to the extra bytes requested by the object's class, or `None`
    /// if it requested none.
    #[must_use]
    pub fn extra_bytes(&self) -> Option<NonNull<u8>> {
        let class = self.class();
        if class.extra_bytes() == 0 {
            return None;
        }
        // SAFETY: extra_offset + extra_bytes == instance_size <= storage
        NonNull::new(unsafe { self.storage().add(class.extra_offset()) })
    }

    /// Locates `ivar` in this object's storage, checking that it belongs to
    /// the object's class and that a value of `size` bytes fits it.
    pub(crate) fn ivar_ptr(&self, ivar: &Ivar, size: usize) -> Result<*mut u8> {
        if !self.is_kind_of(&ivar.class()) {
            return Err(Error::IvarNotInClass {
                ivar: ivar.name().to_owned(),
                class: self.class().name().to_owned(),
            });
        }
        if size != ivar.size() || ivar.offset() + ivar.size() > self.header().storage {
            return Err(Error::IvarTypeMismatch {
                ivar: ivar.name().to_owned(),
                expected: ivar.size(),
                got: size,
            });
        }
        // SAFETY: the bounds check above keeps the pointer inside storage
        Ok(unsafe { self.storage().add(ivar.offset()) })
    }

    /// Reads an ivar.
    ///
    /// # Safety
    ///
    /// `T` must be the type the ivar was declared with, and no other thread
    /// may be writing the ivar concurrently (serialize with
    /// [`sync_enter`](crate::runtime::sync::sync_enter) or use the atomic
    /// [`property`](crate::runtime::property) accessors).
    ///
    /// # Errors
    ///
    /// - [`Error::IvarNotInClass`] if the ivar is declared by a class this
    ///   object is not an instance of
    /// - [`Error::IvarTypeMismatch`] if `T` does not have the ivar's size
    pub unsafe fn get_ivar<T: Copy>(&self, ivar: &Ivar) -> Result<T> {
        let ptr = self.ivar_ptr(ivar, mem::size_of::<T>())?;
        // SAFETY: in bounds (checked); validity and exclusion are upheld by
        // the caller
        Ok(unsafe { ptr.cast::<T>().read_unaligned() })
    }

    /// Writes an ivar.
    ///
    /// Object-typed ivars written this way are not retained; use
    /// [`set_property`](crate::runtime::property::set_property) for those.
    ///
    /// # Safety
    ///
    /// As for [`Object::get_ivar`], with no concurrent readers either.
    ///
    /// # Errors
    ///
    /// As for [`Object::get_ivar`].
    pub unsafe fn set_ivar<T: Copy>(&self, ivar: &Ivar, value: T) -> Result<()> {
        let ptr = self.ivar_ptr(ivar, mem::size_of::<T>())?;
        // SAFETY: as in get_ivar
        unsafe { ptr.cast::<T>().write_unaligned(value) };
        Ok(())
    }
}

impl Clone for Object {
    fn clone(&self) -> Self {
        // SAFETY: self keeps the object alive
        Object {
            ptr: unsafe { retain(self.ptr) },
        }
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        // SAFETY: self owns one reference
        unsafe { release(self.ptr) }
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl Eq for Object {}

impl Hash for Object {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ptr.hash(state);
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("class", &self.class().name())
            .field("addr", &format_args!("{:#x}", self.ptr.addr()))
            .field("retain_count", &self.retain_count())
            .finish()
    }
}

/// Sorted offsets of the object-typed ivars of `class` and its ancestors.
fn object_offsets(class: &Class) -> Vec<usize> {
    let mut offsets: Vec<usize> = class
        .ancestors()
        .flat_map(|level| level.ivars())
        .filter(Ivar::is_object)
        .map(|ivar| ivar.offset())
        .collect();
    offsets.sort_unstable();
    offsets
}

#[cold]
fn lifecycle_violation(err: &Error) -> ! {
    error!("{}", err);
    panic!("{err}");
}

/// Increments the reference count of `ptr` and returns it.
///
/// # Safety
///
/// `ptr` must point to a live object.
///
/// # Panics
///
/// Retaining an object whose teardown has started, or overflowing the
/// count, is fatal.
pub unsafe fn retain(ptr: ObjectPtr) -> ObjectPtr {
    // SAFETY: upheld by the caller
    let header = unsafe { ptr.header() };
    let old = header.refcount.fetch_add(1, Ordering::Relaxed);
    if old == u32::MAX {
        lifecycle_violation(&Error::RefCountOverflow);
    }
    if old == 0 {
        // SAFETY: teardown of this object has not finished; it is running
        // on the thread that reached zero
        let class = unsafe { Object::borrowed(ptr) }.class();
        lifecycle_violation(&Error::OverRelease {
            class: class.name().to_owned(),
        });
    }
    ptr
}

/// Decrements the reference count of `ptr`, tearing the object down when
/// it reaches zero.
///
/// # Safety
///
/// The caller must own one reference to the object, which this call
/// consumes.
///
/// # Panics
///
/// Releasing an object with no outstanding references is fatal.
pub unsafe fn release(ptr: ObjectPtr) {
    // SAFETY: the caller owns a reference, so the object is alive
    let header = unsafe { ptr.header() };
    match header.refcount.fetch_sub(1, Ordering::Release) {
        0 => {
            header.refcount.store(0, Ordering::Relaxed);
            // SAFETY: the storage has not been freed yet (count was zero,
            // not one)
            let class = unsafe { Object::borrowed(ptr) }.class();
            lifecycle_violation(&Error::OverRelease {
                class: class.name().to_owned(),
            });
        }
        1 => {
            atomic::fence(Ordering::Acquire);
            // SAFETY: this call dropped the last reference
            unsafe { deallocate(ptr) }
        }
        _ => {}
    }
}

/// Stores a strong reference in `slot`: retains `value`, stores it and
/// releases the reference the slot held before. Returns `value`.
///
/// # Safety
///
/// `slot` must be valid for reads and writes and hold `None` or an owned
/// reference; `value`, if any, must point to a live object.
pub unsafe fn store_strong(slot: *mut Option<ObjectPtr>, value: Option<ObjectPtr>) -> Option<ObjectPtr> {
    // SAFETY: value is live (caller)
    let new = value.map(|ptr| unsafe { retain(ptr) });
    // SAFETY: slot is valid (caller)
    let old = unsafe { slot.replace(new) };
    if let Some(old) = old {
        // SAFETY: the slot owned this reference
        unsafe { release(old) };
    }
    value
}

/// Tears down an object whose count has reached zero.
///
/// Weak slots are zeroed first, so no weak load can succeed once teardown
/// has begun. The behavioral `dealloc` message follows normal dispatch; the
/// structural release of object ivars then walks the classes most derived
/// first.
unsafe fn deallocate(ptr: ObjectPtr) {
    // SAFETY: the object is still allocated until the end of this function
    let header = unsafe { ptr.header() };
    header.flags.fetch_or(DEALLOCATING, Ordering::AcqRel);

    // SAFETY: as above
    unsafe { weak::clear_weak_references(ptr) };

    // SAFETY: storage stays allocated until dealloc() below
    let object = unsafe { Object::borrowed(ptr) };
    let class = object.class();

    if let Some(method) = class.lookup_method(&DEALLOC) {
        let mut ret = [0u8; SCALAR_RETURN_SIZE];
        (method.imp())(&object, &DEALLOC, &MessageArgs::None, &mut ret);
    }

    for level in class.ancestors() {
        for ivar in level.ivars().iter().filter(|ivar| ivar.is_object()) {
            let Ok(slot) = object.ivar_ptr(ivar, mem::size_of::<usize>()) else {
                continue;
            };
            // SAFETY: slot is an in-bounds, pointer-sized ivar
            let raw = unsafe { slot.cast::<usize>().replace(0) };
            if let Some(child) = ObjectPtr::from_addr(raw) {
                // SAFETY: object ivars hold owned references
                unsafe { release(child) };
            }
        }
    }

    let size = HEADER_SIZE + header.storage;
    trace!("deallocated {} at {:?}", class.name(), ptr);
    // SAFETY: same size and alignment the block was allocated with
    unsafe {
        dealloc(
            ptr.as_raw().cast(),
            Layout::from_size_align_unchecked(size, OBJECT_ALIGN),
        );
    }
}
