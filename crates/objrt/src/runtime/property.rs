//! Property accessors over ivars.
//!
//! Object-typed properties retain what they store and release what they
//! replace. Atomic accessors serialize on one of a fixed set of lock
//! stripes chosen by the ivar's address, so a getter never observes a value
//! the setter has already released. Non-atomic accessors skip the stripe
//! and must be serialized by the caller.

use crate::error::{Error, Result};
use crate::runtime::class::Ivar;
use crate::runtime::dispatch::send_message;
use crate::runtime::message::MessageArgs;
use crate::runtime::object::{Object, ObjectPtr, release};
use crate::runtime::selector::Selector;
use parking_lot::{Mutex, MutexGuard};
use std::mem;
use std::ptr;
use std::sync::LazyLock;

const PROPERTY_STRIPES: usize = 16;

static PROPERTY_LOCKS: [Mutex<()>; PROPERTY_STRIPES] = [const { Mutex::new(()) }; PROPERTY_STRIPES];

static COPY: LazyLock<Selector> = LazyLock::new(|| Selector::named("copy"));

fn stripe(slot: *const u8) -> MutexGuard<'static, ()> {
    let index = fxhash::hash64(&(slot as usize)) as usize & (PROPERTY_STRIPES - 1);
    PROPERTY_LOCKS[index].lock()
}

fn object_slot(object: &Object, ivar: &Ivar) -> Result<*mut usize> {
    if !ivar.is_object() {
        return Err(Error::IvarTypeMismatch {
            ivar: ivar.name().to_owned(),
            expected: ivar.size(),
            got: mem::size_of::<usize>(),
        });
    }
    Ok(object.ivar_ptr(ivar, mem::size_of::<usize>())?.cast())
}

/// Reads an object-typed property, returning a new strong reference.
///
/// # Errors
///
/// - [`Error::IvarNotInClass`] if `ivar` is declared by a class `object` is
///   not an instance of
/// - [`Error::IvarTypeMismatch`] if `ivar` is not object-typed
pub fn get_property(object: &Object, ivar: &Ivar, atomic: bool) -> Result<Option<Object>> {
    let slot = object_slot(object, ivar)?;
    let _guard = atomic.then(|| stripe(slot.cast()));

    // SAFETY: slot is an in-bounds, pointer-sized ivar; object ivars hold
    // owned references, which stay valid while the stripe (or the caller's
    // own serialization) keeps setters out
    let raw = unsafe { slot.read() };
    Ok(ObjectPtr::from_addr(raw).map(|ptr| unsafe { Object::retained(ptr) }))
}

/// Stores into an object-typed property, releasing the previous value.
///
/// With `copy`, the stored value is the result of sending `copy` to
/// `value`, which must return a new reference.
///
/// # Errors
///
/// - [`Error::IvarTypeMismatch`] as for [`get_property`]
/// - any error from sending `copy`
pub fn set_property(
    object: &Object,
    ivar: &Ivar,
    value: Option<&Object>,
    atomic: bool,
    copy: bool,
) -> Result<()> {
    let slot = object_slot(object, ivar)?;

    let new = match value {
        None => 0,
        Some(value) if copy => send_message(value, &COPY, &MessageArgs::None)?.unwrap_or(0),
        Some(value) => value.clone().into_raw().addr(),
    };

    let old = {
        let _guard = atomic.then(|| stripe(slot.cast()));
        // SAFETY: as in get_property
        unsafe { slot.replace(new) }
    };

    if let Some(old) = ObjectPtr::from_addr(old) {
        // SAFETY: the ivar owned this reference
        unsafe { release(old) };
    }
    Ok(())
}

fn plain_slot(object: &Object, ivar: &Ivar, len: usize) -> Result<*mut u8> {
    if ivar.is_object() {
        return Err(Error::IvarTypeMismatch {
            ivar: ivar.name().to_owned(),
            expected: ivar.size(),
            got: len,
        });
    }
    object.ivar_ptr(ivar, len)
}

/// Copies a non-object property into `dest`, whose length must equal the
/// ivar's size.
///
/// # Errors
///
/// - [`Error::IvarNotInClass`] as for [`get_property`]
/// - [`Error::IvarTypeMismatch`] if `dest` has the wrong length or the ivar
///   is object-typed
pub fn get_property_struct(object: &Object, ivar: &Ivar, dest: &mut [u8], atomic: bool) -> Result<()> {
    let slot = plain_slot(object, ivar, dest.len())?;
    let _guard = atomic.then(|| stripe(slot));
    // SAFETY: slot spans dest.len() in-bounds bytes (checked) and cannot
    // overlap a caller-owned buffer
    unsafe { ptr::copy_nonoverlapping(slot, dest.as_mut_ptr(), dest.len()) };
    Ok(())
}

/// Copies `src` into a non-object property.
///
/// # Errors
///
/// As for [`get_property_struct`].
pub fn set_property_struct(object: &Object, ivar: &Ivar, src: &[u8], atomic: bool) -> Result<()> {
    let slot = plain_slot(object, ivar, src.len())?;
    let _guard = atomic.then(|| stripe(slot));
    // SAFETY: as in get_property_struct
    unsafe { ptr::copy_nonoverlapping(src.as_ptr(), slot, src.len()) };
    Ok(())
}
