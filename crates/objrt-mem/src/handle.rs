//! Append-only arena with stable integer handles.
//!
//! Type descriptors link to their superclass, subclasses and categories by
//! handle rather than by address. A [`HandleArena`] stores each value in a
//! slot that never moves, and resolves a `u32` handle back to the value
//! without taking a lock.
//!
//! # Layout
//!
//! Slots live in segments whose sizes double: segment `k` holds
//! `BASE << k` slots. A handle maps to `(segment, offset)` with a couple of
//! bit operations, and existing segments are never reallocated, so a
//! reference obtained from [`HandleArena::get`] stays valid for the life of
//! the arena.
//!
//! Each slot is a `OnceLock`, which gives the publication guarantee the
//! registries rely on: a reader either sees a fully constructed value or no
//! value at all.
//!
//! # Example
//!
//! ```
//! use objrt_mem::HandleArena;
//!
//! let arena: HandleArena<&str> = HandleArena::new();
//! let a = arena.push("Root").unwrap();
//! let b = arena.push("Child").unwrap();
//!
//! assert_eq!(arena.get(a), Some(&"Root"));
//! assert_eq!(arena.get(b), Some(&"Child"));
//! assert_eq!(arena.iter().count(), 2);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};

const BASE_SHIFT: u32 = 6;
const BASE: usize = 1 << BASE_SHIFT;

/// Enough segments to cover every `u32` handle.
const SEGMENTS: usize = 27;

/// The handle space is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleError;

impl fmt::Display for HandleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle arena exhausted")
    }
}

impl std::error::Error for HandleError {}

/// Append-only storage addressed by `u32` handles.
pub struct HandleArena<T> {
    segments: [AtomicPtr<OnceLock<T>>; SEGMENTS],
    reserved: AtomicU32,
    grow: Mutex<()>,
}

// SAFETY: values are only shared through `&T` after OnceLock publication;
// segment pointers are published with Release and read with Acquire
unsafe impl<T: Send + Sync> Sync for HandleArena<T> {}
// SAFETY: the arena owns its segments; moving it moves ownership of every
// stored value, which only needs `T: Send`
unsafe impl<T: Send> Send for HandleArena<T> {}

#[inline]
const fn locate(handle: u32) -> (usize, usize) {
    let pos = handle as usize + BASE;
    let segment = (usize::BITS - 1 - pos.leading_zeros()) - BASE_SHIFT;
    (segment as usize, pos - (BASE << segment))
}

#[inline]
const fn segment_len(segment: usize) -> usize {
    BASE << segment
}

impl<T> HandleArena<T> {
    /// Creates an empty arena. Segments are allocated on demand.
    #[must_use]
    pub const fn new() -> Self {
        HandleArena {
            segments: [const { AtomicPtr::new(std::ptr::null_mut()) }; SEGMENTS],
            reserved: AtomicU32::new(0),
            grow: Mutex::new(()),
        }
    }

    /// Stores `value` and returns its handle.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError`] once `u32::MAX` handles have been issued.
    pub fn push(&self, value: T) -> Result<u32, HandleError> {
        let handle = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                n.checked_add(1)
            })
            .map_err(|_| HandleError)?;

        let (segment, offset) = locate(handle);
        let base = self.segment(segment);

        // SAFETY: offset < segment_len(segment) by construction of locate();
        // the slot was reserved exclusively for this handle
        let slot = unsafe { &*base.add(offset) };
        if slot.set(value).is_err() {
            unreachable!("handle {handle} reserved twice");
        }

        Ok(handle)
    }

    /// Returns the value stored under `handle`, or `None` if the handle was
    /// never issued or its value is not published yet.
    #[must_use]
    pub fn get(&self, handle: u32) -> Option<&T> {
        if handle >= self.reserved.load(Ordering::Acquire) {
            return None;
        }

        let (segment, offset) = locate(handle);
        let base = self.segments[segment].load(Ordering::Acquire);
        if base.is_null() {
            return None;
        }

        // SAFETY: the segment is allocated and offset is in bounds
        unsafe { (*base.add(offset)).get() }
    }

    /// Number of handles issued so far (including values still being
    /// published by a concurrent `push`).
    #[must_use]
    pub fn len(&self) -> usize {
        self.reserved.load(Ordering::Acquire) as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over every published value in handle order.
    ///
    /// The iterator works on a snapshot of the issued-handle count: values
    /// pushed after the call may or may not be visited, and a slot whose
    /// value is still being published is skipped.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> + '_ {
        let end = self.reserved.load(Ordering::Acquire);
        (0..end).filter_map(move |h| self.get(h).map(|v| (h, v)))
    }

    fn segment(&self, segment: usize) -> *mut OnceLock<T> {
        let existing = self.segments[segment].load(Ordering::Acquire);
        if !existing.is_null() {
            return existing;
        }

        let _guard = self.grow.lock().unwrap_or_else(PoisonError::into_inner);

        let existing = self.segments[segment].load(Ordering::Acquire);
        if !existing.is_null() {
            return existing;
        }

        let slots: Box<[OnceLock<T>]> =
            (0..segment_len(segment)).map(|_| OnceLock::new()).collect();
        let base = Box::into_raw(slots).cast::<OnceLock<T>>();
        self.segments[segment].store(base, Ordering::Release);

        base
    }
}

impl<T> Default for HandleArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for HandleArena<T> {
    fn drop(&mut self) {
        for (segment, ptr) in self.segments.iter_mut().enumerate() {
            let base = *ptr.get_mut();
            if base.is_null() {
                continue;
            }

            // SAFETY: base came from Box::into_raw of a slice of exactly
            // segment_len(segment) slots
            unsafe {
                let slice = std::ptr::slice_from_raw_parts_mut(
                    base,
                    segment_len(segment),
                );
                drop(Box::from_raw(slice));
            }
        }
    }
}

impl<T> fmt::Debug for HandleArena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleArena")
            .field("len", &self.len())
            .finish()
    }
}
