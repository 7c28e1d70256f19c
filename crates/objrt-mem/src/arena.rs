//! Thread-safe bump arena for process-lifetime runtime metadata.
//!
//! The runtime never frees interned selector names, type encodings or class
//! names: they are referenced by every dispatch table and by every typed
//! selector for the rest of the process. Allocating them from a bump arena
//! keeps them in a few large chunks and makes every returned reference valid
//! for as long as the arena lives (`'static` for [`global_arena`]).
//!
//! # Architecture
//!
//! - [`GlobalArena`]: owns a list of chunks and an atomic pointer to the
//!   chunk currently being bumped.
//! - `Chunk`: a single heap block with an atomic bump offset. Allocation is a
//!   CAS loop on that offset, so concurrent allocators never take a lock on
//!   the fast path.
//!
//! When the current chunk is exhausted, one thread takes the chunk-list lock
//! and installs a larger chunk; the others retry against the new one.
//!
//! # Example
//!
//! ```
//! use objrt_mem::arena::GlobalArena;
//!
//! let arena = GlobalArena::new(4096);
//! let name = arena.alloc_str("initWithCapacity:").unwrap();
//! assert_eq!(name, "initWithCapacity:");
//! ```

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// Arena allocation failed: the system allocator refused a new chunk or the
/// request could not be described by a valid layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaAllocError {
    /// Number of bytes the failing request needed.
    pub requested: usize,
}

impl fmt::Display for ArenaAllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Arena allocation failed: out of memory ({} bytes requested)",
            self.requested
        )
    }
}

impl std::error::Error for ArenaAllocError {}

/// Alignment of every chunk's backing block.
const CHUNK_ALIGNMENT: usize = 16;

/// Smallest chunk the arena will allocate.
const MIN_CHUNK_SIZE: usize = 4096;

/// Chunks stop doubling at this size; larger requests get a dedicated chunk.
const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Allocation statistics for a [`GlobalArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Bytes handed out to callers (excluding alignment padding).
    pub total_allocated: usize,
    /// Number of chunks owned by the arena.
    pub chunk_count: usize,
    /// Sum of all chunk capacities.
    pub total_capacity: usize,
}

/// A single block of arena memory with an atomic bump offset.
struct Chunk {
    start: NonNull<u8>,
    used: AtomicUsize,
    capacity: usize,
}

impl Chunk {
    fn new(capacity: usize) -> Result<Box<Self>, ArenaAllocError> {
        let layout = Layout::from_size_align(capacity, CHUNK_ALIGNMENT)
            .map_err(|_| ArenaAllocError { requested: capacity })?;

        // SAFETY: capacity is never zero (clamped to MIN_CHUNK_SIZE by the caller)
        let start = unsafe { alloc::alloc(layout) };
        let start =
            NonNull::new(start).ok_or(ArenaAllocError { requested: capacity })?;

        Ok(Box::new(Chunk {
            start,
            used: AtomicUsize::new(0),
            capacity,
        }))
    }

    /// Bumps the offset by `size` bytes aligned to `align`, or returns `None`
    /// when the chunk cannot fit the request.
    #[inline]
    fn try_alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let base = self.start.as_ptr().addr();

        loop {
            let used = self.used.load(Ordering::Acquire);
            let aligned = ((base + used + align - 1) & !(align - 1)) - base;
            let end = aligned.checked_add(size)?;

            if end > self.capacity {
                return None;
            }

            if self
                .used
                .compare_exchange_weak(
                    used,
                    end,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                // SAFETY: aligned + size <= capacity, so the pointer stays
                // inside the block and keeps the block's provenance
                return Some(unsafe {
                    NonNull::new_unchecked(self.start.as_ptr().add(aligned))
                });
            }
        }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // SAFETY: the same layout was accepted by Layout::from_size_align in new()
        unsafe {
            let layout =
                Layout::from_size_align_unchecked(self.capacity, CHUNK_ALIGNMENT);
            alloc::dealloc(self.start.as_ptr(), layout);
        }
    }
}

/// Thread-safe bump arena.
///
/// Memory handed out by the arena is never reused or freed while the arena
/// is alive. The process-wide instance returned by [`global_arena`] is never
/// dropped.
///
/// # Thread Safety
///
/// Allocation takes no lock unless the current chunk is exhausted. Growing
/// takes the chunk-list mutex; threads racing to grow install at most one
/// new chunk per exhaustion.
pub struct GlobalArena {
    chunks: Mutex<Vec<Box<Chunk>>>,
    current: AtomicPtr<Chunk>,
    chunk_size: usize,
    total_allocated: AtomicUsize,
}

// SAFETY: chunks are only reached through the mutex or through `current`,
// whose pointee is owned by `chunks` and never freed before the arena.
// Bump allocation inside a chunk is a CAS on an atomic offset.
unsafe impl Send for GlobalArena {}
unsafe impl Sync for GlobalArena {}

impl GlobalArena {
    /// Creates an empty arena. The first chunk is allocated lazily.
    #[must_use]
    pub const fn new(chunk_size: usize) -> Self {
        GlobalArena {
            chunks: Mutex::new(Vec::new()),
            current: AtomicPtr::new(std::ptr::null_mut()),
            chunk_size,
            total_allocated: AtomicUsize::new(0),
        }
    }

    /// Allocates `size` bytes aligned to `align` (a power of two).
    ///
    /// The returned memory is uninitialized and stays valid for the lifetime
    /// of the arena.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaAllocError`] if a new chunk cannot be allocated.
    pub fn alloc_bytes(
        &self,
        size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, ArenaAllocError> {
        debug_assert!(align.is_power_of_two());

        loop {
            let current = self.current.load(Ordering::Acquire);

            if !current.is_null() {
                // SAFETY: `current` points at a chunk owned by `self.chunks`
                let chunk = unsafe { &*current };
                if let Some(ptr) = chunk.try_alloc(size, align) {
                    self.total_allocated.fetch_add(size, Ordering::Relaxed);
                    return Ok(ptr);
                }
            }

            self.grow(current, size + align)?;
        }
    }

    /// Copies `s` into the arena and returns the arena-owned copy.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaAllocError`] if a new chunk cannot be allocated.
    pub fn alloc_str(&self, s: &str) -> Result<&str, ArenaAllocError> {
        if s.is_empty() {
            return Ok("");
        }

        let ptr = self.alloc_bytes(s.len(), 1)?;

        // SAFETY: ptr is valid for s.len() bytes and does not overlap `s`;
        // the copied bytes are the UTF-8 bytes of `s`
        unsafe {
            std::ptr::copy_nonoverlapping(s.as_ptr(), ptr.as_ptr(), s.len());
            let bytes = std::slice::from_raw_parts(ptr.as_ptr(), s.len());
            Ok(std::str::from_utf8_unchecked(bytes))
        }
    }

    #[cold]
    fn grow(
        &self,
        observed: *mut Chunk,
        min_size: usize,
    ) -> Result<(), ArenaAllocError> {
        let mut chunks =
            self.chunks.lock().unwrap_or_else(PoisonError::into_inner);

        // Another thread already replaced the chunk we saw exhausted
        if self.current.load(Ordering::Acquire) != observed {
            return Ok(());
        }

        let next = chunks
            .last()
            .map_or(self.chunk_size, |c| c.capacity.saturating_mul(2))
            .clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
            .max(min_size.next_power_of_two());

        let mut chunk = Chunk::new(next)?;
        let ptr: *mut Chunk = &mut *chunk;
        chunks.push(chunk);
        self.current.store(ptr, Ordering::Release);

        Ok(())
    }

    /// Returns a snapshot of the arena's allocation statistics.
    #[must_use]
    pub fn stats(&self) -> ArenaStats {
        let chunks = self.chunks.lock().unwrap_or_else(PoisonError::into_inner);

        ArenaStats {
            total_allocated: self.total_allocated.load(Ordering::Relaxed),
            chunk_count: chunks.len(),
            total_capacity: chunks.iter().map(|c| c.capacity).sum(),
        }
    }
}

/// Returns the process-wide metadata arena.
#[must_use]
pub fn global_arena() -> &'static GlobalArena {
    static ARENA: GlobalArena = GlobalArena::new(64 * 1024);
    &ARENA
}
