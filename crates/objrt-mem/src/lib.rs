//! `objrt` memory infrastructure
//!
//! This crate provides the allocation primitives the `objrt` runtime builds
//! its process-wide registries on:
//!
//! - **Global arena**: thread-safe bump allocation for metadata that lives
//!   for the whole process (interned selector names, type encodings, class
//!   names). Requires the `global-arena` feature.
//! - **Handle arena**: append-only storage that hands out stable `u32`
//!   handles, so descriptors can link to each other by index instead of by
//!   address. Requires the `handles` feature.

#[cfg(feature = "global-arena")]
pub mod arena;

#[cfg(feature = "handles")]
pub mod handle;

#[cfg(feature = "global-arena")]
pub use arena::{ArenaAllocError, ArenaStats, GlobalArena, global_arena};

#[cfg(feature = "handles")]
pub use handle::{HandleArena, HandleError};
