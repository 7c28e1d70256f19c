//! `Selector` interning for the `objrt` runtime.
//!
//! Every distinct name is interned exactly once and receives a stable numeric
//! uid. Two selectors are equal exactly when their uids are equal, so
//! equality and hashing never touch the name.
//!
//! # Architecture
//!
//! - Names are copied into the global arena and live for the whole program.
//! - Interned records live in a [`HandleArena`]; the uid *is* the handle, so
//!   `uid -> name` is a lock-free index.
//! - `name -> uid` goes through `NUM_SHARDS` independently locked maps keyed by
//!   the `FxHash` of the name. A hit takes one shard read lock; a miss takes
//!   that shard's write lock and re-checks before inserting.
//!
//! A selector may also carry an optional type encoding. The encoding rides
//! along with the value and plays no part in equality.

use crate::error::{Error, Result};
use crate::runtime::{FastMap, handles_exhausted, intern_str};
use fxhash::FxHasher;
use objrt_mem::HandleArena;
use parking_lot::RwLock;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::LazyLock;

/// Number of shards in the name table (power of 2 for fast bit masking).
const NUM_SHARDS: usize = 16;

/// Bit mask for shard selection (`NUM_SHARDS` - 1).
const SHARD_MASK: usize = NUM_SHARDS - 1;

/// Record stored once per distinct name.
struct InternedSelector {
    name: &'static str,
    hash: u64,
}

/// Interned records, indexed by uid.
static SELECTORS: HandleArena<InternedSelector> = HandleArena::new();

/// `name -> uid`, sharded by name hash.
static SHARDS: LazyLock<[RwLock<FastMap<&'static str, u32>>; NUM_SHARDS]> =
    LazyLock::new(|| std::array::from_fn(|_| RwLock::new(FastMap::default())));

fn hash_name(name: &str) -> u64 {
    let mut hasher = FxHasher::default();
    name.hash(&mut hasher);
    hasher.finish()
}

/// An interned method name, optionally annotated with a type encoding.
///
/// `Selector` is `Copy` and pointer-sized plus the optional encoding. Use
/// [`Selector::from_str`] (or [`str::parse`]) to intern a name.
///
/// # Example
///
/// ```rust
/// use objrt::Selector;
/// use std::str::FromStr;
///
/// let a = Selector::from_str("increment").unwrap();
/// let b: Selector = "increment".parse().unwrap();
/// assert_eq!(a, b);
/// assert_eq!(a.uid(), b.uid());
/// assert_eq!(a.name(), "increment");
/// ```
#[derive(Clone, Copy)]
pub struct Selector {
    uid: u32,
    types: Option<&'static str>,
}

impl FromStr for Selector {
    type Err = Error;

    /// Interns `name`, returning the existing selector if it was seen before.
    ///
    /// Interning does not fail for any string. Running out of memory while
    /// copying a new name is fatal, as with any other allocation.
    fn from_str(name: &str) -> Result<Self> {
        Ok(Selector {
            uid: intern(name),
            types: None,
        })
    }
}

fn intern(name: &str) -> u32 {
    let hash = hash_name(name);
    let shard = &SHARDS[(hash as usize) & SHARD_MASK];

    if let Some(&uid) = shard.read().get(name) {
        return uid;
    }

    let mut map = shard.write();
    // Another thread might have inserted while we waited for the write lock
    if let Some(&uid) = map.get(name) {
        return uid;
    }

    let name = intern_str(name);
    let uid = match SELECTORS.push(InternedSelector { name, hash }) {
        Ok(uid) => uid,
        Err(_) => handles_exhausted("selector"),
    };
    map.insert(name, uid);
    uid
}

impl Selector {
    /// Interns `name` and annotates the result with a type encoding.
    ///
    /// The encoding is not validated here; it is checked when a method is
    /// added under this selector.
    ///
    /// # Example
    ///
    /// ```rust
    /// use objrt::Selector;
    ///
    /// let typed = Selector::with_types("add:", "v@:q").unwrap();
    /// let plain: Selector = "add:".parse().unwrap();
    /// assert_eq!(typed, plain);
    /// assert_eq!(typed.types(), Some("v@:q"));
    /// assert_eq!(plain.types(), None);
    /// ```
    ///
    /// # Errors
    ///
    /// Never fails in practice; returns `Result` for symmetry with
    /// [`Selector::from_str`].
    pub fn with_types(name: &str, types: &str) -> Result<Self> {
        Ok(Selector {
            uid: intern(name),
            types: Some(intern_str(types)),
        })
    }

    /// Infallible form of [`Selector::from_str`] for names the runtime
    /// itself sends.
    pub(crate) fn named(name: &str) -> Self {
        Selector {
            uid: intern(name),
            types: None,
        }
    }

    /// Returns the selector for `uid`, if one has been interned.
    #[must_use]
    pub fn from_uid(uid: u32) -> Option<Self> {
        SELECTORS.get(uid).map(|_| Selector { uid, types: None })
    }

    /// Returns the numeric uid shared by every selector with this name.
    #[inline]
    #[must_use]
    pub const fn uid(&self) -> u32 {
        self.uid
    }

    /// Returns the selector name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.interned().name
    }

    /// Returns the type encoding carried by this value, if any.
    #[inline]
    #[must_use]
    pub const fn types(&self) -> Option<&'static str> {
        self.types
    }

    /// Returns the precomputed `FxHash` of the name.
    #[must_use]
    pub fn hash(&self) -> u64 {
        self.interned().hash
    }

    /// Number of distinct names interned so far.
    #[must_use]
    pub fn registered_count() -> usize {
        SELECTORS.len()
    }

    fn interned(&self) -> &'static InternedSelector {
        match SELECTORS.get(self.uid) {
            Some(interned) => interned,
            // uids are only handed out after the record is published
            None => unreachable!("selector uid {} was never interned", self.uid),
        }
    }
}

impl PartialEq for Selector {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

impl Eq for Selector {}

impl Hash for Selector {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.uid);
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Selector");
        s.field("name", &self.name()).field("uid", &self.uid);
        if let Some(types) = self.types {
            s.field("types", &types);
        }
        s.finish()
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
