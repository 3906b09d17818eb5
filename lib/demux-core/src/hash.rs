//! Hashing and hash-based collections.
use std::{
    hash::{BuildHasher as _, Hash, Hasher as _},
    sync::LazyLock,
};

/// [`BuildHasher`][std::hash::BuildHasher] used by the crate's hash maps.
pub type FastBuildHasher = foldhash::quality::RandomState;

/// A `hashbrown` hash map using [`FastBuildHasher`].
pub type FastHashMap<K, V> = hashbrown::HashMap<K, V, FastBuildHasher>;

/// A `hashbrown` hash set using [`FastBuildHasher`].
pub type FastHashSet<T> = hashbrown::HashSet<T, FastBuildHasher>;

// Shard routing needs the same value to hash identically no matter which routine computes it, so everything goes
// through a single, process-wide seeded state.
static BUILD_HASHER: LazyLock<FastBuildHasher> = LazyLock::new(FastBuildHasher::default);

/// Hashes a single value with the process-wide hasher state.
///
/// Hashes are stable for the lifetime of the process, but not across runs.
#[inline]
pub fn hash_single_fast<H: Hash>(value: H) -> u64 {
    let mut hasher = BUILD_HASHER.build_hasher();
    value.hash(&mut hasher);
    hasher.finish()
}
