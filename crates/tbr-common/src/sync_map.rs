//! Type-safe map wrapper that prevents auto-vivification bugs.
//!
//! Border routing tables are keyed by prefixes and multicast groups that
//! arrive from the network. A lookup for a group nobody registered must
//! never leave an empty entry behind, otherwise the "represented on the
//! infra link iff a listener exists" invariant silently breaks.
//!
//! `SyncMap` provides explicit methods that never auto-create entries:
//! - `get()` returns `Option<&V>`
//! - `get_mut()` returns `Option<&mut V>`
//! - `insert()` on a full bounded map returns `Err(SyncMapError::Full)`

use std::collections::HashMap;
use std::hash::Hash;
use thiserror::Error;

/// Error type for SyncMap operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncMapError {
    #[error("Table full ({0} entries)")]
    Full(usize),
}

/// A type-safe map wrapper that prevents auto-vivification bugs.
///
/// Unlike `HashMap`, this type never creates entries implicitly.
/// All operations that might create entries are explicit, and an optional
/// capacity bound makes "table full" an explicit outcome as well.
///
/// # Example
///
/// ```
/// use tbr_common::SyncMap;
///
/// let mut map: SyncMap<String, i32> = SyncMap::new();
///
/// // get() returns None for missing keys (doesn't create entry)
/// assert!(map.get(&"missing".to_string()).is_none());
///
/// // Must explicitly insert
/// map.insert("key".to_string(), 42).unwrap();
/// assert_eq!(map.get(&"key".to_string()), Some(&42));
/// ```
#[derive(Debug, Clone)]
pub struct SyncMap<K, V> {
    inner: HashMap<K, V>,
    bound: Option<usize>,
}

impl<K, V> SyncMap<K, V>
where
    K: Eq + Hash,
{
    /// Creates a new empty, unbounded map.
    pub fn new() -> Self {
        Self {
            inner: HashMap::new(),
            bound: None,
        }
    }

    /// Creates a new empty map holding at most `bound` entries.
    pub fn bounded(bound: usize) -> Self {
        Self {
            inner: HashMap::with_capacity(bound.min(1024)),
            bound: Some(bound),
        }
    }

    /// Returns true if inserting a new key would exceed the bound.
    pub fn is_full(&self) -> bool {
        self.bound.is_some_and(|bound| self.inner.len() >= bound)
    }

    /// Returns the number of entries in the map.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns true if the map contains the given key.
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Returns a reference to the value for the given key.
    ///
    /// **This never creates entries.**
    pub fn get(&self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    /// Returns a mutable reference to the value for the given key.
    ///
    /// **This never creates entries.**
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.inner.get_mut(key)
    }

    /// Inserts a key-value pair into the map.
    ///
    /// Replacing an existing key always succeeds. Adding a new key fails
    /// with [`SyncMapError::Full`] when the bound is reached; the caller
    /// decides what to evict.
    pub fn insert(&mut self, key: K, value: V) -> Result<Option<V>, SyncMapError> {
        if !self.inner.contains_key(&key) && self.is_full() {
            return Err(SyncMapError::Full(self.inner.len()));
        }
        Ok(self.inner.insert(key, value))
    }

    /// Removes a key from the map.
    ///
    /// Returns the removed value if the key was present.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.remove(key)
    }

    /// Removes every entry for which `pred` returns true, returning them.
    pub fn remove_where<F>(&mut self, mut pred: F) -> Vec<(K, V)>
    where
        K: Clone,
        F: FnMut(&K, &V) -> bool,
    {
        let keys: Vec<K> = self
            .inner
            .iter()
            .filter(|&(k, v)| pred(k, v))
            .map(|(k, _)| k.clone())
            .collect();

        keys.into_iter()
            .filter_map(|k| self.inner.remove_entry(&k))
            .collect()
    }

    /// Clears all entries from the map, returning them.
    pub fn drain(&mut self) -> Vec<(K, V)> {
        self.inner.drain().collect()
    }

    /// Returns an iterator over key-value pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.inner.iter()
    }

    /// Returns an iterator over keys.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.inner.keys()
    }

    /// Returns an iterator over values.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.inner.values()
    }

    /// Returns the key whose value minimizes `f`, if the map is non-empty.
    ///
    /// Used to pick eviction victims (e.g. least recently refreshed).
    pub fn min_key_by<T, F>(&self, mut f: F) -> Option<&K>
    where
        T: Ord,
        F: FnMut(&K, &V) -> T,
    {
        self.inner.iter().min_by_key(|&(k, v)| f(k, v)).map(|(k, _)| k)
    }
}

impl<K, V> Default for SyncMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> FromIterator<(K, V)> for SyncMap<K, V>
where
    K: Eq + Hash,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            inner: iter.into_iter().collect(),
            bound: None,
        }
    }
}
