//! Two-level indexes keyed by an outer and an inner key.
//!
//! Outer entries are removed as soon as their last inner entry is removed,
//! so an index never accumulates empty inner containers.

use std::{
    borrow::Borrow,
    collections::{hash_map, HashMap, HashSet},
    fmt,
    hash::Hash,
};

/// Set of `(outer, inner)` key pairs.
pub struct DoubleKeyedSet<K1, K2> {
    map: HashMap<K1, HashSet<K2>>,
    len: usize,
}

impl<K1, K2> Default for DoubleKeyedSet<K1, K2> {
    fn default() -> Self {
        Self { map: HashMap::new(), len: 0 }
    }
}

impl<K1, K2> fmt::Debug for DoubleKeyedSet<K1, K2>
where
    K1: fmt::Debug,
    K2: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_map().entries(self.map.iter()).finish()
    }
}

impl<K1, K2> DoubleKeyedSet<K1, K2>
where
    K1: Hash + Eq,
    K2: Hash + Eq,
{
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a key pair.
    ///
    /// Returns whether the pair was newly inserted.
    pub fn insert(&mut self, key1: K1, key2: K2) -> bool {
        let inserted = self.map.entry(key1).or_default().insert(key2);
        if inserted {
            self.len += 1;
        }
        inserted
    }

    /// Returns whether the key pair is present.
    pub fn contains<Q1, Q2>(&self, key1: &Q1, key2: &Q2) -> bool
    where
        K1: Borrow<Q1>,
        K2: Borrow<Q2>,
        Q1: Hash + Eq + ?Sized,
        Q2: Hash + Eq + ?Sized,
    {
        self.map.get(key1).map(|inner| inner.contains(key2)).unwrap_or_default()
    }

    /// Removes a key pair.
    ///
    /// Returns whether the pair was present.
    pub fn remove<Q1, Q2>(&mut self, key1: &Q1, key2: &Q2) -> bool
    where
        K1: Borrow<Q1>,
        K2: Borrow<Q2>,
        Q1: Hash + Eq + ?Sized,
        Q2: Hash + Eq + ?Sized,
    {
        let Some(inner) = self.map.get_mut(key1) else { return false };
        if !inner.remove(key2) {
            return false;
        }
        if inner.is_empty() {
            self.map.remove(key1);
        }
        self.len -= 1;
        true
    }

    /// Inner keys stored under the specified outer key.
    pub fn get<Q1>(&self, key1: &Q1) -> Option<&HashSet<K2>>
    where
        K1: Borrow<Q1>,
        Q1: Hash + Eq + ?Sized,
    {
        self.map.get(key1)
    }

    /// Number of key pairs.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of distinct outer keys.
    pub fn outer_len(&self) -> usize {
        self.map.len()
    }

    /// Iterates over all key pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&K1, &K2)> {
        self.map.iter().flat_map(|(key1, inner)| inner.iter().map(move |key2| (key1, key2)))
    }

    /// Iterates over all outer keys together with their inner keys.
    pub fn groups(&self) -> hash_map::Iter<'_, K1, HashSet<K2>> {
        self.map.iter()
    }
}

/// Map from `(outer, inner)` key pairs to values.
pub struct DoubleKeyedMap<K1, K2, V> {
    map: HashMap<K1, HashMap<K2, V>>,
    len: usize,
}

impl<K1, K2, V> Default for DoubleKeyedMap<K1, K2, V> {
    fn default() -> Self {
        Self { map: HashMap::new(), len: 0 }
    }
}

impl<K1, K2, V> fmt::Debug for DoubleKeyedMap<K1, K2, V>
where
    K1: fmt::Debug,
    K2: fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_map().entries(self.map.iter()).finish()
    }
}

impl<K1, K2, V> DoubleKeyedMap<K1, K2, V>
where
    K1: Hash + Eq,
    K2: Hash + Eq,
{
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, returning the previous value stored under the key pair.
    pub fn insert(&mut self, key1: K1, key2: K2, value: V) -> Option<V> {
        let prev = self.map.entry(key1).or_default().insert(key2, value);
        if prev.is_none() {
            self.len += 1;
        }
        prev
    }

    /// Returns whether a value is stored under the key pair.
    pub fn contains_key<Q1, Q2>(&self, key1: &Q1, key2: &Q2) -> bool
    where
        K1: Borrow<Q1>,
        K2: Borrow<Q2>,
        Q1: Hash + Eq + ?Sized,
        Q2: Hash + Eq + ?Sized,
    {
        self.get(key1, key2).is_some()
    }

    /// Value stored under the key pair.
    pub fn get<Q1, Q2>(&self, key1: &Q1, key2: &Q2) -> Option<&V>
    where
        K1: Borrow<Q1>,
        K2: Borrow<Q2>,
        Q1: Hash + Eq + ?Sized,
        Q2: Hash + Eq + ?Sized,
    {
        self.map.get(key1).and_then(|inner| inner.get(key2))
    }

    /// Removes and returns the value stored under the key pair.
    pub fn remove<Q1, Q2>(&mut self, key1: &Q1, key2: &Q2) -> Option<V>
    where
        K1: Borrow<Q1>,
        K2: Borrow<Q2>,
        Q1: Hash + Eq + ?Sized,
        Q2: Hash + Eq + ?Sized,
    {
        let inner = self.map.get_mut(key1)?;
        let value = inner.remove(key2)?;
        if inner.is_empty() {
            self.map.remove(key1);
        }
        self.len -= 1;
        Some(value)
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of distinct outer keys.
    pub fn outer_len(&self) -> usize {
        self.map.len()
    }

    /// Iterates over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (&K1, &K2, &V)> {
        self.map.iter().flat_map(|(key1, inner)| inner.iter().map(move |(key2, value)| (key1, key2, value)))
    }
}
