use linked_hash_map::LinkedHashMap;
use std::{fmt::Display, hash::Hash, iter::IntoIterator};
use thiserror::Error;

/// An insertion-ordered map that rejects duplicate keys on plain insertion
/// and can mint a fresh, non-colliding key when a duplicate is expected.
/// Document shapes and group accumulator sets are keyed by output field
/// name, where both the ordering and the uniqueness are semantic.
#[derive(Debug, Hash, Default, Clone, PartialEq, Eq)]
pub struct UniqueOrderedMap<K, V>(LinkedHashMap<K, V>)
where
    K: Hash + Eq + PartialEq + Display;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("duplicate key found: {0}")]
pub struct DuplicateKeyError(pub String);

impl<K, V> UniqueOrderedMap<K, V>
where
    K: Hash + PartialEq + Eq + Display,
{
    pub fn new() -> Self {
        Self(LinkedHashMap::new())
    }

    pub fn insert(&mut self, k: K, v: V) -> Result<(), DuplicateKeyError> {
        // We check if the key already exists to avoid the clone
        // necessary to check _after_ inserting, since we want
        // to return the key in the error, not the value.
        if self.0.contains_key(&k) {
            return Err(DuplicateKeyError(format!("{}", k)));
        }
        self.0.insert(k, v);
        Ok(())
    }

    /// Inserts `v` under `k`, replacing (in place, keeping the original
    /// insertion position) any existing value.
    pub fn insert_or_replace(&mut self, k: K, v: V) {
        self.0.insert(k, v);
    }

    pub fn get(&self, k: &K) -> Option<&V> {
        self.0.get(k)
    }

    pub fn contains_key(&self, k: &K) -> bool {
        self.0.contains_key(k)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.0.iter()
    }
}

impl<V> UniqueOrderedMap<String, V> {
    /// Inserts `v` under `base` if that key is free, otherwise under the
    /// first free `base_1`, `base_2`, ... and returns the key actually
    /// used. Fresh-name minting is a pure function of the keys already in
    /// the map.
    pub fn insert_fresh(&mut self, base: &str, v: V) -> String {
        if !self.0.contains_key(base) {
            self.0.insert(base.to_string(), v);
            return base.to_string();
        }
        let mut n = 1usize;
        loop {
            let candidate = format!("{}_{}", base, n);
            if !self.0.contains_key(&candidate) {
                self.0.insert(candidate.clone(), v);
                return candidate;
            }
            n += 1;
        }
    }
}

impl<K, V> IntoIterator for UniqueOrderedMap<K, V>
where
    K: Hash + PartialEq + Eq + Display,
{
    type Item = (K, V);
    type IntoIter = linked_hash_map::IntoIter<K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
