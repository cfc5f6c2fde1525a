// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Containers that can undo every change made since a mark.
//!
//! A table owner updates its logical state as soon as it produces a move
//! list, long before anyone knows whether the hardware will accept the
//! change or the surrounding transaction will commit.  Keeping that state in
//! journaled containers lets the owner throw the provisional changes away
//! without having to compute the inverse of each operation.

use std::collections::BTreeMap;

/// A map that records the prior value of every key it touches while a stage
/// is open.
#[derive(Debug)]
pub struct Journaled<K: Ord + Clone, V: Clone> {
    map: BTreeMap<K, V>,
    undo: Option<Vec<(K, Option<V>)>>,
}

impl<K: Ord + Clone, V: Clone> Default for Journaled<K, V> {
    fn default() -> Self {
        Journaled {
            map: BTreeMap::new(),
            undo: None,
        }
    }
}

impl<K: Ord + Clone, V: Clone> Journaled<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, key: &K) {
        if let Some(undo) = &mut self.undo {
            undo.push((key.clone(), self.map.get(key).cloned()));
        }
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.record(&key);
        self.map.insert(key, value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        if !self.map.contains_key(key) {
            return None;
        }
        self.record(key);
        self.map.remove(key)
    }

    /// Mutable access to a value.  The value's current contents are
    /// journaled whether or not the caller changes it.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if !self.map.contains_key(key) {
            return None;
        }
        self.record(key);
        self.map.get_mut(key)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> std::collections::btree_map::Iter<'_, K, V> {
        self.map.iter()
    }

    pub fn keys(&self) -> std::collections::btree_map::Keys<'_, K, V> {
        self.map.keys()
    }

    pub fn values(&self) -> std::collections::btree_map::Values<'_, K, V> {
        self.map.values()
    }

    pub fn range<R>(
        &self,
        range: R,
    ) -> std::collections::btree_map::Range<'_, K, V>
    where
        R: std::ops::RangeBounds<K>,
    {
        self.map.range(range)
    }

    /// Remove every key, journaling each one.
    pub fn clear(&mut self) {
        let keys: Vec<K> = self.map.keys().cloned().collect();
        for k in keys {
            self.remove(&k);
        }
    }

    /// Start recording changes.  Does nothing if a stage is already open.
    pub fn begin(&mut self) {
        if self.undo.is_none() {
            self.undo = Some(Vec::new());
        }
    }

    /// Keep every change made since `begin`.
    pub fn commit(&mut self) {
        self.undo = None;
    }

    /// Undo every change made since `begin`.
    pub fn revert(&mut self) {
        if let Some(undo) = self.undo.take() {
            for (key, prior) in undo.into_iter().rev() {
                match prior {
                    Some(v) => self.map.insert(key, v),
                    None => self.map.remove(&key),
                };
            }
        }
    }
}

/// A single journaled value.
#[derive(Debug, Default)]
pub struct JournaledValue<T: Clone> {
    value: T,
    prior: Option<T>,
    open: bool,
}

impl<T: Clone> JournaledValue<T> {
    pub fn new(value: T) -> Self {
        JournaledValue {
            value,
            prior: None,
            open: false,
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn set(&mut self, value: T) -> T {
        if self.open && self.prior.is_none() {
            self.prior = Some(self.value.clone());
        }
        std::mem::replace(&mut self.value, value)
    }

    /// Set a value that survives a revert of the open stage.
    pub fn set_committed(&mut self, value: T) {
        if self.prior.is_some() {
            self.prior = Some(value.clone());
        }
        self.value = value;
    }

    pub fn begin(&mut self) {
        self.open = true;
    }

    pub fn commit(&mut self) {
        self.open = false;
        self.prior = None;
    }

    pub fn revert(&mut self) {
        if let Some(prior) = self.prior.take() {
            self.value = prior;
        }
        self.open = false;
    }
}
