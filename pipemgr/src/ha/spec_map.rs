// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The spec map pairs the entries recovered from the hardware with the
//! entries the restarted control plane replays, one table instance at a
//! time.
//!
//! Every observed key gets a single arena entry, found through the key index.
//! Each entry sits in exactly one of four worklists, and the list it sits in
//! is a pure function of which sides of the entry are present and how they
//! compare.  Whenever a side arrives, changes or leaves, the entry is
//! re-classified and moved to the right list.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use aal::{resources_match, ActionData};
use common::table::TableKind;
use common::EntryHdl;

use crate::move_list::EntryData;
use crate::types::{PipeError, PipeResult};

/// The four reconciliation worklists.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Worklist {
    FullMatch,
    Add,
    Modify,
    Delete,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// The key has been seen on one side only
    Invalid,
    FullMatch,
    /// The action function differs but its parameters are identical
    ActionHdlDirty,
    /// The action function agrees but its parameters (or idle timeout) do
    /// not
    ActionDataDirty,
    /// Both the action function and its parameters differ
    ActionDataMiss,
    ResourceMismatch,
}

impl Classification {
    /// Compare the contents recovered from the hardware with the contents
    /// replayed for the same key.
    pub fn of(hw: &EntryData, replay: &EntryData) -> Classification {
        match (hw, replay) {
            (EntryData::Mat(h), EntryData::Mat(r)) => {
                let (h, r) = (&h.spec, &r.spec);
                if !resources_match(&h.resources, &r.resources) {
                    Classification::ResourceMismatch
                } else if h.action.action != r.action.action {
                    if h.action.normalized_args() == r.action.normalized_args()
                    {
                        Classification::ActionHdlDirty
                    } else {
                        Classification::ActionDataMiss
                    }
                } else if h.action.normalized_args()
                    != r.action.normalized_args()
                    || h.ttl != r.ttl
                {
                    Classification::ActionDataDirty
                } else {
                    Classification::FullMatch
                }
            }
            // Action data is part of the key, so matching keys are equal.
            (EntryData::Adt(_), EntryData::Adt(_)) => Classification::FullMatch,
            (h, r) if h == r => Classification::FullMatch,
            _ => Classification::ActionDataMiss,
        }
    }
}

/// One side of a spec map entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Side {
    pub hdl: EntryHdl,
    pub data: EntryData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecMapEntry {
    pub key: Vec<u8>,
    pub class: Classification,
    /// The entry as recovered from the hardware, under its temporary handle
    pub hw: Option<Side>,
    /// The entry as replayed, under the handle returned to the caller
    pub replay: Option<Side>,
    pub list: Worklist,
}

impl SpecMapEntry {
    /// Work out the classification and worklist implied by the sides
    /// present.  Returns false if neither side is left.
    fn classify(&mut self) -> bool {
        let (class, list) = match (&self.hw, &self.replay) {
            (Some(h), Some(r)) => {
                let class = Classification::of(&h.data, &r.data);
                let list = match class {
                    Classification::FullMatch => Worklist::FullMatch,
                    _ => Worklist::Modify,
                };
                (class, list)
            }
            (Some(_), None) => (Classification::Invalid, Worklist::Delete),
            (None, Some(_)) => (Classification::Invalid, Worklist::Add),
            (None, None) => return false,
        };
        self.class = class;
        self.list = list;
        true
    }
}

type EntryId = u64;

#[derive(Debug)]
pub struct SpecMap {
    kind: TableKind,
    arena: BTreeMap<EntryId, SpecMapEntry>,
    keys: HashMap<Vec<u8>, EntryId>,
    replay_hdls: HashMap<EntryHdl, EntryId>,
    // Entry ids increase monotonically, so each list iterates in the order
    // its keys were first observed.
    lists: BTreeMap<Worklist, BTreeSet<EntryId>>,
    next_id: EntryId,
    // Copies of identical action data seen so far, per side
    hw_copies: HashMap<Vec<u8>, u32>,
    replay_copies: HashMap<Vec<u8>, u32>,
    hw_default: Option<ActionData>,
    replay_default: Option<ActionData>,
}

impl SpecMap {
    pub fn new(kind: TableKind) -> Self {
        SpecMap {
            kind,
            arena: BTreeMap::new(),
            keys: HashMap::new(),
            replay_hdls: HashMap::new(),
            lists: BTreeMap::new(),
            next_id: 0,
            hw_copies: HashMap::new(),
            replay_copies: HashMap::new(),
            hw_default: None,
            replay_default: None,
        }
    }

    /// The normalized key of an entry.  Action-data tables may hold the same
    /// data many times, so their key also counts the copies seen on one
    /// side: the n-th replayed copy pairs with the n-th recovered copy.
    fn key_of(&mut self, data: &EntryData, hw: bool) -> PipeResult<Vec<u8>> {
        match (self.kind, data) {
            (TableKind::Match, EntryData::Mat(e)) => Ok(e.spec_key()),
            (TableKind::ActionData, EntryData::Adt(a)) => {
                let mut key = a.normalized();
                let copies = if hw {
                    &mut self.hw_copies
                } else {
                    &mut self.replay_copies
                };
                let n = copies.entry(key.clone()).or_insert(0);
                key.extend(n.to_be_bytes());
                *n += 1;
                Ok(key)
            }
            (kind, data) => Err(PipeError::Invalid(format!(
                "{kind} table cannot reconcile {data:?}"
            ))),
        }
    }

    fn list_remove(&mut self, id: EntryId, list: Worklist) {
        if let Some(ids) = self.lists.get_mut(&list) {
            ids.remove(&id);
        }
    }

    /// Re-classify an entry after one of its sides changed, moving it to the
    /// right worklist or dropping it if neither side is left.
    fn relocate(&mut self, id: EntryId) {
        let Some(entry) = self.arena.get_mut(&id) else {
            return;
        };
        let old = entry.list;
        let alive = entry.classify();
        let new = entry.list;
        if !alive {
            let key = entry.key.clone();
            self.arena.remove(&id);
            self.keys.remove(&key);
            self.list_remove(id, old);
            return;
        }
        if old != new {
            self.list_remove(id, old);
        }
        self.lists.entry(new).or_default().insert(id);
    }

    /// Find or create the entry for a key.
    fn entry_for(&mut self, key: Vec<u8>) -> EntryId {
        if let Some(id) = self.keys.get(&key) {
            return *id;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.keys.insert(key.clone(), id);
        self.arena.insert(
            id,
            SpecMapEntry {
                key,
                class: Classification::Invalid,
                hw: None,
                replay: None,
                list: Worklist::Add,
            },
        );
        id
    }

    /// Record an entry recovered from the hardware.
    pub fn insert_hw(&mut self, hdl: EntryHdl, data: EntryData) -> PipeResult<()> {
        let key = self.key_of(&data, true)?;
        let id = self.entry_for(key);
        if let Some(entry) = self.arena.get_mut(&id) {
            if entry.hw.is_some() {
                return Err(PipeError::Exists(format!(
                    "hardware entry {hdl} duplicates a recovered key"
                )));
            }
            entry.hw = Some(Side { hdl, data });
        }
        self.relocate(id);
        Ok(())
    }

    /// Record a replayed entry.  A key can only be replayed once.
    pub fn insert_replay(
        &mut self,
        hdl: EntryHdl,
        data: EntryData,
    ) -> PipeResult<()> {
        if self.replay_hdls.contains_key(&hdl) {
            return Err(PipeError::Exists(format!("replayed entry {hdl}")));
        }
        self.replay_add(data, || Ok(hdl)).map(|_| ())
    }

    /// Record a replayed entry under a handle taken from `alloc`.  The
    /// handle is only taken once the key is known to be new.
    pub fn replay_add<F>(
        &mut self,
        data: EntryData,
        alloc: F,
    ) -> PipeResult<EntryHdl>
    where
        F: FnOnce() -> PipeResult<EntryHdl>,
    {
        let key = self.key_of(&data, false)?;
        if let Some(id) = self.keys.get(&key) {
            if self.arena.get(id).is_some_and(|e| e.replay.is_some()) {
                return Err(PipeError::Exists(
                    "replayed entry duplicates an earlier key".into(),
                ));
            }
        }
        let hdl = alloc()?;
        let id = self.entry_for(key);
        if let Some(entry) = self.arena.get_mut(&id) {
            entry.replay = Some(Side { hdl, data });
        }
        self.replay_hdls.insert(hdl, id);
        self.relocate(id);
        Ok(hdl)
    }

    /// Replace the contents of a replayed entry.  If the change alters the
    /// entry's key, the entry moves to the new key.
    pub fn replay_modify(
        &mut self,
        hdl: EntryHdl,
        data: EntryData,
    ) -> PipeResult<()> {
        let id = *self
            .replay_hdls
            .get(&hdl)
            .ok_or_else(|| PipeError::Missing(format!("replayed entry {hdl}")))?;
        let rekey = match (&data, self.arena.get(&id)) {
            (EntryData::Mat(new), Some(entry)) => match &entry.replay {
                Some(Side {
                    data: EntryData::Mat(old),
                    ..
                }) => old.spec_key() != new.spec_key(),
                _ => true,
            },
            _ => true,
        };
        if rekey {
            self.replay_remove(hdl)?;
            return self.insert_replay(hdl, data);
        }
        if let Some(entry) = self.arena.get_mut(&id) {
            if let Some(side) = entry.replay.as_mut() {
                side.data = data;
            }
        }
        self.relocate(id);
        Ok(())
    }

    /// Forget a replayed entry.
    pub fn replay_remove(&mut self, hdl: EntryHdl) -> PipeResult<EntryData> {
        let id = self
            .replay_hdls
            .remove(&hdl)
            .ok_or_else(|| PipeError::Missing(format!("replayed entry {hdl}")))?;
        let side = self
            .arena
            .get_mut(&id)
            .and_then(|e| e.replay.take())
            .ok_or_else(|| PipeError::Other(format!("entry {hdl} unlinked")))?;
        self.relocate(id);
        Ok(side.data)
    }

    pub fn replay_get(&self, hdl: EntryHdl) -> Option<&EntryData> {
        let id = self.replay_hdls.get(&hdl)?;
        self.arena
            .get(id)?
            .replay
            .as_ref()
            .map(|side| &side.data)
    }

    pub fn hw_default_set(&mut self, action: Option<ActionData>) {
        self.hw_default = action;
    }

    pub fn hw_default(&self) -> Option<&ActionData> {
        self.hw_default.as_ref()
    }

    /// Record the default action replayed for the table.  `None` means the
    /// table falls back to its static default.
    pub fn replay_default_set(&mut self, action: Option<ActionData>) {
        self.replay_default = action;
    }

    pub fn replay_default(&self) -> Option<&ActionData> {
        self.replay_default.as_ref()
    }

    /// The entries of one worklist, in the order their keys were first
    /// observed.
    pub fn list(&self, list: Worklist) -> impl Iterator<Item = &SpecMapEntry> {
        self.lists
            .get(&list)
            .into_iter()
            .flatten()
            .filter_map(|id| self.arena.get(id))
    }

    pub fn list_len(&self, list: Worklist) -> usize {
        self.lists.get(&list).map_or(0, |ids| ids.len())
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// The number of entries in each classification.
    pub fn class_counts(&self) -> BTreeMap<Classification, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.arena.values() {
            *counts.entry(entry.class).or_insert(0) += 1;
        }
        counts
    }

    /// Verify that every entry is reachable through the key index and from
    /// exactly the worklist its sides call for.
    #[cfg(test)]
    fn check(&self) {
        let listed: usize = self.lists.values().map(|l| l.len()).sum();
        assert_eq!(listed, self.arena.len());
        assert_eq!(self.keys.len(), self.arena.len());
        for (id, entry) in &self.arena {
            assert_eq!(self.keys.get(&entry.key), Some(id));
            assert!(self.lists[&entry.list].contains(id));
            let mut copy = entry.clone();
            assert!(copy.classify());
            assert_eq!(copy.list, entry.list);
        }
    }
}
