// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Move lists are the changesets exchanged between the table owners and the
//! session/commit machinery.
//!
//! A table owner turns a client request into a `MoveList` describing, in
//! order, every change it made to its logical state.  The list is then
//! either applied to the hardware, saved in the session until its
//! transaction commits, or dropped.  A `MoveList` cannot be cloned: whoever
//! holds it owns every node and payload in it, and dropping it releases them
//! exactly once.  Entries are never reordered, since a later move may depend
//! on a location freed or filled by an earlier one.
//!
//! Every move affects a single entry or group.  There are no bulk variants
//! adding or relocating several match entries in one node: a range of
//! entries is expressed as one `MatAdd` or `MatMove` per entry, in the
//! order the hardware must see them.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::EnumDiscriminants;

use aal::{ActionData, DirectResource, HwMatEntry, MatchData};
use common::table::TblHdl;
use common::{DevId, EntryHdl, PipeScope};

use crate::types::PipeResult;

/// The action side of a match entry.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
pub struct EntrySpec {
    pub action: ActionData,
    /// Idle timeout in milliseconds, 0 if the entry never ages
    #[serde(default)]
    pub ttl: u32,
    #[serde(default)]
    pub resources: Vec<DirectResource>,
}

impl EntrySpec {
    pub fn new(action: ActionData) -> Self {
        EntrySpec {
            action,
            ttl: 0,
            resources: Vec::new(),
        }
    }
}

/// A complete match entry: key, lookup priority and action side.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
pub struct MatEntry {
    pub key: MatchData,
    pub priority: u32,
    pub spec: EntrySpec,
}

impl MatEntry {
    /// The bytes identifying this entry's key.  Two entries with equal spec
    /// keys can never coexist in one table instance.
    pub fn spec_key(&self) -> Vec<u8> {
        let mut key = self.key.normalized();
        key.extend(self.priority.to_be_bytes());
        key
    }

    pub fn to_hw(&self) -> HwMatEntry {
        HwMatEntry {
            key: self.key.clone(),
            priority: self.priority,
            action: self.spec.action.clone(),
            ttl: self.spec.ttl,
            resources: self.spec.resources.clone(),
        }
    }

    pub fn from_hw(hw: HwMatEntry) -> Self {
        MatEntry {
            key: hw.key,
            priority: hw.priority,
            spec: EntrySpec {
                action: hw.action,
                ttl: hw.ttl,
                resources: hw.resources,
            },
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct SelMember {
    /// Handle of the member's entry in the selector's action-data table
    pub hdl: EntryHdl,
    pub active: bool,
}

/// The full contents of a selector group.
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct SelGroupData {
    pub max_size: u32,
    pub members: Vec<SelMember>,
}

/// The payload carried by a move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryData {
    Mat(MatEntry),
    Adt(ActionData),
    /// The state of a selector group after the move is applied
    SelGroup(SelGroupData),
    Default(ActionData),
    /// The action-data handle of a selector's fallback member
    Fallback(EntryHdl),
}

impl EntryData {
    pub fn as_mat(&self) -> Option<&MatEntry> {
        match self {
            EntryData::Mat(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_adt(&self) -> Option<&ActionData> {
        match self {
            EntryData::Adt(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_sel_group(&self) -> Option<&SelGroupData> {
        match self {
            EntryData::SelGroup(g) => Some(g),
            _ => None,
        }
    }
}

/// A single table mutation.  Each variant carries the handle it affects and
/// the physical location(s) involved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumDiscriminants)]
#[strum_discriminants(
    name(MoveKind),
    derive(strum::Display, strum::IntoStaticStr, Hash, PartialOrd, Ord)
)]
pub enum MoveOp {
    MatAdd { hdl: EntryHdl, index: u32 },
    MatMove { hdl: EntryHdl, from: u32, to: u32 },
    MatDelete { hdl: EntryHdl, index: u32 },
    MatModify { hdl: EntryHdl, index: u32 },
    MatSetDefault,
    MatClearDefault,
    AdtAdd { hdl: EntryHdl, index: u32 },
    AdtModify { hdl: EntryHdl, index: u32 },
    AdtDelete { hdl: EntryHdl, index: u32 },
    SelGrpCreate { grp: EntryHdl, index: u32 },
    SelGrpDestroy { grp: EntryHdl, index: u32 },
    SelMbrAdd { grp: EntryHdl, index: u32, mbr: EntryHdl },
    SelMbrDel { grp: EntryHdl, index: u32, mbr: EntryHdl },
    SelMbrActivate { grp: EntryHdl, index: u32, mbr: EntryHdl },
    SelMbrDeactivate { grp: EntryHdl, index: u32, mbr: EntryHdl },
    SelFallbackSet { mbr: EntryHdl },
    SelFallbackClear,
}

impl MoveOp {
    pub fn kind(&self) -> MoveKind {
        MoveKind::from(self)
    }

    /// The entry or group handle this move affects, if any.
    pub fn hdl(&self) -> Option<EntryHdl> {
        match *self {
            MoveOp::MatAdd { hdl, .. }
            | MoveOp::MatMove { hdl, .. }
            | MoveOp::MatDelete { hdl, .. }
            | MoveOp::MatModify { hdl, .. }
            | MoveOp::AdtAdd { hdl, .. }
            | MoveOp::AdtModify { hdl, .. }
            | MoveOp::AdtDelete { hdl, .. } => Some(hdl),
            MoveOp::SelGrpCreate { grp, .. }
            | MoveOp::SelGrpDestroy { grp, .. }
            | MoveOp::SelMbrAdd { grp, .. }
            | MoveOp::SelMbrDel { grp, .. }
            | MoveOp::SelMbrActivate { grp, .. }
            | MoveOp::SelMbrDeactivate { grp, .. } => Some(grp),
            MoveOp::SelFallbackSet { mbr } => Some(mbr),
            MoveOp::MatSetDefault
            | MoveOp::MatClearDefault
            | MoveOp::SelFallbackClear => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct MoveListEntry {
    pub op: MoveOp,
    pub pipe: PipeScope,
    pub data: Option<EntryData>,
}

impl MoveListEntry {
    pub fn data(&self) -> PipeResult<&EntryData> {
        self.data.as_ref().ok_or_else(|| {
            format!("{:?} move carries no entry data", self.op).into()
        })
    }
}

/// A notification describing one change applied to a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableUpdate {
    pub dev: DevId,
    pub tbl: TblHdl,
    pub pipe: PipeScope,
    pub kind: MoveKind,
    pub hdl: Option<EntryHdl>,
}

/// An ordered, exclusively owned list of moves.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MoveList {
    entries: Vec<MoveListEntry>,
}

impl MoveList {
    pub fn new() -> Self {
        MoveList::default()
    }

    /// Allocate a new node at the tail of the list.
    pub fn allocate(
        &mut self,
        op: MoveOp,
        pipe: PipeScope,
        data: Option<EntryData>,
    ) -> PipeResult<()> {
        self.entries.try_reserve(1)?;
        self.entries.push(MoveListEntry { op, pipe, data });
        Ok(())
    }

    /// Move every node of `other` onto the tail of this list.
    pub fn append(&mut self, other: MoveList) -> PipeResult<()> {
        self.entries.try_reserve(other.entries.len())?;
        self.entries.extend(other.entries);
        Ok(())
    }

    /// Make sure that at least `additional` more nodes can be appended
    /// without allocating.
    pub fn reserve(&mut self, additional: usize) -> PipeResult<()> {
        self.entries.try_reserve(additional)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MoveListEntry> {
        self.entries.iter()
    }

    /// The notifications to send once this list has taken effect.
    pub fn updates(&self, dev: DevId, tbl: TblHdl) -> Vec<TableUpdate> {
        self.entries
            .iter()
            .map(|e| TableUpdate {
                dev,
                tbl,
                pipe: e.pipe,
                kind: e.op.kind(),
                hdl: e.op.hdl(),
            })
            .collect()
    }
}

impl IntoIterator for MoveList {
    type Item = MoveListEntry;
    type IntoIter = std::vec::IntoIter<MoveListEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a MoveList {
    type Item = &'a MoveListEntry;
    type IntoIter = std::slice::Iter<'a, MoveListEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
