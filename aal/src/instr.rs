// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Hardware-level programming instructions and the records returned when a
//! table is read back from the device.
//!
//! Instructions address table memories by physical index.  Handles are a
//! purely software notion and never reach the hardware, which is why a table
//! read after a restart can only be matched to the software's intent by
//! comparing keys.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use common::table::TblHdl;
use common::PipeScope;

use crate::ActionData;
use crate::DirectResource;
use crate::MatchData;

/// A match entry as it is laid out in a table memory.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
pub struct HwMatEntry {
    pub key: MatchData,
    /// Lookup priority for ternary tables, 0 for exact-match tables.
    pub priority: u32,
    pub action: ActionData,
    /// Idle timeout in milliseconds, 0 if the entry never ages
    pub ttl: u32,
    pub resources: Vec<DirectResource>,
}

/// A selector member as it is laid out in a group's member word.
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
pub struct HwSelMember {
    pub adt_index: u32,
    pub active: bool,
}

/// A single table-programming instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Instr {
    /// Write a complete match entry into a slot
    MatWrite {
        tbl: TblHdl,
        pipe: PipeScope,
        index: u32,
        entry: HwMatEntry,
    },
    /// Rewrite the action side of an occupied slot, leaving its key in place
    MatUpdate {
        tbl: TblHdl,
        pipe: PipeScope,
        index: u32,
        action: ActionData,
        ttl: u32,
        resources: Vec<DirectResource>,
    },
    /// Invalidate a slot
    MatClear { tbl: TblHdl, pipe: PipeScope, index: u32 },
    /// Install (or, with `None`, remove) the action taken on a table miss
    MatDefault {
        tbl: TblHdl,
        pipe: PipeScope,
        action: Option<ActionData>,
    },
    AdtWrite {
        tbl: TblHdl,
        pipe: PipeScope,
        index: u32,
        action: ActionData,
    },
    AdtClear { tbl: TblHdl, pipe: PipeScope, index: u32 },
    /// Write the full member word of a selector group
    SelWrite {
        tbl: TblHdl,
        pipe: PipeScope,
        group: u32,
        max_size: u32,
        members: Vec<HwSelMember>,
    },
    SelClear { tbl: TblHdl, pipe: PipeScope, group: u32 },
    /// Set the action-data index used when a selected group has no active
    /// members
    SelFallback {
        tbl: TblHdl,
        pipe: PipeScope,
        member: Option<u32>,
    },
    /// Flip the pipeline's table-version bit, so newly arriving packets see
    /// the entries written under the new version.
    VersionBump,
    /// Return the table-version bit to its idle value.
    VersionReset,
}

impl Instr {
    /// The table this instruction writes, if any.
    pub fn table(&self) -> Option<TblHdl> {
        match self {
            Instr::MatWrite { tbl, .. }
            | Instr::MatUpdate { tbl, .. }
            | Instr::MatClear { tbl, .. }
            | Instr::MatDefault { tbl, .. }
            | Instr::AdtWrite { tbl, .. }
            | Instr::AdtClear { tbl, .. }
            | Instr::SelWrite { tbl, .. }
            | Instr::SelClear { tbl, .. }
            | Instr::SelFallback { tbl, .. } => Some(*tbl),
            Instr::VersionBump | Instr::VersionReset => None,
        }
    }

    /// Short name for logging and fault injection.
    pub fn op_name(&self) -> &'static str {
        match self {
            Instr::MatWrite { .. } => "mat_write",
            Instr::MatUpdate { .. } => "mat_update",
            Instr::MatClear { .. } => "mat_clear",
            Instr::MatDefault { .. } => "mat_default",
            Instr::AdtWrite { .. } => "adt_write",
            Instr::AdtClear { .. } => "adt_clear",
            Instr::SelWrite { .. } => "sel_write",
            Instr::SelClear { .. } => "sel_clear",
            Instr::SelFallback { .. } => "sel_fallback",
            Instr::VersionBump => "version_bump",
            Instr::VersionReset => "version_reset",
        }
    }

    /// Returns true for instructions that remove state from a table.
    pub fn is_clear(&self) -> bool {
        matches!(
            self,
            Instr::MatClear { .. }
                | Instr::AdtClear { .. }
                | Instr::SelClear { .. }
        )
    }
}

/// One record from a hardware table read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HwRecord {
    Mat { index: u32, entry: HwMatEntry },
    MatDefault { action: ActionData },
    Adt { index: u32, action: ActionData },
    SelGroup {
        group: u32,
        max_size: u32,
        members: Vec<HwSelMember>,
    },
    SelFallback { member: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instr_table() {
        let clear = Instr::MatClear {
            tbl: 7,
            pipe: PipeScope::Pipe(1),
            index: 3,
        };
        assert_eq!(clear.table(), Some(7));
        assert_eq!(clear.op_name(), "mat_clear");
        assert!(clear.is_clear());

        assert_eq!(Instr::VersionBump.table(), None);
        assert!(!Instr::VersionReset.is_clear());
    }
}
