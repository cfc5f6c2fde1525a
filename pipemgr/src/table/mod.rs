// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::o;

use aal::{ActionData, AsicOps, Instr};
use common::table::{TableKind, TblHdl};
use common::{DevId, EntryHdl, PipeId, PipeScope, HA_TEMP_HDL_BASE};

use crate::config::TableConfig;
use crate::ha::spec_map::Worklist;
use crate::ilist::{InstrLog, Section};
use crate::move_list::{EntryData, EntrySpec, MatEntry, MoveList};
use crate::types::*;

pub mod adt;
pub mod journal;
pub mod mat;
pub mod sel;

/// Static description of a table, taken from the config.
#[derive(Clone, Debug)]
pub struct TableInfo {
    pub handle: TblHdl,
    pub name: String,
    pub kind: TableKind,
    pub size: u32,
    pub symmetric: bool,
    pub ternary: bool,
    pub default_action: Option<ActionData>,
    pub reconcile_order: Vec<Worklist>,
    pub action_table: Option<TblHdl>,
}

impl From<&TableConfig> for TableInfo {
    fn from(c: &TableConfig) -> Self {
        TableInfo {
            handle: c.handle,
            name: c.name.clone(),
            kind: c.kind,
            size: c.size,
            symmetric: c.symmetric,
            ternary: c.ternary,
            default_action: c.default_action.clone(),
            reconcile_order: c.reconcile_order.clone(),
            action_table: c.action_table,
        }
    }
}

impl TableInfo {
    /// The pipe scopes holding an independent instance of this table.
    pub fn scopes(&self, pipes: &[PipeId]) -> Vec<PipeScope> {
        if self.symmetric {
            vec![PipeScope::All]
        } else {
            pipes.iter().map(|p| PipeScope::Pipe(*p)).collect()
        }
    }

    /// Verify that the table may be addressed with the given pipe scope.
    pub fn check_scope(&self, pipe: PipeScope) -> PipeResult<()> {
        match (self.symmetric, pipe) {
            (true, PipeScope::All) | (false, PipeScope::Pipe(_)) => Ok(()),
            (true, _) => Err(PipeError::Invalid(format!(
                "symmetric table {} must be addressed with all pipes",
                self.name
            ))),
            (false, _) => Err(PipeError::Invalid(format!(
                "asymmetric table {} must be addressed one pipe at a time",
                self.name
            ))),
        }
    }
}

/// Basic statistics about table usage
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct TableUsage {
    /// Maximum number of entries in each table instance
    pub size: u32,
    /// Current number of entries in all table instances
    pub occupancy: u32,
    /// Total number of entries inserted over time
    pub inserts: u64,
    /// Total number of entries deleted over time
    pub deletes: u64,
    /// Number of entries updated in place over time
    pub updates: u64,
    /// Number of inserts failed due to a collision
    pub collisions: u64,
    /// Number of updates failed due to a missing entry
    pub update_misses: u64,
    /// Number of deletes failed due to a missing entry
    pub delete_misses: u64,
    /// Number of inserts that failed due to space exhaustion
    pub exhaustion: u64,
}

impl TableUsage {
    /// Initialize a TableUsage structure with the provided size
    pub fn new(size: u32) -> TableUsage {
        TableUsage {
            size,
            ..Default::default()
        }
    }
}

/// A client request, in terms of the table's own logical state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TableRequest {
    MatAdd { entry: MatEntry },
    MatModify { hdl: EntryHdl, spec: EntrySpec },
    MatDelete { hdl: EntryHdl },
    MatSetDefault { action: ActionData },
    MatClearDefault,
    AdtAdd { action: ActionData },
    AdtModify { hdl: EntryHdl, action: ActionData },
    AdtDelete { hdl: EntryHdl },
    SelGrpCreate { max_size: u32 },
    SelGrpDestroy { grp: EntryHdl },
    SelMbrAdd { grp: EntryHdl, mbr: EntryHdl },
    SelMbrDel { grp: EntryHdl, mbr: EntryHdl },
    SelMbrActivate { grp: EntryHdl, mbr: EntryHdl },
    SelMbrDeactivate { grp: EntryHdl, mbr: EntryHdl },
    SelFallbackSet { mbr: EntryHdl },
    SelFallbackClear,
}

/// The result of producing a request: the handle of any newly created
/// entry, and the moves describing the change.
#[derive(Debug, Default)]
pub struct Produced {
    pub handle: Option<EntryHdl>,
    pub moves: MoveList,
}

impl Produced {
    pub fn new(handle: Option<EntryHdl>, moves: MoveList) -> Self {
        Produced { handle, moves }
    }
}

/// An entry recovered by reading a table back from the hardware.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OldEntry {
    /// The temporary handle the entry was imported under
    pub hdl: EntryHdl,
    pub data: EntryData,
}

/// How a table converges with the hardware after a restart.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HaMode {
    /// Replayed requests are matched against recovered entries key by key
    SpecMap,
    /// Replayed requests rebuild the owner's state, and the owner computes
    /// its own delta against what it read back
    Rewrite,
}

/// Everything an owner needs to turn moves into hardware instructions.
pub struct ApplyCtx<'a> {
    pub asic: &'a dyn AsicOps,
    pub dev: DevId,
    pub ilog: &'a mut InstrLog,
    /// Set while applying the moves of an atomic transaction
    pub atomic: bool,
}

impl ApplyCtx<'_> {
    /// Encode an instruction and append it to the main section of the log.
    pub fn emit(&mut self, instr: Instr) -> PipeResult<()> {
        self.asic.instr_encode(self.dev, &instr)?;
        self.ilog.append(self.dev, Section::Main, instr);
        Ok(())
    }

    /// Encode an instruction that removes state.  Inside an atomic commit it
    /// waits in the cleanup section until packets using the old table
    /// version have drained.
    pub fn emit_removal(&mut self, instr: Instr) -> PipeResult<()> {
        self.asic.instr_encode(self.dev, &instr)?;
        let section = if self.atomic {
            Section::Cleanup
        } else {
            Section::Main
        };
        self.ilog.append(self.dev, section, instr);
        Ok(())
    }
}

/// The capability object for a single table.  The pipeline resolves it once
/// per request from the device's registry and drives every step of the
/// request through it.
pub trait TableOwner: Send {
    fn info(&self) -> &TableInfo;

    fn usage(&self) -> TableUsage;

    /// Update the provisional state for a client request and describe the
    /// change as a move list.
    fn produce(
        &mut self,
        pipe: PipeScope,
        req: TableRequest,
    ) -> PipeResult<Produced>;

    /// Translate a move list into hardware instructions.  The list is
    /// consumed, whether or not the hardware accepts it.
    fn apply(&mut self, ctx: &mut ApplyCtx, moves: MoveList) -> PipeResult<()>;

    /// Start journaling changes to one table instance.  Each instance is
    /// staged on its own, since different sessions may hold different pipes
    /// of an asymmetric table.  With `defer_removals` set, the clears of
    /// removed entries are pushed only after the rest of the change, so the
    /// slots they vacate are not reused before the stage ends.
    fn stage_begin(&mut self, pipe: PipeScope, defer_removals: bool);
    /// Keep every change made to the instance since `stage_begin`.
    fn stage_commit(&mut self, pipe: PipeScope);
    /// Discard every change made to the instance since `stage_begin`.
    fn stage_revert(&mut self, pipe: PipeScope);

    /// Place an entry under a caller-chosen handle.  No duplicate-key check
    /// is made.
    fn place_with_handle(
        &mut self,
        pipe: PipeScope,
        hdl: EntryHdl,
        data: EntryData,
    ) -> PipeResult<MoveList>;

    /// Replace the contents of an existing entry.
    fn modify(
        &mut self,
        pipe: PipeScope,
        hdl: EntryHdl,
        data: EntryData,
    ) -> PipeResult<MoveList>;

    fn delete(&mut self, pipe: PipeScope, hdl: EntryHdl)
        -> PipeResult<MoveList>;

    /// Rename an entry, without touching the hardware.
    fn update(
        &mut self,
        pipe: PipeScope,
        from: EntryHdl,
        to: EntryHdl,
    ) -> PipeResult<()>;

    /// Allocate the handle the next entry of a table instance will be
    /// created with.
    fn reserve_handle(&mut self, pipe: PipeScope) -> PipeResult<EntryHdl>;

    /// Discard the logical state and rebuild it from the hardware contents
    /// of one table instance.  Entries are imported under temporary handles.
    fn hardware_read_replay(
        &mut self,
        asic: &dyn AsicOps,
        dev: DevId,
        pipe: PipeScope,
    ) -> PipeResult<Vec<OldEntry>>;

    fn ha_mode(&self) -> HaMode {
        HaMode::SpecMap
    }

    /// For `HaMode::Rewrite` tables, the moves converging the hardware
    /// contents read back by `hardware_read_replay` with the replayed state.
    fn ha_delta(&mut self, pipe: PipeScope) -> PipeResult<MoveList> {
        Err(PipeError::NotSupported(format!(
            "table {} computes no delta of its own (pipe {pipe})",
            self.info().name
        )))
    }

    /// The current default action of a table instance, if it has one.
    fn default_get(&self, _pipe: PipeScope) -> Option<ActionData> {
        None
    }

    fn entry_get(&self, pipe: PipeScope, hdl: EntryHdl)
        -> PipeResult<EntryData>;

    /// The physical index of an entry, for tables referenced by others.
    fn index_of(&self, _pipe: PipeScope, _hdl: EntryHdl) -> Option<u32> {
        None
    }

    /// Returns true if any entry of the instance refers to the given entry
    /// of another table.
    fn references(
        &self,
        _tbl: TblHdl,
        _pipe: PipeScope,
        _hdl: EntryHdl,
    ) -> bool {
        false
    }
}

pub type TableRef = Arc<Mutex<Box<dyn TableOwner>>>;

/// Build the owners for every configured table of a device.
pub fn registry_build(
    log: &slog::Logger,
    tables: &[TableConfig],
    pipes: &[PipeId],
) -> PipeResult<BTreeMap<TblHdl, TableRef>> {
    let mut registry: BTreeMap<TblHdl, TableRef> = BTreeMap::new();

    // Selector tables link to their action-data tables, so those are
    // created first.
    let mut sorted: Vec<&TableConfig> = tables.iter().collect();
    sorted.sort_by_key(|t| match t.kind {
        TableKind::ActionData => 0,
        TableKind::Match => 1,
        TableKind::Selector => 2,
    });

    for t in sorted {
        let info = TableInfo::from(t);
        let log = log.new(o!("table" => info.name.clone()));
        let owner: Box<dyn TableOwner> = match info.kind {
            TableKind::Match => Box::new(mat::MatTable::new(log, info, pipes)),
            TableKind::ActionData => {
                Box::new(adt::AdtTable::new(log, info, pipes))
            }
            TableKind::Selector => {
                let adt_hdl = info.action_table.ok_or_else(|| {
                    PipeError::Invalid(format!(
                        "selector {} has no action table",
                        info.name
                    ))
                })?;
                let adt = registry
                    .get(&adt_hdl)
                    .cloned()
                    .ok_or(PipeError::NoSuchTable(adt_hdl))?;
                Box::new(sel::SelTable::new(log, info, pipes, adt))
            }
        };
        registry.insert(t.handle, Arc::new(Mutex::new(owner)));
    }
    Ok(registry)
}

/// Hands out the handles of one table instance: client handles count up
/// from 1, handles for entries recovered from the hardware count up from
/// `HA_TEMP_HDL_BASE`.
#[derive(Debug)]
pub struct HandleAlloc {
    next: journal::JournaledValue<EntryHdl>,
    next_temp: EntryHdl,
}

impl Default for HandleAlloc {
    fn default() -> Self {
        HandleAlloc {
            next: journal::JournaledValue::new(1),
            next_temp: HA_TEMP_HDL_BASE,
        }
    }
}

impl HandleAlloc {
    pub fn alloc(&mut self) -> EntryHdl {
        let hdl = *self.next.get();
        self.next.set(hdl + 1);
        hdl
    }

    /// Allocate a handle outside of any stage, so that it is never handed
    /// out again even if the surrounding stage is reverted.
    pub fn reserve(&mut self) -> EntryHdl {
        let hdl = *self.next.get();
        self.next.set_committed(hdl + 1);
        hdl
    }

    pub fn alloc_temp(&mut self) -> EntryHdl {
        let hdl = self.next_temp;
        self.next_temp += 1;
        hdl
    }

    pub fn begin(&mut self) {
        self.next.begin();
    }

    pub fn commit(&mut self) {
        self.next.commit();
    }

    pub fn revert(&mut self) {
        self.next.revert();
    }
}

/// Find the lowest slot below `size` that is neither occupied nor waiting for
/// a deferred clear.
pub fn lowest_free<V: Clone>(
    occupied: &journal::Journaled<u32, V>,
    quarantine: &BTreeSet<u32>,
    size: u32,
) -> Option<u32> {
    (0..size).find(|i| !occupied.contains_key(i) && !quarantine.contains(i))
}

/// Shared check for operations that name a pipe scope the table does not
/// have an instance for.
pub fn no_scope(info: &TableInfo, pipe: PipeScope) -> PipeError {
    PipeError::Invalid(format!("table {} has no instance in {pipe}", info.name))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_alloc() {
        let mut h = HandleAlloc::default();
        h.begin();
        assert_eq!(h.alloc(), 1);
        assert_eq!(h.alloc(), 2);
        h.revert();
        assert_eq!(h.alloc(), 1);

        h.begin();
        assert_eq!(h.reserve(), 2);
        h.revert();
        assert_eq!(h.alloc(), 3);

        assert_eq!(h.alloc_temp(), HA_TEMP_HDL_BASE);
        assert_eq!(h.alloc_temp(), HA_TEMP_HDL_BASE + 1);
    }

    #[test]
    fn test_scope_check() {
        let config = TableConfig {
            handle: 1,
            name: "t".into(),
            kind: TableKind::Match,
            size: 4,
            symmetric: false,
            ternary: false,
            default_action: None,
            reconcile_order: crate::config::default_reconcile_order(),
            action_table: None,
        };
        let info = TableInfo::from(&config);
        assert!(info.check_scope(PipeScope::Pipe(1)).is_ok());
        assert!(info.check_scope(PipeScope::All).is_err());
        assert_eq!(
            info.scopes(&[0, 1]),
            vec![PipeScope::Pipe(0), PipeScope::Pipe(1)]
        );
    }
}
