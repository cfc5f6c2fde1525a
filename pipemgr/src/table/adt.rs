// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Action-data tables hold action entries that are shared by reference,
//! typically as the members of a selector's groups.  Unlike match keys, two
//! entries may carry identical data.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use slog::{debug, Logger};

use aal::{ActionData, AsicOps, HwRecord, Instr};
use common::{EntryHdl, PipeId, PipeScope};

use super::journal::Journaled;
use super::*;
use crate::move_list::{EntryData, MoveList, MoveOp};

#[derive(Debug, Default)]
struct AdtPipe {
    entries: Journaled<EntryHdl, (u32, ActionData)>,
    slots: Journaled<u32, EntryHdl>,
    handles: HandleAlloc,
    quarantine: BTreeSet<u32>,
    defer_removals: bool,
}

impl AdtPipe {
    fn stage_begin(&mut self, defer_removals: bool) {
        self.handles.begin();
        self.entries.begin();
        self.slots.begin();
        self.defer_removals |= defer_removals;
    }

    fn stage_end(&mut self, keep: bool) {
        if keep {
            self.handles.commit();
            self.entries.commit();
            self.slots.commit();
        } else {
            self.handles.revert();
            self.entries.revert();
            self.slots.revert();
        }
        self.quarantine.clear();
        self.defer_removals = false;
    }
}

pub struct AdtTable {
    log: Logger,
    info: TableInfo,
    pipes: BTreeMap<PipeScope, AdtPipe>,
    usage: TableUsage,
}

impl AdtTable {
    pub fn new(log: Logger, info: TableInfo, pipes: &[PipeId]) -> Self {
        let instances = info
            .scopes(pipes)
            .into_iter()
            .map(|s| (s, AdtPipe::default()))
            .collect();
        let usage = TableUsage::new(info.size);
        AdtTable {
            log,
            info,
            pipes: instances,
            usage,
        }
    }

    fn instance(&mut self, pipe: PipeScope) -> PipeResult<&mut AdtPipe> {
        let info = &self.info;
        self.pipes.get_mut(&pipe).ok_or_else(|| no_scope(info, pipe))
    }

    fn missing(&self, hdl: EntryHdl) -> PipeError {
        PipeError::Missing(format!("{} entry {hdl}", self.info.name))
    }

    fn place(
        &mut self,
        pipe: PipeScope,
        hdl: EntryHdl,
        action: ActionData,
    ) -> PipeResult<MoveList> {
        let info = &self.info;
        let inst = self
            .pipes
            .get_mut(&pipe)
            .ok_or_else(|| no_scope(info, pipe))?;
        if inst.entries.contains_key(&hdl) {
            return Err(PipeError::Exists(format!("{} entry {hdl}", info.name)));
        }
        let Some(index) = lowest_free(&inst.slots, &inst.quarantine, info.size)
        else {
            self.usage.exhaustion += 1;
            return Err(PipeError::TableFull(info.name.clone()));
        };
        inst.slots.insert(index, hdl);
        inst.entries.insert(hdl, (index, action.clone()));

        let mut moves = MoveList::new();
        moves.allocate(
            MoveOp::AdtAdd { hdl, index },
            pipe,
            Some(EntryData::Adt(action)),
        )?;
        self.usage.inserts += 1;
        Ok(moves)
    }
}

impl TableOwner for AdtTable {
    fn info(&self) -> &TableInfo {
        &self.info
    }

    fn usage(&self) -> TableUsage {
        let mut usage = self.usage.clone();
        usage.occupancy =
            self.pipes.values().map(|p| p.entries.len() as u32).sum();
        usage
    }

    fn produce(
        &mut self,
        pipe: PipeScope,
        req: TableRequest,
    ) -> PipeResult<Produced> {
        match req {
            TableRequest::AdtAdd { action } => {
                let hdl = self.instance(pipe)?.handles.alloc();
                let moves = self.place(pipe, hdl, action)?;
                Ok(Produced::new(Some(hdl), moves))
            }
            TableRequest::AdtModify { hdl, action } => {
                let moves = self.modify(pipe, hdl, EntryData::Adt(action))?;
                Ok(Produced::new(None, moves))
            }
            TableRequest::AdtDelete { hdl } => {
                let moves = self.delete(pipe, hdl)?;
                Ok(Produced::new(None, moves))
            }
            req => Err(PipeError::Invalid(format!(
                "{req:?} is not an action-data request"
            ))),
        }
    }

    fn apply(&mut self, ctx: &mut ApplyCtx, moves: MoveList) -> PipeResult<()> {
        let tbl = self.info.handle;
        for m in moves {
            let pipe = m.pipe;
            match m.op {
                MoveOp::AdtAdd { index, .. } | MoveOp::AdtModify { index, .. } => {
                    let action =
                        m.data()?.as_adt().ok_or("bad payload")?.clone();
                    ctx.emit(Instr::AdtWrite {
                        tbl,
                        pipe,
                        index,
                        action,
                    })?;
                }
                MoveOp::AdtDelete { index, .. } => {
                    ctx.emit_removal(Instr::AdtClear { tbl, pipe, index })?;
                }
                op => {
                    return Err(PipeError::Invalid(format!(
                        "{op:?} applied to action table {}",
                        self.info.name
                    )))
                }
            }
        }
        Ok(())
    }

    fn stage_begin(&mut self, pipe: PipeScope, defer_removals: bool) {
        if let Some(inst) = self.pipes.get_mut(&pipe) {
            inst.stage_begin(defer_removals);
        }
    }

    fn stage_commit(&mut self, pipe: PipeScope) {
        if let Some(inst) = self.pipes.get_mut(&pipe) {
            inst.stage_end(true);
        }
    }

    fn stage_revert(&mut self, pipe: PipeScope) {
        if let Some(inst) = self.pipes.get_mut(&pipe) {
            inst.stage_end(false);
        }
    }

    fn place_with_handle(
        &mut self,
        pipe: PipeScope,
        hdl: EntryHdl,
        data: EntryData,
    ) -> PipeResult<MoveList> {
        match data {
            EntryData::Adt(action) => self.place(pipe, hdl, action),
            _ => Err(PipeError::Invalid("expected action data".into())),
        }
    }

    fn modify(
        &mut self,
        pipe: PipeScope,
        hdl: EntryHdl,
        data: EntryData,
    ) -> PipeResult<MoveList> {
        let EntryData::Adt(action) = data else {
            return Err(PipeError::Invalid("expected action data".into()));
        };
        let missing = self.missing(hdl);
        let info = &self.info;
        let inst = self
            .pipes
            .get_mut(&pipe)
            .ok_or_else(|| no_scope(info, pipe))?;
        let Some(entry) = inst.entries.get_mut(&hdl) else {
            self.usage.update_misses += 1;
            return Err(missing);
        };
        entry.1 = action.clone();
        let index = entry.0;

        let mut moves = MoveList::new();
        moves.allocate(
            MoveOp::AdtModify { hdl, index },
            pipe,
            Some(EntryData::Adt(action)),
        )?;
        self.usage.updates += 1;
        Ok(moves)
    }

    fn delete(
        &mut self,
        pipe: PipeScope,
        hdl: EntryHdl,
    ) -> PipeResult<MoveList> {
        let missing = self.missing(hdl);
        let info = &self.info;
        let inst = self
            .pipes
            .get_mut(&pipe)
            .ok_or_else(|| no_scope(info, pipe))?;
        let Some((index, _)) = inst.entries.remove(&hdl) else {
            self.usage.delete_misses += 1;
            return Err(missing);
        };
        inst.slots.remove(&index);
        if inst.defer_removals {
            inst.quarantine.insert(index);
        }

        let mut moves = MoveList::new();
        moves.allocate(MoveOp::AdtDelete { hdl, index }, pipe, None)?;
        self.usage.deletes += 1;
        Ok(moves)
    }

    fn update(
        &mut self,
        pipe: PipeScope,
        from: EntryHdl,
        to: EntryHdl,
    ) -> PipeResult<()> {
        let missing = self.missing(from);
        let info = &self.info;
        let inst = self
            .pipes
            .get_mut(&pipe)
            .ok_or_else(|| no_scope(info, pipe))?;
        if inst.entries.contains_key(&to) {
            return Err(PipeError::Exists(format!("{} entry {to}", info.name)));
        }
        let entry = inst.entries.remove(&from).ok_or(missing)?;
        inst.slots.insert(entry.0, to);
        inst.entries.insert(to, entry);
        Ok(())
    }

    fn reserve_handle(&mut self, pipe: PipeScope) -> PipeResult<EntryHdl> {
        Ok(self.instance(pipe)?.handles.reserve())
    }

    fn hardware_read_replay(
        &mut self,
        asic: &dyn AsicOps,
        dev: DevId,
        pipe: PipeScope,
    ) -> PipeResult<Vec<OldEntry>> {
        let records = asic.table_read(dev, self.info.handle, pipe)?;
        // The instance starts over with a fresh handle allocator, so replayed
        // requests are handed the same handles as before the restart
        let mut inst = AdtPipe::default();
        let mut old = Vec::new();
        for record in records {
            let HwRecord::Adt { index, action } = record else {
                return Err(PipeError::Other(format!(
                    "unexpected record in action table {}: {record:?}",
                    self.info.name
                )));
            };
            let hdl = inst.handles.alloc_temp();
            inst.slots.insert(index, hdl);
            inst.entries.insert(hdl, (index, action.clone()));
            old.push(OldEntry {
                hdl,
                data: EntryData::Adt(action),
            });
        }
        debug!(self.log, "imported entries from hardware";
            "pipe" => %pipe, "entries" => old.len());
        self.pipes.insert(pipe, inst);
        Ok(old)
    }

    fn entry_get(
        &self,
        pipe: PipeScope,
        hdl: EntryHdl,
    ) -> PipeResult<EntryData> {
        self.pipes
            .get(&pipe)
            .ok_or_else(|| no_scope(&self.info, pipe))?
            .entries
            .get(&hdl)
            .map(|(_, a)| EntryData::Adt(a.clone()))
            .ok_or_else(|| self.missing(hdl))
    }

    fn index_of(&self, pipe: PipeScope, hdl: EntryHdl) -> Option<u32> {
        self.pipes.get(&pipe)?.entries.get(&hdl).map(|(i, _)| *i)
    }
}
