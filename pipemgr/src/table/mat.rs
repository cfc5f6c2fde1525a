// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Match-action tables with direct action data.
//!
//! Exact-match tables place each entry in the lowest free slot.  Ternary
//! tables keep their slots sorted by priority (a lower value wins), so adding
//! an entry may first shift a run of existing entries by one slot to open a
//! hole at the right position.  Each shift shows up in the move list as a
//! `MatMove`.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use slog::{debug, Logger};

use aal::{ActionData, AsicOps, HwRecord, Instr};
use common::{EntryHdl, PipeId, PipeScope};

use super::journal::{Journaled, JournaledValue};
use super::*;
use crate::move_list::{EntryData, MatEntry, MoveList, MoveOp};

#[derive(Clone, Debug)]
struct Placed {
    index: u32,
    entry: MatEntry,
}

#[derive(Debug)]
struct MatPipe {
    entries: Journaled<EntryHdl, Placed>,
    slots: Journaled<u32, EntryHdl>,
    keys: Journaled<Vec<u8>, EntryHdl>,
    default: JournaledValue<Option<ActionData>>,
    handles: HandleAlloc,
    // Slots vacated while a stage with deferred removals is open.  Their
    // clear is only pushed at the end of the atomic commit, so they cannot
    // be reused until then.
    quarantine: BTreeSet<u32>,
    defer_removals: bool,
}

impl MatPipe {
    fn new(default: Option<ActionData>) -> Self {
        MatPipe {
            entries: Journaled::new(),
            slots: Journaled::new(),
            keys: Journaled::new(),
            default: JournaledValue::new(default),
            handles: HandleAlloc::default(),
            quarantine: BTreeSet::new(),
            defer_removals: false,
        }
    }

    fn stage_begin(&mut self, defer_removals: bool) {
        self.handles.begin();
        self.entries.begin();
        self.slots.begin();
        self.keys.begin();
        self.default.begin();
        self.defer_removals |= defer_removals;
    }

    fn stage_end(&mut self, keep: bool) {
        if keep {
            self.handles.commit();
            self.entries.commit();
            self.slots.commit();
            self.keys.commit();
            self.default.commit();
        } else {
            self.handles.revert();
            self.entries.revert();
            self.slots.revert();
            self.keys.revert();
            self.default.revert();
        }
        self.quarantine.clear();
        self.defer_removals = false;
    }

    fn is_free(&self, index: u32) -> bool {
        !self.slots.contains_key(&index) && !self.quarantine.contains(&index)
    }

    fn priority_at(&self, index: u32) -> Option<u32> {
        self.slots
            .get(&index)
            .and_then(|hdl| self.entries.get(hdl))
            .map(|p| p.entry.priority)
    }

    fn relocate(&mut self, from: u32, to: u32) -> Option<(EntryHdl, MatEntry)> {
        let hdl = self.slots.remove(&from)?;
        self.slots.insert(to, hdl);
        let placed = self.entries.get_mut(&hdl)?;
        placed.index = to;
        Some((hdl, placed.entry.clone()))
    }
}

pub struct MatTable {
    log: Logger,
    info: TableInfo,
    pipes: BTreeMap<PipeScope, MatPipe>,
    usage: TableUsage,
}

impl MatTable {
    pub fn new(log: Logger, info: TableInfo, pipes: &[PipeId]) -> Self {
        let instances = info
            .scopes(pipes)
            .into_iter()
            .map(|s| (s, MatPipe::new(info.default_action.clone())))
            .collect();
        let usage = TableUsage::new(info.size);
        MatTable {
            log,
            info,
            pipes: instances,
            usage,
        }
    }

    fn instance(&mut self, pipe: PipeScope) -> PipeResult<&mut MatPipe> {
        let info = &self.info;
        self.pipes.get_mut(&pipe).ok_or_else(|| no_scope(info, pipe))
    }

    fn instance_ref(&self, pipe: PipeScope) -> PipeResult<&MatPipe> {
        self.pipes
            .get(&pipe)
            .ok_or_else(|| no_scope(&self.info, pipe))
    }

    fn missing(&self, hdl: EntryHdl) -> PipeError {
        PipeError::Missing(format!("{} entry {hdl}", self.info.name))
    }

    /// Pick a slot for a new entry.  Returns the slot and the shifts
    /// (from, to) that must happen first, in order.
    fn find_slot(
        &self,
        inst: &MatPipe,
        priority: u32,
    ) -> Option<(u32, Vec<(u32, u32)>)> {
        let size = self.info.size;
        if !self.info.ternary {
            return (0..size).find(|i| inst.is_free(*i)).map(|i| (i, vec![]));
        }

        // Occupied slots are sorted by priority, so everything below `lo`
        // sorts at or before the new entry and everything at or above `hi`
        // sorts after it.  Nothing between them is occupied.
        let lo = inst
            .slots
            .keys()
            .copied()
            .filter(|i| inst.priority_at(*i).is_some_and(|p| p <= priority))
            .max()
            .map_or(0, |i| i + 1);
        let hi = inst
            .slots
            .keys()
            .copied()
            .filter(|i| inst.priority_at(*i).is_some_and(|p| p > priority))
            .min()
            .unwrap_or(size);

        if let Some(i) = (lo..hi).find(|i| inst.is_free(*i)) {
            return Some((i, vec![]));
        }

        // Shift the run starting at `hi` down by one slot
        if let Some(f) = (hi..size).find(|i| !inst.slots.contains_key(i)) {
            if !inst.quarantine.contains(&f) {
                let shifts = (hi..f).rev().map(|i| (i, i + 1)).collect();
                return Some((hi, shifts));
            }
        }

        // Shift the run ending just below `lo` up by one slot
        if let Some(f) = (0..lo).rev().find(|i| !inst.slots.contains_key(i)) {
            if !inst.quarantine.contains(&f) {
                let shifts = (f + 1..lo).map(|i| (i, i - 1)).collect();
                return Some((lo - 1, shifts));
            }
        }
        None
    }

    fn place(
        &mut self,
        pipe: PipeScope,
        hdl: EntryHdl,
        entry: MatEntry,
    ) -> PipeResult<MoveList> {
        let found = {
            let inst = self.instance_ref(pipe)?;
            if inst.entries.contains_key(&hdl) {
                return Err(PipeError::Exists(format!(
                    "{} entry {hdl}",
                    self.info.name
                )));
            }
            self.find_slot(inst, entry.priority)
        };
        let Some((index, shifts)) = found else {
            self.usage.exhaustion += 1;
            return Err(PipeError::TableFull(self.info.name.clone()));
        };

        let mut moves = MoveList::new();
        let inst = self.instance(pipe)?;
        for (from, to) in shifts {
            let (moved, moved_entry) = inst
                .relocate(from, to)
                .ok_or_else(|| PipeError::Other(format!("slot {from} empty")))?;
            moves.allocate(
                MoveOp::MatMove {
                    hdl: moved,
                    from,
                    to,
                },
                pipe,
                Some(EntryData::Mat(moved_entry)),
            )?;
        }

        inst.slots.insert(index, hdl);
        inst.keys.insert(entry.spec_key(), hdl);
        inst.entries.insert(
            hdl,
            Placed {
                index,
                entry: entry.clone(),
            },
        );
        moves.allocate(
            MoveOp::MatAdd { hdl, index },
            pipe,
            Some(EntryData::Mat(entry)),
        )?;
        self.usage.inserts += 1;
        Ok(moves)
    }

    fn set_default(
        &mut self,
        pipe: PipeScope,
        action: Option<ActionData>,
    ) -> PipeResult<MoveList> {
        let mut moves = MoveList::new();
        let static_default = self.info.default_action.clone();
        let inst = self.instance(pipe)?;
        match action {
            Some(a) => {
                inst.default.set(Some(a.clone()));
                moves.allocate(
                    MoveOp::MatSetDefault,
                    pipe,
                    Some(EntryData::Default(a)),
                )?;
            }
            None => {
                inst.default.set(static_default);
                moves.allocate(MoveOp::MatClearDefault, pipe, None)?;
            }
        }
        Ok(moves)
    }
}

impl TableOwner for MatTable {
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
            TableRequest::MatAdd { entry } => {
                let key = entry.spec_key();
                if self.instance_ref(pipe)?.keys.contains_key(&key) {
                    self.usage.collisions += 1;
                    return Err(PipeError::Exists(format!(
                        "{} key {:?}",
                        self.info.name, entry.key
                    )));
                }
                let hdl = self.instance(pipe)?.handles.alloc();
                let moves = self.place(pipe, hdl, entry)?;
                Ok(Produced::new(Some(hdl), moves))
            }
            TableRequest::MatModify { hdl, spec } => {
                let current = self
                    .instance_ref(pipe)?
                    .entries
                    .get(&hdl)
                    .map(|p| p.entry.clone());
                let Some(current) = current else {
                    self.usage.update_misses += 1;
                    return Err(self.missing(hdl));
                };
                let entry = MatEntry { spec, ..current };
                let moves = self.modify(pipe, hdl, EntryData::Mat(entry))?;
                Ok(Produced::new(None, moves))
            }
            TableRequest::MatDelete { hdl } => {
                let moves = self.delete(pipe, hdl)?;
                Ok(Produced::new(None, moves))
            }
            TableRequest::MatSetDefault { action } => {
                let moves = self.set_default(pipe, Some(action))?;
                Ok(Produced::new(None, moves))
            }
            TableRequest::MatClearDefault => {
                let moves = self.set_default(pipe, None)?;
                Ok(Produced::new(None, moves))
            }
            req => Err(PipeError::Invalid(format!(
                "{req:?} is not a match-table request"
            ))),
        }
    }

    fn apply(&mut self, ctx: &mut ApplyCtx, moves: MoveList) -> PipeResult<()> {
        let tbl = self.info.handle;
        for m in moves {
            let pipe = m.pipe;
            match m.op {
                MoveOp::MatAdd { index, .. } => {
                    let entry = m.data()?.as_mat().ok_or("bad payload")?;
                    ctx.emit(Instr::MatWrite {
                        tbl,
                        pipe,
                        index,
                        entry: entry.to_hw(),
                    })?;
                }
                MoveOp::MatMove { from, to, .. } => {
                    let entry = m.data()?.as_mat().ok_or("bad payload")?;
                    ctx.emit(Instr::MatWrite {
                        tbl,
                        pipe,
                        index: to,
                        entry: entry.to_hw(),
                    })?;
                    ctx.emit(Instr::MatClear {
                        tbl,
                        pipe,
                        index: from,
                    })?;
                }
                MoveOp::MatModify { index, .. } => {
                    let entry = m.data()?.as_mat().ok_or("bad payload")?;
                    ctx.emit(Instr::MatUpdate {
                        tbl,
                        pipe,
                        index,
                        action: entry.spec.action.clone(),
                        ttl: entry.spec.ttl,
                        resources: entry.spec.resources.clone(),
                    })?;
                }
                MoveOp::MatDelete { index, .. } => {
                    ctx.emit_removal(Instr::MatClear { tbl, pipe, index })?;
                }
                MoveOp::MatSetDefault => {
                    let action = match m.data()? {
                        EntryData::Default(a) => a.clone(),
                        _ => return Err("bad payload".into()),
                    };
                    ctx.emit(Instr::MatDefault {
                        tbl,
                        pipe,
                        action: Some(action),
                    })?;
                }
                MoveOp::MatClearDefault => {
                    ctx.emit(Instr::MatDefault {
                        tbl,
                        pipe,
                        action: self.info.default_action.clone(),
                    })?;
                }
                op => {
                    return Err(PipeError::Invalid(format!(
                        "{op:?} applied to match table {}",
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
            EntryData::Mat(entry) => self.place(pipe, hdl, entry),
            _ => Err(PipeError::Invalid("expected a match entry".into())),
        }
    }

    fn modify(
        &mut self,
        pipe: PipeScope,
        hdl: EntryHdl,
        data: EntryData,
    ) -> PipeResult<MoveList> {
        let EntryData::Mat(entry) = data else {
            return Err(PipeError::Invalid("expected a match entry".into()));
        };
        let missing = self.missing(hdl);
        let info = &self.info;
        let inst = self
            .pipes
            .get_mut(&pipe)
            .ok_or_else(|| no_scope(info, pipe))?;
        let Some(placed) = inst.entries.get_mut(&hdl) else {
            self.usage.update_misses += 1;
            return Err(missing);
        };
        if placed.entry.spec_key() != entry.spec_key() {
            return Err(PipeError::Invalid(format!(
                "modify of entry {hdl} would change its key"
            )));
        }
        placed.entry = entry.clone();
        let index = placed.index;

        let mut moves = MoveList::new();
        moves.allocate(
            MoveOp::MatModify { hdl, index },
            pipe,
            Some(EntryData::Mat(entry)),
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
        let Some(placed) = inst.entries.remove(&hdl) else {
            self.usage.delete_misses += 1;
            return Err(missing);
        };
        inst.slots.remove(&placed.index);
        inst.keys.remove(&placed.entry.spec_key());
        if inst.defer_removals {
            inst.quarantine.insert(placed.index);
        }

        let mut moves = MoveList::new();
        moves.allocate(
            MoveOp::MatDelete {
                hdl,
                index: placed.index,
            },
            pipe,
            None,
        )?;
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
        let name = self.info.name.clone();
        let inst = self.instance(pipe)?;
        if inst.entries.contains_key(&to) {
            return Err(PipeError::Exists(format!("{name} entry {to}")));
        }
        let placed = inst.entries.remove(&from).ok_or(missing)?;
        inst.slots.insert(placed.index, to);
        inst.keys.insert(placed.entry.spec_key(), to);
        inst.entries.insert(to, placed);
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
        let mut inst = MatPipe::new(None);
        let mut old = Vec::new();
        for record in records {
            match record {
                HwRecord::Mat { index, entry } => {
                    let hdl = inst.handles.alloc_temp();
                    let entry = MatEntry::from_hw(entry);
                    inst.slots.insert(index, hdl);
                    inst.keys.insert(entry.spec_key(), hdl);
                    inst.entries.insert(
                        hdl,
                        Placed {
                            index,
                            entry: entry.clone(),
                        },
                    );
                    old.push(OldEntry {
                        hdl,
                        data: EntryData::Mat(entry),
                    });
                }
                HwRecord::MatDefault { action } => {
                    inst.default.set(Some(action));
                }
                r => {
                    return Err(PipeError::Other(format!(
                        "unexpected record in match table {}: {r:?}",
                        self.info.name
                    )))
                }
            }
        }
        debug!(self.log, "imported entries from hardware";
            "pipe" => %pipe, "entries" => old.len());
        self.pipes.insert(pipe, inst);
        Ok(old)
    }

    fn default_get(&self, pipe: PipeScope) -> Option<ActionData> {
        self.pipes.get(&pipe).and_then(|p| p.default.get().clone())
    }

    fn entry_get(
        &self,
        pipe: PipeScope,
        hdl: EntryHdl,
    ) -> PipeResult<EntryData> {
        self.instance_ref(pipe)?
            .entries
            .get(&hdl)
            .map(|p| EntryData::Mat(p.entry.clone()))
            .ok_or_else(|| self.missing(hdl))
    }

    fn index_of(&self, pipe: PipeScope, hdl: EntryHdl) -> Option<u32> {
        self.pipes.get(&pipe)?.entries.get(&hdl).map(|p| p.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_reconcile_order;
    use crate::move_list::{EntrySpec, MoveKind};
    use crate::table::test_util::test_logger;
    use aal::MatchData;
    use common::table::TableKind;
    use common::PipeStatus;

    fn table(size: u32, ternary: bool) -> MatTable {
        let info = TableInfo {
            handle: 1,
            name: "route".into(),
            kind: TableKind::Match,
            size,
            symmetric: true,
            ternary,
            default_action: Some(ActionData::new("drop")),
            reconcile_order: default_reconcile_order(),
            action_table: None,
        };
        MatTable::new(test_logger(), info, &[0, 1])
    }

    fn entry(dst: u32, priority: u32) -> MatEntry {
        MatEntry {
            key: MatchData::exact([("dst", dst)]),
            priority,
            spec: EntrySpec::new(ActionData::new("forward").arg("port", 1u16)),
        }
    }

    fn add(t: &mut MatTable, dst: u32, priority: u32) -> PipeResult<Produced> {
        t.produce(
            PipeScope::All,
            TableRequest::MatAdd {
                entry: entry(dst, priority),
            },
        )
    }

    #[test]
    fn test_add_duplicate_and_full() {
        let mut t = table(2, false);
        let p = add(&mut t, 1, 0).unwrap();
        assert_eq!(p.handle, Some(1));
        assert_eq!(t.index_of(PipeScope::All, 1), Some(0));

        let err = add(&mut t, 1, 0).unwrap_err();
        assert_eq!(err.status(), PipeStatus::AlreadyExists);

        add(&mut t, 2, 0).unwrap();
        let err = add(&mut t, 3, 0).unwrap_err();
        assert_eq!(err.status(), PipeStatus::NoSpace);

        let usage = t.usage();
        assert_eq!(usage.occupancy, 2);
        assert_eq!(usage.collisions, 1);
        assert_eq!(usage.exhaustion, 1);
    }

    #[test]
    fn test_symmetric_scope_only() {
        let mut t = table(2, false);
        assert!(t
            .produce(
                PipeScope::Pipe(0),
                TableRequest::MatAdd { entry: entry(1, 0) }
            )
            .is_err());
    }

    #[test]
    fn test_ternary_shift() {
        let mut t = table(4, true);
        add(&mut t, 1, 10).unwrap(); // slot 0
        add(&mut t, 2, 20).unwrap(); // slot 1

        // Priority 5 belongs in front of both
        let p = add(&mut t, 3, 5).unwrap();
        let kinds: Vec<MoveKind> = p.moves.iter().map(|m| m.op.kind()).collect();
        assert_eq!(
            kinds,
            vec![MoveKind::MatMove, MoveKind::MatMove, MoveKind::MatAdd]
        );
        assert_eq!(
            p.moves.iter().next().unwrap().op,
            MoveOp::MatMove {
                hdl: 2,
                from: 1,
                to: 2
            }
        );
        assert_eq!(t.index_of(PipeScope::All, 3), Some(0));
        assert_eq!(t.index_of(PipeScope::All, 1), Some(1));
        assert_eq!(t.index_of(PipeScope::All, 2), Some(2));
    }

    #[test]
    fn test_revert_undoes_add_and_delete() {
        let mut t = table(4, false);
        t.stage_begin(PipeScope::All, true);
        add(&mut t, 1, 0).unwrap();
        t.stage_commit(PipeScope::All);

        t.stage_begin(PipeScope::All, true);
        t.delete(PipeScope::All, 1).unwrap();
        add(&mut t, 2, 0).unwrap();
        // The deleted entry's clear is deferred, so its slot is not reused
        assert_eq!(t.index_of(PipeScope::All, 2), Some(1));
        t.stage_revert(PipeScope::All);

        assert!(t.entry_get(PipeScope::All, 1).is_ok());
        assert!(t.entry_get(PipeScope::All, 2).is_err());
        // Handle 2 is handed out again
        assert_eq!(add(&mut t, 2, 0).unwrap().handle, Some(2));
    }

    #[test]
    fn test_slot_reused_when_removal_in_order() {
        let mut t = table(2, false);
        add(&mut t, 1, 0).unwrap();
        add(&mut t, 2, 0).unwrap();

        t.stage_begin(PipeScope::All, false);
        t.delete(PipeScope::All, 1).unwrap();
        let p = add(&mut t, 3, 0).unwrap();
        t.stage_commit(PipeScope::All);
        assert_eq!(t.index_of(PipeScope::All, p.handle.unwrap()), Some(0));
    }

    #[test]
    fn test_pipes_staged_independently() {
        let mut info = table(4, false).info.clone();
        info.symmetric = false;
        let mut t = MatTable::new(test_logger(), info, &[0, 1]);
        let (p0, p1) = (PipeScope::Pipe(0), PipeScope::Pipe(1));
        let add_to = |t: &mut MatTable, pipe, dst| {
            t.produce(pipe, TableRequest::MatAdd { entry: entry(dst, 0) })
        };

        t.stage_begin(p0, false);
        add_to(&mut t, p0, 1).unwrap();
        t.stage_begin(p1, false);
        add_to(&mut t, p1, 1).unwrap();
        t.stage_commit(p1);
        t.stage_revert(p0);

        assert!(t.entry_get(p0, 1).is_err());
        assert!(t.entry_get(p1, 1).is_ok());
        // Each pipe hands out its own handles
        assert_eq!(add_to(&mut t, p0, 2).unwrap().handle, Some(1));
        assert_eq!(add_to(&mut t, p1, 2).unwrap().handle, Some(2));
    }

    #[test]
    fn test_update_renames() {
        let mut t = table(4, false);
        add(&mut t, 1, 0).unwrap();
        t.update(PipeScope::All, 1, 77).unwrap();
        assert!(t.entry_get(PipeScope::All, 1).is_err());
        assert_eq!(t.index_of(PipeScope::All, 77), Some(0));

        // The key now belongs to the new handle
        let err = add(&mut t, 1, 0).unwrap_err();
        assert_eq!(err.status(), PipeStatus::AlreadyExists);
        t.delete(PipeScope::All, 77).unwrap();
        assert!(add(&mut t, 1, 0).is_ok());
    }

    #[test]
    fn test_modify_keeps_key() {
        let mut t = table(4, false);
        add(&mut t, 1, 0).unwrap();
        let mut changed = entry(2, 0);
        assert!(t
            .modify(PipeScope::All, 1, EntryData::Mat(changed.clone()))
            .is_err());

        changed.key = MatchData::exact([("dst", 1u32)]);
        changed.spec.ttl = 500;
        let moves = t
            .modify(PipeScope::All, 1, EntryData::Mat(changed.clone()))
            .unwrap();
        assert_eq!(moves.len(), 1);
        assert_eq!(
            t.entry_get(PipeScope::All, 1).unwrap(),
            EntryData::Mat(changed)
        );
    }
}
