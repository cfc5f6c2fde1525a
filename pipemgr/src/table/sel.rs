// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Selector tables.
//!
//! A selector group is a set of members, each a reference to an entry in the
//! selector's action-data table, that the pipeline picks among by hashing a
//! packet's fields.  The hardware stores a group as a single member word, so
//! every member change is applied by rewriting the group's whole word.
//!
//! Member identity after a restart can only be recovered through the
//! action-data table, so selectors do not take part in key-by-key matching.
//! Replayed requests rebuild the selector's state from scratch, and the
//! selector then works out for itself how that state differs from what it
//! read back from the hardware.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use slog::{debug, Logger};

use aal::{AsicOps, HwRecord, HwSelMember, Instr};
use common::table::TblHdl;
use common::{EntryHdl, PipeId, PipeScope, HA_TEMP_HDL_BASE};

use super::journal::{Journaled, JournaledValue};
use super::*;
use crate::move_list::{EntryData, MoveList, MoveOp, SelGroupData, SelMember};

/// The contents of one selector instance as read back from the hardware.
#[derive(Debug, Default)]
struct HwSnapshot {
    groups: BTreeMap<u32, (u32, Vec<HwSelMember>)>,
    fallback: Option<u32>,
}

#[derive(Debug, Default)]
struct SelPipe {
    groups: Journaled<EntryHdl, (u32, SelGroupData)>,
    slots: Journaled<u32, EntryHdl>,
    fallback: JournaledValue<Option<EntryHdl>>,
    handles: HandleAlloc,
    quarantine: BTreeSet<u32>,
    defer_removals: bool,
    hw: Option<HwSnapshot>,
}

impl SelPipe {
    fn stage_begin(&mut self, defer_removals: bool) {
        self.handles.begin();
        self.groups.begin();
        self.slots.begin();
        self.fallback.begin();
        self.defer_removals |= defer_removals;
    }

    fn stage_end(&mut self, keep: bool) {
        if keep {
            self.handles.commit();
            self.groups.commit();
            self.slots.commit();
            self.fallback.commit();
        } else {
            self.handles.revert();
            self.groups.revert();
            self.slots.revert();
            self.fallback.revert();
        }
        self.quarantine.clear();
        self.defer_removals = false;
    }
}

pub struct SelTable {
    log: Logger,
    info: TableInfo,
    adt: TableRef,
    pipes: BTreeMap<PipeScope, SelPipe>,
    usage: TableUsage,
}

/// Append the moves taking a group from `old` members to the members of
/// `new`.  Every move carries the group's final state.
fn diff_members(
    moves: &mut MoveList,
    pipe: PipeScope,
    grp: EntryHdl,
    index: u32,
    old: &[SelMember],
    new: &SelGroupData,
) -> PipeResult<()> {
    let data = || Some(EntryData::SelGroup(new.clone()));
    for m in old {
        if !new.members.iter().any(|n| n.hdl == m.hdl) {
            let op = MoveOp::SelMbrDel {
                grp,
                index,
                mbr: m.hdl,
            };
            moves.allocate(op, pipe, data())?;
        }
    }
    for n in &new.members {
        let op = match old.iter().find(|m| m.hdl == n.hdl) {
            None => MoveOp::SelMbrAdd {
                grp,
                index,
                mbr: n.hdl,
            },
            Some(m) if m.active == n.active => continue,
            Some(_) if n.active => MoveOp::SelMbrActivate {
                grp,
                index,
                mbr: n.hdl,
            },
            Some(_) => MoveOp::SelMbrDeactivate {
                grp,
                index,
                mbr: n.hdl,
            },
        };
        moves.allocate(op, pipe, data())?;
    }
    Ok(())
}

impl SelTable {
    pub fn new(
        log: Logger,
        info: TableInfo,
        pipes: &[PipeId],
        adt: TableRef,
    ) -> Self {
        let instances = info
            .scopes(pipes)
            .into_iter()
            .map(|s| (s, SelPipe::default()))
            .collect();
        let usage = TableUsage::new(info.size);
        SelTable {
            log,
            info,
            adt,
            pipes: instances,
            usage,
        }
    }

    fn adt_handle(&self) -> TblHdl {
        self.info.action_table.unwrap_or_default()
    }

    fn missing(&self, grp: EntryHdl) -> PipeError {
        PipeError::Missing(format!("{} group {grp}", self.info.name))
    }

    fn instance(&mut self, pipe: PipeScope) -> PipeResult<&mut SelPipe> {
        let info = &self.info;
        self.pipes.get_mut(&pipe).ok_or_else(|| no_scope(info, pipe))
    }

    fn group(
        &self,
        pipe: PipeScope,
        grp: EntryHdl,
    ) -> PipeResult<(u32, SelGroupData)> {
        self.pipes
            .get(&pipe)
            .ok_or_else(|| no_scope(&self.info, pipe))?
            .groups
            .get(&grp)
            .cloned()
            .ok_or_else(|| self.missing(grp))
    }

    fn place(
        &mut self,
        pipe: PipeScope,
        grp: EntryHdl,
        data: SelGroupData,
    ) -> PipeResult<MoveList> {
        if data.max_size == 0 || data.members.len() > data.max_size as usize {
            return Err(PipeError::Invalid(format!(
                "group of {} members cannot hold {}",
                data.max_size,
                data.members.len()
            )));
        }
        let info = &self.info;
        let inst = self
            .pipes
            .get_mut(&pipe)
            .ok_or_else(|| no_scope(info, pipe))?;
        if inst.groups.contains_key(&grp) {
            return Err(PipeError::Exists(format!("{} group {grp}", info.name)));
        }
        let Some(index) = lowest_free(&inst.slots, &inst.quarantine, info.size)
        else {
            self.usage.exhaustion += 1;
            return Err(PipeError::TableFull(info.name.clone()));
        };
        inst.slots.insert(index, grp);
        inst.groups.insert(grp, (index, data.clone()));

        let mut moves = MoveList::new();
        moves.allocate(
            MoveOp::SelGrpCreate { grp, index },
            pipe,
            Some(EntryData::SelGroup(data)),
        )?;
        self.usage.inserts += 1;
        Ok(moves)
    }

    /// Replace the state of a group and describe the change.  `change` sees
    /// the current state and returns the new one.
    fn change_group<F>(
        &mut self,
        pipe: PipeScope,
        grp: EntryHdl,
        change: F,
    ) -> PipeResult<MoveList>
    where
        F: FnOnce(&SelGroupData) -> PipeResult<SelGroupData>,
    {
        let (index, old) = match self.group(pipe, grp) {
            Ok(g) => g,
            Err(e) => {
                self.usage.update_misses += 1;
                return Err(e);
            }
        };
        let new = change(&old)?;
        let mut moves = MoveList::new();
        diff_members(&mut moves, pipe, grp, index, &old.members, &new)?;
        if let Some(g) = self.instance(pipe)?.groups.get_mut(&grp) {
            g.1 = new;
        }
        self.usage.updates += 1;
        Ok(moves)
    }

    fn set_fallback(
        &mut self,
        pipe: PipeScope,
        mbr: Option<EntryHdl>,
    ) -> PipeResult<MoveList> {
        self.instance(pipe)?.fallback.set(mbr);
        let mut moves = MoveList::new();
        match mbr {
            Some(mbr) => moves.allocate(
                MoveOp::SelFallbackSet { mbr },
                pipe,
                Some(EntryData::Fallback(mbr)),
            )?,
            None => moves.allocate(MoveOp::SelFallbackClear, pipe, None)?,
        }
        Ok(moves)
    }

    /// Translate a group's members into their hardware form.
    fn resolve(
        &self,
        pipe: PipeScope,
        members: &[SelMember],
    ) -> PipeResult<Vec<HwSelMember>> {
        let adt = self.adt.lock().unwrap();
        members
            .iter()
            .map(|m| {
                adt.index_of(pipe, m.hdl)
                    .map(|adt_index| HwSelMember {
                        adt_index,
                        active: m.active,
                    })
                    .ok_or_else(|| {
                        PipeError::Missing(format!(
                            "{} member {} has no action entry",
                            self.info.name, m.hdl
                        ))
                    })
            })
            .collect()
    }

    fn resolve_one(&self, pipe: PipeScope, hdl: EntryHdl) -> PipeResult<u32> {
        self.adt
            .lock()
            .unwrap()
            .index_of(pipe, hdl)
            .ok_or_else(|| {
                PipeError::Missing(format!("action entry {hdl}"))
            })
    }

    fn write_group(
        &self,
        ctx: &mut ApplyCtx,
        pipe: PipeScope,
        group: u32,
        data: &SelGroupData,
    ) -> PipeResult<()> {
        let members = self.resolve(pipe, &data.members)?;
        ctx.emit(Instr::SelWrite {
            tbl: self.info.handle,
            pipe,
            group,
            max_size: data.max_size,
            members,
        })
    }
}

impl TableOwner for SelTable {
    fn info(&self) -> &TableInfo {
        &self.info
    }

    fn usage(&self) -> TableUsage {
        let mut usage = self.usage.clone();
        usage.occupancy =
            self.pipes.values().map(|p| p.groups.len() as u32).sum();
        usage
    }

    fn produce(
        &mut self,
        pipe: PipeScope,
        req: TableRequest,
    ) -> PipeResult<Produced> {
        let moves = match req {
            TableRequest::SelGrpCreate { max_size } => {
                let grp = self.instance(pipe)?.handles.alloc();
                let data = SelGroupData {
                    max_size,
                    members: Vec::new(),
                };
                let moves = self.place(pipe, grp, data)?;
                return Ok(Produced::new(Some(grp), moves));
            }
            TableRequest::SelGrpDestroy { grp } => self.delete(pipe, grp)?,
            TableRequest::SelMbrAdd { grp, mbr } => {
                self.change_group(pipe, grp, |g| {
                    if g.members.iter().any(|m| m.hdl == mbr) {
                        return Err(PipeError::Exists(format!(
                            "member {mbr} of group {grp}"
                        )));
                    }
                    if g.members.len() >= g.max_size as usize {
                        return Err(PipeError::TableFull(format!(
                            "group {grp}"
                        )));
                    }
                    let mut g = g.clone();
                    g.members.push(SelMember {
                        hdl: mbr,
                        active: true,
                    });
                    Ok(g)
                })?
            }
            TableRequest::SelMbrDel { grp, mbr } => {
                self.change_group(pipe, grp, |g| {
                    let mut g = g.clone();
                    let before = g.members.len();
                    g.members.retain(|m| m.hdl != mbr);
                    if g.members.len() == before {
                        return Err(PipeError::Missing(format!(
                            "member {mbr} of group {grp}"
                        )));
                    }
                    Ok(g)
                })?
            }
            TableRequest::SelMbrActivate { grp, mbr }
            | TableRequest::SelMbrDeactivate { grp, mbr } => {
                let active = matches!(req, TableRequest::SelMbrActivate { .. });
                self.change_group(pipe, grp, |g| {
                    let mut g = g.clone();
                    let m = g
                        .members
                        .iter_mut()
                        .find(|m| m.hdl == mbr)
                        .ok_or_else(|| {
                            PipeError::Missing(format!(
                                "member {mbr} of group {grp}"
                            ))
                        })?;
                    m.active = active;
                    Ok(g)
                })?
            }
            TableRequest::SelFallbackSet { mbr } => {
                self.set_fallback(pipe, Some(mbr))?
            }
            TableRequest::SelFallbackClear => self.set_fallback(pipe, None)?,
            req => {
                return Err(PipeError::Invalid(format!(
                    "{req:?} is not a selector request"
                )))
            }
        };
        Ok(Produced::new(None, moves))
    }

    fn apply(&mut self, ctx: &mut ApplyCtx, moves: MoveList) -> PipeResult<()> {
        let tbl = self.info.handle;

        // A run of changes to one group collapses into a single write of its
        // final member word.
        let mut pending: Option<(PipeScope, u32, SelGroupData)> = None;
        for m in moves {
            let pipe = m.pipe;
            match m.op {
                MoveOp::SelGrpCreate { index, .. }
                | MoveOp::SelMbrAdd { index, .. }
                | MoveOp::SelMbrDel { index, .. }
                | MoveOp::SelMbrActivate { index, .. }
                | MoveOp::SelMbrDeactivate { index, .. } => {
                    let data =
                        m.data()?.as_sel_group().ok_or("bad payload")?.clone();
                    if let Some((p, i, d)) = pending.take() {
                        if (p, i) != (pipe, index) {
                            self.write_group(ctx, p, i, &d)?;
                        }
                    }
                    pending = Some((pipe, index, data));
                    continue;
                }
                _ => {}
            }

            if let Some((p, i, d)) = pending.take() {
                self.write_group(ctx, p, i, &d)?;
            }
            match m.op {
                MoveOp::SelGrpDestroy { index, .. } => {
                    ctx.emit_removal(Instr::SelClear {
                        tbl,
                        pipe,
                        group: index,
                    })?;
                }
                MoveOp::SelFallbackSet { mbr } => {
                    let member = Some(self.resolve_one(pipe, mbr)?);
                    ctx.emit(Instr::SelFallback { tbl, pipe, member })?;
                }
                MoveOp::SelFallbackClear => {
                    ctx.emit(Instr::SelFallback {
                        tbl,
                        pipe,
                        member: None,
                    })?;
                }
                op => {
                    return Err(PipeError::Invalid(format!(
                        "{op:?} applied to selector {}",
                        self.info.name
                    )))
                }
            }
        }
        if let Some((p, i, d)) = pending {
            self.write_group(ctx, p, i, &d)?;
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
            EntryData::SelGroup(g) => self.place(pipe, hdl, g),
            _ => Err(PipeError::Invalid("expected a selector group".into())),
        }
    }

    fn modify(
        &mut self,
        pipe: PipeScope,
        hdl: EntryHdl,
        data: EntryData,
    ) -> PipeResult<MoveList> {
        let EntryData::SelGroup(new) = data else {
            return Err(PipeError::Invalid("expected a selector group".into()));
        };
        self.change_group(pipe, hdl, |old| {
            if old.max_size != new.max_size {
                return Err(PipeError::Invalid(format!(
                    "group {hdl} cannot be resized"
                )));
            }
            Ok(new)
        })
    }

    fn delete(
        &mut self,
        pipe: PipeScope,
        grp: EntryHdl,
    ) -> PipeResult<MoveList> {
        let missing = self.missing(grp);
        let info = &self.info;
        let inst = self
            .pipes
            .get_mut(&pipe)
            .ok_or_else(|| no_scope(info, pipe))?;
        let Some((index, _)) = inst.groups.remove(&grp) else {
            self.usage.delete_misses += 1;
            return Err(missing);
        };
        inst.slots.remove(&index);
        if inst.defer_removals {
            inst.quarantine.insert(index);
        }

        let mut moves = MoveList::new();
        moves.allocate(MoveOp::SelGrpDestroy { grp, index }, pipe, None)?;
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
        let inst = self.instance(pipe)?;
        if inst.groups.contains_key(&to) {
            return Err(PipeError::Exists(format!("group {to}")));
        }
        let group = inst.groups.remove(&from).ok_or(missing)?;
        inst.slots.insert(group.0, to);
        inst.groups.insert(to, group);
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
        let mut snapshot = HwSnapshot::default();
        let mut old = Vec::new();
        for record in records {
            match record {
                HwRecord::SelGroup {
                    group,
                    max_size,
                    members,
                } => {
                    let data = SelGroupData {
                        max_size,
                        members: members
                            .iter()
                            .map(|m| SelMember {
                                hdl: HA_TEMP_HDL_BASE + m.adt_index,
                                active: m.active,
                            })
                            .collect(),
                    };
                    old.push(OldEntry {
                        hdl: HA_TEMP_HDL_BASE + group,
                        data: EntryData::SelGroup(data),
                    });
                    snapshot.groups.insert(group, (max_size, members));
                }
                HwRecord::SelFallback { member } => {
                    snapshot.fallback = Some(member);
                }
                r => {
                    return Err(PipeError::Other(format!(
                        "unexpected record in selector {}: {r:?}",
                        self.info.name
                    )))
                }
            }
        }
        debug!(self.log, "read groups from hardware";
            "pipe" => %pipe, "groups" => old.len());

        // The replayed requests rebuild the state from nothing, starting
        // with the handle sequence
        self.pipes.insert(
            pipe,
            SelPipe {
                hw: Some(snapshot),
                ..Default::default()
            },
        );
        Ok(old)
    }

    fn ha_mode(&self) -> HaMode {
        HaMode::Rewrite
    }

    fn ha_delta(&mut self, pipe: PipeScope) -> PipeResult<MoveList> {
        let Some(hw) = self.instance(pipe)?.hw.take() else {
            return Err(PipeError::Invalid(format!(
                "selector {} was not read back from the hardware",
                self.info.name
            )));
        };

        let inst = self
            .pipes
            .get(&pipe)
            .ok_or_else(|| no_scope(&self.info, pipe))?;
        let desired: BTreeMap<u32, (EntryHdl, SelGroupData)> = inst
            .groups
            .iter()
            .map(|(grp, (index, data))| (*index, (*grp, data.clone())))
            .collect();
        let fallback = *inst.fallback.get();

        let mut moves = MoveList::new();
        let indexes: BTreeSet<u32> =
            desired.keys().chain(hw.groups.keys()).copied().collect();
        for index in indexes {
            match (desired.get(&index), hw.groups.get(&index)) {
                (Some((grp, data)), None) => moves.allocate(
                    MoveOp::SelGrpCreate { grp: *grp, index },
                    pipe,
                    Some(EntryData::SelGroup(data.clone())),
                )?,
                (None, Some(_)) => moves.allocate(
                    MoveOp::SelGrpDestroy {
                        grp: HA_TEMP_HDL_BASE + index,
                        index,
                    },
                    pipe,
                    None,
                )?,
                (Some((grp, data)), Some((max_size, _)))
                    if *max_size != data.max_size =>
                {
                    moves.allocate(
                        MoveOp::SelGrpDestroy { grp: *grp, index },
                        pipe,
                        None,
                    )?;
                    moves.allocate(
                        MoveOp::SelGrpCreate { grp: *grp, index },
                        pipe,
                        Some(EntryData::SelGroup(data.clone())),
                    )?;
                }
                (Some((grp, data)), Some((_, hw_members))) => {
                    // Name each hardware member by the replayed member that
                    // resolves to the same action entry, if there is one.
                    let resolved = self.resolve(pipe, &data.members)?;
                    let old: Vec<SelMember> = hw_members
                        .iter()
                        .map(|hm| SelMember {
                            hdl: resolved
                                .iter()
                                .position(|r| r.adt_index == hm.adt_index)
                                .map(|i| data.members[i].hdl)
                                .unwrap_or(HA_TEMP_HDL_BASE + hm.adt_index),
                            active: hm.active,
                        })
                        .collect();
                    diff_members(&mut moves, pipe, *grp, index, &old, data)?;
                }
                (None, None) => {}
            }
        }

        let wanted = match fallback {
            Some(mbr) => Some((mbr, self.resolve_one(pipe, mbr)?)),
            None => None,
        };
        match (wanted, hw.fallback) {
            (Some((mbr, want)), have) if have != Some(want) => moves.allocate(
                MoveOp::SelFallbackSet { mbr },
                pipe,
                Some(EntryData::Fallback(mbr)),
            )?,
            (None, Some(_)) => {
                moves.allocate(MoveOp::SelFallbackClear, pipe, None)?
            }
            _ => {}
        }
        debug!(self.log, "computed selector delta";
            "pipe" => %pipe, "moves" => moves.len());
        Ok(moves)
    }

    fn entry_get(
        &self,
        pipe: PipeScope,
        hdl: EntryHdl,
    ) -> PipeResult<EntryData> {
        self.group(pipe, hdl).map(|(_, g)| EntryData::SelGroup(g))
    }

    fn index_of(&self, pipe: PipeScope, hdl: EntryHdl) -> Option<u32> {
        self.pipes.get(&pipe)?.groups.get(&hdl).map(|(i, _)| *i)
    }

    fn references(
        &self,
        tbl: TblHdl,
        pipe: PipeScope,
        hdl: EntryHdl,
    ) -> bool {
        if tbl != self.adt_handle() {
            return false;
        }
        self.pipes.get(&pipe).is_some_and(|inst| {
            *inst.fallback.get() == Some(hdl)
                || inst
                    .groups
                    .values()
                    .any(|(_, g)| g.members.iter().any(|m| m.hdl == hdl))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::config::default_reconcile_order;
    use crate::ilist::InstrLog;
    use crate::move_list::MoveKind;
    use crate::table::adt::AdtTable;
    use crate::table::test_util::test_logger;
    use aal::ActionData;
    use common::table::TableKind;
    use common::PipeStatus;

    fn info(handle: TblHdl, kind: TableKind) -> TableInfo {
        TableInfo {
            handle,
            name: format!("{kind}{handle}"),
            kind,
            size: 4,
            symmetric: true,
            ternary: false,
            default_action: None,
            reconcile_order: default_reconcile_order(),
            action_table: Some(1),
        }
    }

    fn tables() -> (TableRef, SelTable) {
        let adt: Box<dyn TableOwner> = Box::new(AdtTable::new(
            test_logger(),
            info(1, TableKind::ActionData),
            &[0],
        ));
        let adt = Arc::new(Mutex::new(adt));
        for port in 0..3u16 {
            adt.lock()
                .unwrap()
                .produce(
                    PipeScope::All,
                    TableRequest::AdtAdd {
                        action: ActionData::new("port").arg("p", port),
                    },
                )
                .unwrap();
        }
        let sel = SelTable::new(
            test_logger(),
            info(2, TableKind::Selector),
            &[0],
            adt.clone(),
        );
        (adt, sel)
    }

    fn req(sel: &mut SelTable, req: TableRequest) -> PipeResult<Produced> {
        sel.produce(PipeScope::All, req)
    }

    #[test]
    fn test_members() {
        let (_adt, mut sel) = tables();
        let grp = req(&mut sel, TableRequest::SelGrpCreate { max_size: 2 })
            .unwrap()
            .handle
            .unwrap();
        req(&mut sel, TableRequest::SelMbrAdd { grp, mbr: 1 }).unwrap();
        let err =
            req(&mut sel, TableRequest::SelMbrAdd { grp, mbr: 1 }).unwrap_err();
        assert_eq!(err.status(), PipeStatus::AlreadyExists);
        req(&mut sel, TableRequest::SelMbrAdd { grp, mbr: 2 }).unwrap();
        let err =
            req(&mut sel, TableRequest::SelMbrAdd { grp, mbr: 3 }).unwrap_err();
        assert_eq!(err.status(), PipeStatus::NoSpace);

        let p =
            req(&mut sel, TableRequest::SelMbrDeactivate { grp, mbr: 2 })
                .unwrap();
        assert_eq!(p.moves.iter().next().unwrap().op.kind(), MoveKind::SelMbrDeactivate);

        assert!(sel.references(1, PipeScope::All, 2));
        assert!(!sel.references(1, PipeScope::All, 3));
        assert!(!sel.references(7, PipeScope::All, 2));
    }

    #[test]
    fn test_apply_coalesces_group_writes() {
        let (adt, mut sel) = tables();
        let asic = asic::Handle::new(&test_logger(), &Default::default())
            .unwrap();
        let mut moves = MoveList::new();
        let p = req(&mut sel, TableRequest::SelGrpCreate { max_size: 4 })
            .unwrap();
        let grp = p.handle.unwrap();
        moves.append(p.moves).unwrap();
        for mbr in [1, 3] {
            let p = req(&mut sel, TableRequest::SelMbrAdd { grp, mbr }).unwrap();
            moves.append(p.moves).unwrap();
        }
        let p = req(&mut sel, TableRequest::SelFallbackSet { mbr: 3 }).unwrap();
        moves.append(p.moves).unwrap();

        let mut ilog = InstrLog::new();
        let mut ctx = ApplyCtx {
            asic: &asic,
            dev: 0,
            ilog: &mut ilog,
            atomic: false,
        };
        // The model only encodes instructions for devices it knows about
        asic.device_add(0, &[0], true).unwrap();
        sel.apply(&mut ctx, moves).unwrap();
        ilog.push(&test_logger(), &asic, true).unwrap();
        assert_eq!(asic.instr_count(0).unwrap(), 2);

        let adt_index = adt.lock().unwrap().index_of(PipeScope::All, 3);
        assert_eq!(adt_index, Some(2));
    }

    #[test]
    fn test_modify_diffs_members() {
        let (_adt, mut sel) = tables();
        let grp = req(&mut sel, TableRequest::SelGrpCreate { max_size: 3 })
            .unwrap()
            .handle
            .unwrap();
        req(&mut sel, TableRequest::SelMbrAdd { grp, mbr: 1 }).unwrap();
        req(&mut sel, TableRequest::SelMbrAdd { grp, mbr: 2 }).unwrap();

        let new = SelGroupData {
            max_size: 3,
            members: vec![
                SelMember {
                    hdl: 2,
                    active: false,
                },
                SelMember {
                    hdl: 3,
                    active: true,
                },
            ],
        };
        let moves = sel
            .modify(PipeScope::All, grp, EntryData::SelGroup(new.clone()))
            .unwrap();
        let kinds: Vec<MoveKind> = moves.iter().map(|m| m.op.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                MoveKind::SelMbrDel,
                MoveKind::SelMbrDeactivate,
                MoveKind::SelMbrAdd
            ]
        );
        assert_eq!(
            sel.entry_get(PipeScope::All, grp).unwrap(),
            EntryData::SelGroup(new)
        );
    }
}
