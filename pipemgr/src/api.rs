// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The client-facing table operations.
//!
//! Every mutation runs through the same pipeline.  The prologue validates
//! the session, device and table, reserves the table for the session and
//! opens a stage on the table's owner.  The owner produces the change, and
//! the epilogue then decides by the session's state whether the resulting
//! moves are saved for a later commit or applied and pushed.  On failure the
//! epilogue unwinds whatever the prologue and the owner did.

use std::collections::BTreeMap;

use slog::{debug, trace};

use aal::{ActionData, ActionParse, MatchParse};
use common::table::TblHdl;
use common::{DevId, DevTarget, EntryHdl, PipeScope, SessHdl};

use crate::ha::HaPhase;
use crate::move_list::{EntryData, EntrySpec, MatEntry, SelGroupData};
use crate::move_list::TableUpdate;
use crate::session::{SessState, Session};
use crate::table::{ApplyCtx, TableOwner, TableRef, TableRequest, TableUsage};
use crate::types::{PipeError, PipeResult};
use crate::{Device, PipeMgr};

pub(crate) fn no_device(dev: DevId) -> PipeError {
    PipeError::Missing(format!("device {dev}"))
}

fn created(hdl: Option<EntryHdl>) -> PipeResult<EntryHdl> {
    hdl.ok_or_else(|| PipeError::Other("no handle returned".into()))
}

/// Requests that name an entry of another table are checked against that
/// table before the owner sees them.
fn refs_check(
    device: &Device,
    owner: &TableRef,
    tbl: TblHdl,
    pipe: PipeScope,
    req: &TableRequest,
    replaying: bool,
) -> PipeResult<()> {
    match *req {
        TableRequest::SelMbrAdd { mbr, .. }
        | TableRequest::SelFallbackSet { mbr } => {
            let adt = owner.lock().unwrap().info().action_table.ok_or_else(
                || PipeError::Invalid(format!("table {tbl} has no members")),
            )?;
            let exists = if replaying {
                device
                    .ha
                    .maps
                    .get(&(adt, pipe))
                    .is_some_and(|m| m.replay_get(mbr).is_some())
            } else {
                device.table(adt)?.lock().unwrap().entry_get(pipe, mbr).is_ok()
            };
            if !exists {
                return Err(PipeError::Missing(format!("action entry {mbr}")));
            }
        }
        TableRequest::AdtDelete { hdl } => {
            for (other, o) in &device.tables {
                if *other != tbl && o.lock().unwrap().references(tbl, pipe, hdl)
                {
                    return Err(PipeError::Referenced(format!(
                        "action entry {hdl} of table {tbl}"
                    )));
                }
            }
        }
        _ => {}
    }
    Ok(())
}

impl PipeMgr {
    /// Run one client request through the pipeline, returning the handle of
    /// any entry it created.
    fn table_op(
        &self,
        sess: SessHdl,
        target: DevTarget,
        tbl: TblHdl,
        req: TableRequest,
    ) -> PipeResult<Option<EntryHdl>> {
        let _gate = self.api_gate.lock().unwrap();
        let sref = self.session_get(sess)?;
        let mut guard = sref.lock().unwrap();
        let s = &mut *guard;
        s.check_not_committing()?;

        let mut devices = self.devices.lock().unwrap();
        let device = devices
            .get_mut(&target.dev)
            .ok_or_else(|| no_device(target.dev))?;
        let replaying = match device.ha.phase {
            HaPhase::Ready => false,
            HaPhase::Replaying => true,
            phase => {
                return Err(PipeError::NotReady(format!(
                    "device {} is in HA phase {phase:?}",
                    target.dev
                )))
            }
        };
        let owner = device.table(tbl)?;
        owner.lock().unwrap().info().check_scope(target.pipe)?;
        refs_check(device, &owner, tbl, target.pipe, &req, replaying)?;

        if replaying {
            if s.in_txn() {
                return Err(PipeError::TxnNotSupported(format!(
                    "device {} is replaying",
                    target.dev
                )));
            }
            trace!(s.log, "replaying request"; "table" => tbl, "req" => ?req);
            return device.replay(&owner, target.pipe, req);
        }
        let virtual_device = device.virtual_device;

        self.reservations.lock().unwrap().acquire(
            sess,
            target.dev,
            tbl,
            target.pipe,
        )?;

        if s.in_batch() {
            s.ilog.checkpoint();
        }
        if s.in_txn() {
            s.touched.insert((target.dev, tbl, target.pipe));
        }
        let result = {
            let mut o = owner.lock().unwrap();
            // Only an atomic commit holds removals back until the end
            o.stage_begin(target.pipe, s.is_atomic());
            self.produce(s, virtual_device, &mut **o, target, req)
        };

        let result = match result {
            Ok((hdl, updates)) => self
                .epilogue_ok(s, &owner, target.pipe, updates)
                .map(|_| hdl),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            debug!(s.log, "table operation failed";
                "dev" => target.dev,
                "table" => tbl,
                "status" => %e.status(),
                "error" => %e);
            self.epilogue_err(s, &devices, &owner, target.pipe, e);
        }
        result
    }

    /// Have the owner produce the request.  Inside a transaction the moves
    /// are saved in the session; otherwise they are applied right away.
    fn produce(
        &self,
        s: &mut Session,
        virtual_device: bool,
        owner: &mut dyn TableOwner,
        target: DevTarget,
        req: TableRequest,
    ) -> PipeResult<(Option<EntryHdl>, Vec<TableUpdate>)> {
        let key = (target.dev, owner.info().handle);
        if s.in_txn() {
            // Saving the moves must not fail once the owner has changed
            s.saved.entry(key).or_default().reserve(1)?;
        }
        let produced = owner.produce(target.pipe, req)?;
        trace!(s.log, "produced moves";
            "table" => key.1, "moves" => produced.moves.len());

        if s.in_txn() {
            s.saved.entry(key).or_default().append(produced.moves)?;
            return Ok((produced.handle, Vec::new()));
        }
        let updates = produced.moves.updates(target.dev, key.1);
        if !virtual_device {
            let mut ctx = ApplyCtx {
                asic: self.asic_ops(),
                dev: target.dev,
                ilog: &mut s.ilog,
                atomic: false,
            };
            owner.apply(&mut ctx, produced.moves)?;
        }
        Ok((produced.handle, updates))
    }

    fn epilogue_ok(
        &self,
        s: &mut Session,
        owner: &TableRef,
        pipe: PipeScope,
        updates: Vec<TableUpdate>,
    ) -> PipeResult<()> {
        match s.state {
            // The stage stays open until the transaction ends
            SessState::InTxn { .. } => {}
            SessState::InBatch => {
                owner.lock().unwrap().stage_commit(pipe);
                self.updates_send(updates);
            }
            SessState::Idle => {
                let sync = s.sync;
                s.ilog.push(&s.log, self.asic_ops(), sync)?;
                owner.lock().unwrap().stage_commit(pipe);
                self.reservations.lock().unwrap().release_all(s.hdl);
                self.updates_send(updates);
            }
        }
        Ok(())
    }

    fn epilogue_err(
        &self,
        s: &mut Session,
        devices: &BTreeMap<DevId, Device>,
        owner: &TableRef,
        pipe: PipeScope,
        err: &PipeError,
    ) {
        match s.state {
            SessState::InTxn { .. } => self.txn_discard(s, devices),
            SessState::InBatch => {
                // Only this operation is undone.  The batch carries on and
                // reports the failure when it ends.
                s.ilog.rollback();
                owner.lock().unwrap().stage_revert(pipe);
                s.batch_error_record(err);
            }
            SessState::Idle => {
                s.ilog.abort();
                owner.lock().unwrap().stage_revert(pipe);
                self.reservations.lock().unwrap().release_all(s.hdl);
            }
        }
    }

    fn entry_get(
        &self,
        target: DevTarget,
        tbl: TblHdl,
        hdl: EntryHdl,
    ) -> PipeResult<EntryData> {
        let devices = self.devices.lock().unwrap();
        let device =
            devices.get(&target.dev).ok_or_else(|| no_device(target.dev))?;
        let owner = device.table(tbl)?;
        // While replaying, a client reads back what it has replayed so far
        if device.ha.phase == HaPhase::Replaying {
            if let Some(map) = device.ha.maps.get(&(tbl, target.pipe)) {
                return map.replay_get(hdl).cloned().ok_or_else(|| {
                    PipeError::Missing(format!("replayed entry {hdl}"))
                });
            }
        }
        let owner = owner.lock().unwrap();
        owner.info().check_scope(target.pipe)?;
        owner.entry_get(target.pipe, hdl)
    }

    pub fn mat_ent_add(
        &self,
        sess: SessHdl,
        target: DevTarget,
        tbl: TblHdl,
        entry: MatEntry,
    ) -> PipeResult<EntryHdl> {
        created(self.table_op(
            sess,
            target,
            tbl,
            TableRequest::MatAdd { entry },
        )?)
    }

    /// Add an entry built from typed key and action structures.
    pub fn mat_ent_add_typed<K: MatchParse, A: ActionParse>(
        &self,
        sess: SessHdl,
        target: DevTarget,
        tbl: TblHdl,
        key: &K,
        action: &A,
    ) -> PipeResult<EntryHdl> {
        let entry = MatEntry {
            key: key.key_to_ir()?,
            priority: 0,
            spec: EntrySpec::new(action.action_to_ir()?),
        };
        self.mat_ent_add(sess, target, tbl, entry)
    }

    /// Replace the action side of an entry.  The key cannot be changed.
    pub fn mat_ent_modify(
        &self,
        sess: SessHdl,
        target: DevTarget,
        tbl: TblHdl,
        hdl: EntryHdl,
        spec: EntrySpec,
    ) -> PipeResult<()> {
        self.table_op(sess, target, tbl, TableRequest::MatModify { hdl, spec })
            .map(|_| ())
    }

    pub fn mat_ent_del(
        &self,
        sess: SessHdl,
        target: DevTarget,
        tbl: TblHdl,
        hdl: EntryHdl,
    ) -> PipeResult<()> {
        self.table_op(sess, target, tbl, TableRequest::MatDelete { hdl })
            .map(|_| ())
    }

    pub fn mat_ent_get(
        &self,
        target: DevTarget,
        tbl: TblHdl,
        hdl: EntryHdl,
    ) -> PipeResult<MatEntry> {
        match self.entry_get(target, tbl, hdl)? {
            EntryData::Mat(e) => Ok(e),
            _ => Err(PipeError::Invalid(format!("{tbl} is not a match table"))),
        }
    }

    /// Fetch an entry, converted back into typed key and action structures.
    pub fn mat_ent_get_typed<K: MatchParse, A: ActionParse>(
        &self,
        target: DevTarget,
        tbl: TblHdl,
        hdl: EntryHdl,
    ) -> PipeResult<(K, A)> {
        let entry = self.mat_ent_get(target, tbl, hdl)?;
        Ok((
            K::ir_to_key(&entry.key)?,
            A::ir_to_action(&entry.spec.action)?,
        ))
    }

    pub fn mat_default_set(
        &self,
        sess: SessHdl,
        target: DevTarget,
        tbl: TblHdl,
        action: ActionData,
    ) -> PipeResult<()> {
        self.table_op(sess, target, tbl, TableRequest::MatSetDefault { action })
            .map(|_| ())
    }

    /// Return the table's miss action to its static default.
    pub fn mat_default_clear(
        &self,
        sess: SessHdl,
        target: DevTarget,
        tbl: TblHdl,
    ) -> PipeResult<()> {
        self.table_op(sess, target, tbl, TableRequest::MatClearDefault)
            .map(|_| ())
    }

    pub fn mat_default_get(
        &self,
        target: DevTarget,
        tbl: TblHdl,
    ) -> PipeResult<Option<ActionData>> {
        let devices = self.devices.lock().unwrap();
        let device =
            devices.get(&target.dev).ok_or_else(|| no_device(target.dev))?;
        let owner = device.table(tbl)?;
        let owner = owner.lock().unwrap();
        owner.info().check_scope(target.pipe)?;
        if device.ha.phase == HaPhase::Replaying {
            if let Some(map) = device.ha.maps.get(&(tbl, target.pipe)) {
                return Ok(map
                    .replay_default()
                    .cloned()
                    .or_else(|| owner.info().default_action.clone()));
            }
        }
        Ok(owner.default_get(target.pipe))
    }

    pub fn adt_ent_add(
        &self,
        sess: SessHdl,
        target: DevTarget,
        tbl: TblHdl,
        action: ActionData,
    ) -> PipeResult<EntryHdl> {
        created(self.table_op(
            sess,
            target,
            tbl,
            TableRequest::AdtAdd { action },
        )?)
    }

    pub fn adt_ent_modify(
        &self,
        sess: SessHdl,
        target: DevTarget,
        tbl: TblHdl,
        hdl: EntryHdl,
        action: ActionData,
    ) -> PipeResult<()> {
        self.table_op(
            sess,
            target,
            tbl,
            TableRequest::AdtModify { hdl, action },
        )
        .map(|_| ())
    }

    /// Delete an action-data entry.  Fails if any selector group, or a
    /// selector's fallback, still refers to it.
    pub fn adt_ent_del(
        &self,
        sess: SessHdl,
        target: DevTarget,
        tbl: TblHdl,
        hdl: EntryHdl,
    ) -> PipeResult<()> {
        self.table_op(sess, target, tbl, TableRequest::AdtDelete { hdl })
            .map(|_| ())
    }

    pub fn adt_ent_get(
        &self,
        target: DevTarget,
        tbl: TblHdl,
        hdl: EntryHdl,
    ) -> PipeResult<ActionData> {
        match self.entry_get(target, tbl, hdl)? {
            EntryData::Adt(a) => Ok(a),
            _ => Err(PipeError::Invalid(format!(
                "{tbl} is not an action-data table"
            ))),
        }
    }

    pub fn sel_grp_create(
        &self,
        sess: SessHdl,
        target: DevTarget,
        tbl: TblHdl,
        max_size: u32,
    ) -> PipeResult<EntryHdl> {
        created(self.table_op(
            sess,
            target,
            tbl,
            TableRequest::SelGrpCreate { max_size },
        )?)
    }

    pub fn sel_grp_destroy(
        &self,
        sess: SessHdl,
        target: DevTarget,
        tbl: TblHdl,
        grp: EntryHdl,
    ) -> PipeResult<()> {
        self.table_op(sess, target, tbl, TableRequest::SelGrpDestroy { grp })
            .map(|_| ())
    }

    /// Add an action-data entry to a group.  New members start out active.
    pub fn sel_grp_mbr_add(
        &self,
        sess: SessHdl,
        target: DevTarget,
        tbl: TblHdl,
        grp: EntryHdl,
        mbr: EntryHdl,
    ) -> PipeResult<()> {
        self.table_op(sess, target, tbl, TableRequest::SelMbrAdd { grp, mbr })
            .map(|_| ())
    }

    pub fn sel_grp_mbr_del(
        &self,
        sess: SessHdl,
        target: DevTarget,
        tbl: TblHdl,
        grp: EntryHdl,
        mbr: EntryHdl,
    ) -> PipeResult<()> {
        self.table_op(sess, target, tbl, TableRequest::SelMbrDel { grp, mbr })
            .map(|_| ())
    }

    pub fn sel_grp_mbr_enable(
        &self,
        sess: SessHdl,
        target: DevTarget,
        tbl: TblHdl,
        grp: EntryHdl,
        mbr: EntryHdl,
    ) -> PipeResult<()> {
        self.table_op(
            sess,
            target,
            tbl,
            TableRequest::SelMbrActivate { grp, mbr },
        )
        .map(|_| ())
    }

    pub fn sel_grp_mbr_disable(
        &self,
        sess: SessHdl,
        target: DevTarget,
        tbl: TblHdl,
        grp: EntryHdl,
        mbr: EntryHdl,
    ) -> PipeResult<()> {
        self.table_op(
            sess,
            target,
            tbl,
            TableRequest::SelMbrDeactivate { grp, mbr },
        )
        .map(|_| ())
    }

    pub fn sel_grp_get(
        &self,
        target: DevTarget,
        tbl: TblHdl,
        grp: EntryHdl,
    ) -> PipeResult<SelGroupData> {
        match self.entry_get(target, tbl, grp)? {
            EntryData::SelGroup(g) => Ok(g),
            _ => Err(PipeError::Invalid(format!("{tbl} is not a selector"))),
        }
    }

    /// Choose the member used when a selected group has no active members.
    pub fn sel_fallback_set(
        &self,
        sess: SessHdl,
        target: DevTarget,
        tbl: TblHdl,
        mbr: EntryHdl,
    ) -> PipeResult<()> {
        self.table_op(sess, target, tbl, TableRequest::SelFallbackSet { mbr })
            .map(|_| ())
    }

    pub fn sel_fallback_clear(
        &self,
        sess: SessHdl,
        target: DevTarget,
        tbl: TblHdl,
    ) -> PipeResult<()> {
        self.table_op(sess, target, tbl, TableRequest::SelFallbackClear)
            .map(|_| ())
    }

    /// Report the usage counters of a table on one device.
    pub fn table_usage(&self, dev: DevId, tbl: TblHdl) -> PipeResult<TableUsage> {
        let devices = self.devices.lock().unwrap();
        let device = devices.get(&dev).ok_or_else(|| no_device(dev))?;
        let owner = device.table(tbl)?;
        let usage = owner.lock().unwrap().usage();
        Ok(usage)
    }
}
