// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Hitless restart.
//!
//! A device added in hitless mode keeps forwarding with whatever its tables
//! held when the previous control plane went away.  The restart then runs
//! through a fixed sequence of phases:
//!
//! 1. `AwaitingHwRead`: background tasks are suspended and client requests
//!    are refused until the tables have been read back.
//! 2. `Replaying`: every table has been read back, and clients replay the
//!    configuration they want.  Replayed requests only update the software
//!    state and never reach the hardware.
//! 3. `DeltaComputed`: the recovered and replayed states have been compared
//!    and the owners hold the replayed state.  The moves that converge the
//!    hardware are waiting to be pushed.
//! 4. `Ready`: the delta has been pushed, background tasks are running again
//!    and the device behaves as if it had been cold-started with the
//!    replayed configuration.
//!
//! A failure at any step leaves the device in `Failed`.  Recovering from
//! that takes a cold restart.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::{error, info, o};

use aal::{BackgroundTask, DirectResource, MatchData};
use common::table::{TableKind, TblHdl};
use common::{DevId, DevTarget, EntryHdl, PipeId, PipeScope};

use crate::api::no_device;
use crate::move_list::{EntryData, MatEntry, MoveList, TableUpdate};
use crate::session::{Session, INTERNAL_SESSION};
use crate::table::{
    self, ApplyCtx, HaMode, TableOwner, TableRef, TableRequest,
};
use crate::types::{PipeError, PipeResult};
use crate::{Device, PipeMgr};

pub mod reconcile;
pub mod spec_map;

use spec_map::{Classification, SpecMap, Worklist};

/// How a device is brought up.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum DeviceMode {
    /// Wipe the hardware and start from empty tables
    Cold,
    /// Keep the hardware running and reconcile it with a replay
    Hitless,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum HaPhase {
    AwaitingHwRead,
    Replaying,
    DeltaComputed,
    Ready,
    Failed,
}

/// A recovered entry whose key and action match its replay, but whose
/// direct resources are configured differently.  The entry is rewritten
/// with the replayed resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ResourceMismatch {
    pub table: String,
    pub pipe: PipeScope,
    pub hdl: EntryHdl,
    pub key: MatchData,
    pub hw: Vec<DirectResource>,
    pub replay: Vec<DirectResource>,
}

/// What reconciliation found and did for one table instance.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TableReport {
    pub table: String,
    pub handle: TblHdl,
    pub pipe: PipeScope,
    /// The number of entries in each classification, for tables matched
    /// key by key
    pub classes: BTreeMap<Classification, usize>,
    /// Entries read back from the hardware
    pub recovered: usize,
    pub remapped: usize,
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub default_changed: bool,
    /// The number of moves needed to converge the hardware
    pub delta_moves: usize,
    pub mismatches: Vec<ResourceMismatch>,
}

impl TableReport {
    fn new(info: &table::TableInfo, pipe: PipeScope) -> Self {
        TableReport {
            table: info.name.clone(),
            handle: info.handle,
            pipe,
            classes: BTreeMap::new(),
            recovered: 0,
            remapped: 0,
            added: 0,
            modified: 0,
            deleted: 0,
            default_changed: false,
            delta_moves: 0,
            mismatches: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReconcileReport {
    pub dev: DevId,
    pub tables: Vec<TableReport>,
}

impl ReconcileReport {
    /// The total number of moves needed to converge the device.
    pub fn delta_moves(&self) -> usize {
        self.tables.iter().map(|t| t.delta_moves).sum()
    }
}

/// The restart state of one device.
pub struct HaState {
    pub mode: DeviceMode,
    pub phase: HaPhase,
    /// One spec map per table instance matched key by key
    pub maps: BTreeMap<(TblHdl, PipeScope), SpecMap>,
    /// The computed moves, in the order they are to be applied
    pub delta: Vec<(TblHdl, PipeScope, MoveList)>,
    pub report: Option<ReconcileReport>,
}

impl HaState {
    pub fn new(mode: DeviceMode) -> Self {
        HaState {
            mode,
            phase: match mode {
                DeviceMode::Cold => HaPhase::Ready,
                DeviceMode::Hitless => HaPhase::AwaitingHwRead,
            },
            maps: BTreeMap::new(),
            delta: Vec::new(),
            report: None,
        }
    }
}

/// The device's tables in the order they are read back and reconciled.
/// Action-data tables come first, since selectors resolve their members
/// through them.
fn ha_order(device: &Device) -> Vec<TableRef> {
    let mut tables: Vec<(u8, TableRef)> = device
        .tables
        .values()
        .map(|t| {
            let rank = match t.lock().unwrap().info().kind {
                TableKind::ActionData => 0,
                TableKind::Match => 1,
                TableKind::Selector => 2,
            };
            (rank, t.clone())
        })
        .collect();
    tables.sort_by_key(|(rank, _)| *rank);
    tables.into_iter().map(|(_, t)| t).collect()
}

/// Run a stage operation on every instance of each table.
fn stage_each<F>(tables: &[TableRef], pipes: &[PipeId], f: F)
where
    F: Fn(&mut dyn TableOwner, PipeScope),
{
    for t in tables {
        let mut o = t.lock().unwrap();
        for pipe in o.info().scopes(pipes) {
            f(&mut **o, pipe);
        }
    }
}

impl Device {
    /// Record a request replayed while the device is reconciling.
    pub(crate) fn replay(
        &mut self,
        owner: &TableRef,
        pipe: PipeScope,
        req: TableRequest,
    ) -> PipeResult<Option<EntryHdl>> {
        let mut o = owner.lock().unwrap();
        let tbl = o.info().handle;

        // These tables rebuild their state from the replay, and work out
        // their own delta later.  The moves produced now are not needed.
        if o.ha_mode() == HaMode::Rewrite {
            o.stage_begin(pipe, false);
            return match o.produce(pipe, req) {
                Ok(produced) => {
                    o.stage_commit(pipe);
                    Ok(produced.handle)
                }
                Err(e) => {
                    o.stage_revert(pipe);
                    Err(e)
                }
            };
        }

        let map = self.ha.maps.get_mut(&(tbl, pipe)).ok_or_else(|| {
            PipeError::Other(format!("table {tbl} ({pipe}) has no spec map"))
        })?;
        match req {
            // The handle is only reserved once the map has accepted the key,
            // so a rejected replay does not shift later handles
            TableRequest::MatAdd { entry } => {
                let hdl = map.replay_add(EntryData::Mat(entry), || {
                    o.reserve_handle(pipe)
                })?;
                Ok(Some(hdl))
            }
            TableRequest::AdtAdd { action } => {
                let hdl = map.replay_add(EntryData::Adt(action), || {
                    o.reserve_handle(pipe)
                })?;
                Ok(Some(hdl))
            }
            TableRequest::MatModify { hdl, spec } => {
                let Some(EntryData::Mat(current)) = map.replay_get(hdl).cloned()
                else {
                    return Err(PipeError::Missing(format!(
                        "replayed entry {hdl}"
                    )));
                };
                map.replay_modify(hdl, EntryData::Mat(MatEntry { spec, ..current }))?;
                Ok(None)
            }
            TableRequest::AdtModify { hdl, action } => {
                map.replay_modify(hdl, EntryData::Adt(action))?;
                Ok(None)
            }
            TableRequest::MatDelete { hdl } | TableRequest::AdtDelete { hdl } => {
                map.replay_remove(hdl)?;
                Ok(None)
            }
            TableRequest::MatSetDefault { action } => {
                map.replay_default_set(Some(action));
                Ok(None)
            }
            TableRequest::MatClearDefault => {
                map.replay_default_set(None);
                Ok(None)
            }
            req => Err(PipeError::Invalid(format!(
                "{req:?} cannot be replayed into table {tbl}"
            ))),
        }
    }
}

impl PipeMgr {
    /// Bring up a configured device.
    pub fn device_add(&self, dev: DevId, mode: DeviceMode) -> PipeResult<()> {
        let dc = self.config.device(dev).cloned().ok_or_else(|| {
            PipeError::Missing(format!("device {dev} is not configured"))
        })?;
        {
            let _gate = self.api_gate.lock().unwrap();
            let mut devices = self.devices.lock().unwrap();
            if devices.contains_key(&dev) {
                return Err(PipeError::Exists(format!("device {dev}")));
            }
            if dc.virtual_device && mode == DeviceMode::Hitless {
                return Err(PipeError::NotSupported(format!(
                    "virtual device {dev} has no hardware to recover"
                )));
            }

            let log = self.log.new(o!("dev" => dev));
            let tables =
                table::registry_build(&log, &self.config.tables, &dc.pipes)?;
            if !dc.virtual_device {
                let asic = self.asic_ops();
                asic.device_add(dev, &dc.pipes, mode == DeviceMode::Cold)?;
                if mode == DeviceMode::Hitless {
                    for task in BackgroundTask::ALL {
                        asic.background_set(dev, task, false)?;
                    }
                }
            }
            devices.insert(
                dev,
                Device {
                    dev,
                    pipes: dc.pipes.clone(),
                    virtual_device: dc.virtual_device,
                    tables,
                    ha: HaState::new(mode),
                },
            );
            info!(self.log, "added device";
                "dev" => dev,
                "mode" => ?mode,
                "virtual" => dc.virtual_device);
        }

        if mode == DeviceMode::Cold {
            self.defaults_install(dev)?;
        }
        Ok(())
    }

    /// Install the static default action of every match table that has one.
    fn defaults_install(&self, dev: DevId) -> PipeResult<()> {
        let targets: Vec<(TblHdl, PipeScope)> = {
            let devices = self.devices.lock().unwrap();
            let device = devices.get(&dev).ok_or_else(|| no_device(dev))?;
            let mut targets = Vec::new();
            for (tbl, owner) in &device.tables {
                let o = owner.lock().unwrap();
                let info = o.info();
                if info.kind == TableKind::Match && info.default_action.is_some()
                {
                    for pipe in info.scopes(&device.pipes) {
                        targets.push((*tbl, pipe));
                    }
                }
            }
            targets
        };
        for (tbl, pipe) in targets {
            self.mat_default_clear(INTERNAL_SESSION, DevTarget { dev, pipe }, tbl)?;
        }
        Ok(())
    }

    /// Forget a device.  The hardware keeps whatever it was last programmed
    /// with.
    pub fn device_remove(&self, dev: DevId) -> PipeResult<()> {
        let _gate = self.api_gate.lock().unwrap();
        let mut devices = self.devices.lock().unwrap();
        if !devices.contains_key(&dev) {
            return Err(no_device(dev));
        }
        if self.reservations.lock().unwrap().device_held(dev) {
            return Err(PipeError::Busy(format!(
                "device {dev} has tables reserved by a session"
            )));
        }
        if let Some(device) = devices.remove(&dev) {
            if !device.virtual_device {
                self.asic_ops().device_remove(dev)?;
            }
        }
        info!(self.log, "removed device"; "dev" => dev);
        Ok(())
    }

    pub fn ha_phase(&self, dev: DevId) -> PipeResult<HaPhase> {
        let devices = self.devices.lock().unwrap();
        let device = devices.get(&dev).ok_or_else(|| no_device(dev))?;
        Ok(device.ha.phase)
    }

    /// The report of the last reconciliation of the device, if any.
    pub fn ha_report(&self, dev: DevId) -> PipeResult<Option<ReconcileReport>> {
        let devices = self.devices.lock().unwrap();
        let device = devices.get(&dev).ok_or_else(|| no_device(dev))?;
        Ok(device.ha.report.clone())
    }

    /// Read every table of a hitless device back from the hardware, and
    /// open the device for replay.
    pub fn ha_hw_read_complete(&self, dev: DevId) -> PipeResult<()> {
        let _gate = self.api_gate.lock().unwrap();
        let mut devices = self.devices.lock().unwrap();
        let device = devices.get_mut(&dev).ok_or_else(|| no_device(dev))?;
        phase_check(device, HaPhase::AwaitingHwRead)?;

        match self.hw_read(device) {
            Ok(entries) => {
                info!(self.log, "read device tables back from hardware";
                    "dev" => dev, "entries" => entries);
                device.ha.phase = HaPhase::Replaying;
                Ok(())
            }
            Err(e) => {
                error!(self.log, "hardware read failed";
                    "dev" => dev, "error" => %e);
                device.ha.maps.clear();
                device.ha.phase = HaPhase::Failed;
                Err(e)
            }
        }
    }

    fn hw_read(&self, device: &mut Device) -> PipeResult<usize> {
        let mut count = 0;
        for owner in ha_order(device) {
            let mut o = owner.lock().unwrap();
            let info = o.info().clone();
            for pipe in info.scopes(&device.pipes) {
                let old = o.hardware_read_replay(self.asic_ops(), device.dev, pipe)?;
                count += old.len();
                if o.ha_mode() != HaMode::SpecMap {
                    continue;
                }
                let mut map = SpecMap::new(info.kind);
                for entry in old {
                    map.insert_hw(entry.hdl, entry.data)?;
                }
                map.hw_default_set(o.default_get(pipe));
                device.ha.maps.insert((info.handle, pipe), map);
            }
        }
        Ok(count)
    }

    /// Compare what was read back with what was replayed.  The table owners
    /// are left holding the replayed state, and the moves that bring the
    /// hardware in line are kept until `ha_push_delta`.
    pub fn ha_compute_delta(&self, dev: DevId) -> PipeResult<ReconcileReport> {
        let _gate = self.api_gate.lock().unwrap();
        let mut devices = self.devices.lock().unwrap();
        let device = devices.get_mut(&dev).ok_or_else(|| no_device(dev))?;
        phase_check(device, HaPhase::Replaying)?;

        // The delta is pushed in list order, so removals need not wait and
        // the add worklist may reuse the slots the delete worklist frees
        let tables = ha_order(device);
        stage_each(&tables, &device.pipes, |o, pipe| {
            o.stage_begin(pipe, false)
        });
        match self.delta_compute(device, &tables) {
            Ok((delta, report)) => {
                info!(self.log, "computed reconciliation delta";
                    "dev" => dev,
                    "tables" => report.tables.len(),
                    "moves" => report.delta_moves());
                device.ha.delta = delta;
                device.ha.report = Some(report.clone());
                device.ha.maps.clear();
                device.ha.phase = HaPhase::DeltaComputed;
                Ok(report)
            }
            Err(e) => {
                error!(self.log, "reconciliation failed";
                    "dev" => dev, "error" => %e);
                stage_each(&tables, &device.pipes, |o, pipe| {
                    o.stage_revert(pipe)
                });
                device.ha.maps.clear();
                device.ha.phase = HaPhase::Failed;
                Err(e)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn delta_compute(
        &self,
        device: &Device,
        tables: &[TableRef],
    ) -> PipeResult<(Vec<(TblHdl, PipeScope, MoveList)>, ReconcileReport)> {
        let mut delta = Vec::new();
        let mut report = ReconcileReport {
            dev: device.dev,
            tables: Vec::new(),
        };
        for owner in tables {
            let mut o = owner.lock().unwrap();
            let info = o.info().clone();
            for pipe in info.scopes(&device.pipes) {
                let mut tr = TableReport::new(&info, pipe);
                let moves = match o.ha_mode() {
                    HaMode::SpecMap => {
                        let map =
                            device.ha.maps.get(&(info.handle, pipe)).ok_or_else(
                                || {
                                    PipeError::Other(format!(
                                        "table {} ({pipe}) has no spec map",
                                        info.name
                                    ))
                                },
                            )?;
                        tr.classes = map.class_counts();
                        tr.recovered = map.len() - map.list_len(Worklist::Add);
                        let out = reconcile::reconcile(&self.log, &mut **o, pipe, map)?;
                        tr.remapped = out.remapped;
                        tr.added = out.added;
                        tr.modified = out.modified;
                        tr.deleted = out.deleted;
                        tr.default_changed = out.default_changed;
                        tr.mismatches = out.mismatches;
                        out.moves
                    }
                    HaMode::Rewrite => o.ha_delta(pipe)?,
                };
                tr.delta_moves = moves.len();
                delta.push((info.handle, pipe, moves));
                report.tables.push(tr);
            }
        }
        Ok((delta, report))
    }

    /// Push the computed delta to the hardware, and return the device to
    /// normal operation.
    pub fn ha_push_delta(&self, dev: DevId) -> PipeResult<()> {
        let _gate = self.api_gate.lock().unwrap();
        let sref = self.session_get(INTERNAL_SESSION)?;
        let mut guard = sref.lock().unwrap();
        let s = &mut *guard;
        let mut devices = self.devices.lock().unwrap();
        let device = devices.get_mut(&dev).ok_or_else(|| no_device(dev))?;
        phase_check(device, HaPhase::DeltaComputed)?;

        let delta = std::mem::take(&mut device.ha.delta);
        let tables = ha_order(device);
        let result = self.delta_push(s, device, delta);
        self.reservations.lock().unwrap().release_all(INTERNAL_SESSION);
        match result {
            Ok(updates) => {
                stage_each(&tables, &device.pipes, |o, pipe| {
                    o.stage_commit(pipe)
                });
                device.ha.phase = HaPhase::Ready;
                info!(self.log, "device reconciled"; "dev" => dev);
                self.updates_send(updates);
                Ok(())
            }
            Err(e) => {
                error!(self.log, "pushing reconciliation delta failed";
                    "dev" => dev, "error" => %e);
                s.ilog.abort();
                stage_each(&tables, &device.pipes, |o, pipe| {
                    o.stage_revert(pipe)
                });
                device.ha.phase = HaPhase::Failed;
                Err(e)
            }
        }
    }

    fn delta_push(
        &self,
        s: &mut Session,
        device: &Device,
        delta: Vec<(TblHdl, PipeScope, MoveList)>,
    ) -> PipeResult<Vec<TableUpdate>> {
        let mut updates = Vec::new();
        for (tbl, pipe, moves) in delta {
            self.reservations.lock().unwrap().acquire(
                INTERNAL_SESSION,
                device.dev,
                tbl,
                pipe,
            )?;
            updates.extend(moves.updates(device.dev, tbl));
            let owner = device.table(tbl)?;
            let mut ctx = ApplyCtx {
                asic: self.asic_ops(),
                dev: device.dev,
                ilog: &mut s.ilog,
                atomic: false,
            };
            owner.lock().unwrap().apply(&mut ctx, moves)?;
        }
        s.ilog.push(&s.log, self.asic_ops(), true)?;
        for task in BackgroundTask::ALL {
            self.asic_ops().background_set(device.dev, task, true)?;
        }
        Ok(updates)
    }
}

fn phase_check(device: &Device, want: HaPhase) -> PipeResult<()> {
    if device.ha.phase == want {
        Ok(())
    } else {
        Err(PipeError::Invalid(format!(
            "device {} is in HA phase {:?}, not {want:?}",
            device.dev, device.ha.phase
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::move_list::EntrySpec;
    use crate::test_util::*;
    use aal::ActionData;
    use common::PipeStatus;

    const ALL: DevTarget = DevTarget {
        dev: 0,
        pipe: PipeScope::All,
    };

    fn route(dst: u32, port: u16) -> MatEntry {
        MatEntry {
            key: MatchData::exact([("dst", dst)]),
            priority: 0,
            spec: EntrySpec::new(ActionData::new("forward").arg("port", port)),
        }
    }

    #[test]
    fn test_phases_enforced() {
        let mgr = test_mgr();
        mgr.device_add(0, DeviceMode::Hitless).unwrap();
        assert_eq!(mgr.ha_phase(0).unwrap(), HaPhase::AwaitingHwRead);

        let sess = mgr.session_create().unwrap();
        let err = mgr.mat_ent_add(sess, ALL, ROUTE, route(1, 1)).unwrap_err();
        assert_eq!(err.status(), PipeStatus::NotReady);
        assert!(mgr.ha_compute_delta(0).is_err());
        assert!(mgr.ha_push_delta(0).is_err());

        mgr.ha_hw_read_complete(0).unwrap();
        assert_eq!(mgr.ha_phase(0).unwrap(), HaPhase::Replaying);
        mgr.begin_txn(sess, false).unwrap();
        let err = mgr.mat_ent_add(sess, ALL, ROUTE, route(1, 1)).unwrap_err();
        assert_eq!(err.status(), PipeStatus::TxnNotSupported);
    }

    #[test]
    fn test_device_add_twice() {
        let mgr = test_mgr();
        mgr.device_add(0, DeviceMode::Cold).unwrap();
        let err = mgr.device_add(0, DeviceMode::Cold).unwrap_err();
        assert_eq!(err.status(), PipeStatus::AlreadyExists);
        let err = mgr.device_add(5, DeviceMode::Cold).unwrap_err();
        assert_eq!(err.status(), PipeStatus::ObjNotFound);
    }

    #[test]
    fn test_replay_reads_back_replayed_state() {
        let mgr = test_mgr();
        mgr.device_add(0, DeviceMode::Hitless).unwrap();
        mgr.ha_hw_read_complete(0).unwrap();
        let sess = mgr.session_create().unwrap();

        let hdl = mgr.mat_ent_add(sess, ALL, ROUTE, route(1, 1)).unwrap();
        assert_eq!(hdl, 1);
        mgr.mat_ent_modify(sess, ALL, ROUTE, hdl, route(1, 2).spec)
            .unwrap();
        assert_eq!(mgr.mat_ent_get(ALL, ROUTE, hdl).unwrap(), route(1, 2));

        let punt = ActionData::new("punt");
        mgr.mat_default_set(sess, ALL, ROUTE, punt.clone()).unwrap();
        assert_eq!(mgr.mat_default_get(ALL, ROUTE).unwrap(), Some(punt));

        // Nothing reached the hardware
        assert_eq!(mgr.asic().pending_pushes(0).unwrap(), 0);
    }

    #[test]
    fn test_background_tasks_suspended() {
        let mgr = test_mgr();
        mgr.device_add(0, DeviceMode::Hitless).unwrap();
        for task in BackgroundTask::ALL {
            assert!(!mgr.asic().background_get(0, task).unwrap());
        }
        mgr.ha_hw_read_complete(0).unwrap();
        mgr.ha_compute_delta(0).unwrap();
        mgr.ha_push_delta(0).unwrap();
        for task in BackgroundTask::ALL {
            assert!(mgr.asic().background_get(0, task).unwrap());
        }
        assert_eq!(mgr.ha_phase(0).unwrap(), HaPhase::Ready);
    }

    #[test]
    fn test_failed_read_fails_device() {
        let mgr = test_mgr();
        mgr.device_add(0, DeviceMode::Hitless).unwrap();
        mgr.asic().config_update(|c| c.table_read.set(NEXTHOP, 1.0));
        let err = mgr.ha_hw_read_complete(0).unwrap_err();
        assert_eq!(err.status(), PipeStatus::HwCommFail);
        assert_eq!(mgr.ha_phase(0).unwrap(), HaPhase::Failed);
    }
}
