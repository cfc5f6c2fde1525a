// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use slog::{debug, info, o, Logger};

use aal::{
    ActionData, AsicError, AsicOps, AsicResult, BackgroundTask, HwMatEntry,
    HwRecord, HwSelMember, Instr, PushId,
};
use common::table::TblHdl;
use common::{DevId, PipeId, PipeScope};

use crate::chaos::{table_unfurl, unfurl};
use crate::AsicConfig;

/// The memories backing one table in one pipe scope.
#[derive(Debug, Default, Clone)]
struct HwTable {
    mat: BTreeMap<u32, HwMatEntry>,
    default: Option<ActionData>,
    adt: BTreeMap<u32, ActionData>,
    groups: BTreeMap<u32, (u32, Vec<HwSelMember>)>,
    fallback: Option<u32>,
}

impl HwTable {
    fn records(&self) -> Vec<HwRecord> {
        let mut out = Vec::new();
        if let Some(action) = &self.default {
            out.push(HwRecord::MatDefault {
                action: action.clone(),
            });
        }
        out.extend(self.mat.iter().map(|(index, entry)| HwRecord::Mat {
            index: *index,
            entry: entry.clone(),
        }));
        out.extend(self.adt.iter().map(|(index, action)| HwRecord::Adt {
            index: *index,
            action: action.clone(),
        }));
        out.extend(self.groups.iter().map(|(group, (max_size, members))| {
            HwRecord::SelGroup {
                group: *group,
                max_size: *max_size,
                members: members.clone(),
            }
        }));
        if let Some(member) = self.fallback {
            out.push(HwRecord::SelFallback { member });
        }
        out
    }
}

struct Device {
    pipes: Vec<PipeId>,
    tables: BTreeMap<(TblHdl, PipeScope), HwTable>,
    queue: VecDeque<(PushId, Vec<Instr>)>,
    next_push: PushId,
    version: u8,
    inflight_polls: u32,
    background: BTreeMap<BackgroundTask, bool>,
    executed: u64,
}

impl Device {
    fn new(pipes: &[PipeId]) -> Self {
        Device {
            pipes: pipes.to_vec(),
            tables: BTreeMap::new(),
            queue: VecDeque::new(),
            next_push: 1,
            version: 0,
            inflight_polls: 0,
            background: BackgroundTask::ALL
                .iter()
                .map(|t| (*t, true))
                .collect(),
            executed: 0,
        }
    }

    fn check_pipe(&self, pipe: PipeScope) -> AsicResult<()> {
        match pipe {
            PipeScope::All => Ok(()),
            PipeScope::Pipe(p) if self.pipes.contains(&p) => Ok(()),
            PipeScope::Pipe(p) => {
                Err(AsicError::InvalidArg(format!("no such pipe: {p}")))
            }
        }
    }

    fn table(&mut self, tbl: TblHdl, pipe: PipeScope) -> &mut HwTable {
        self.tables.entry((tbl, pipe)).or_default()
    }

    fn execute(&mut self, instr: Instr, drain_polls: u32) -> AsicResult<()> {
        self.executed += 1;
        match instr {
            Instr::MatWrite {
                tbl,
                pipe,
                index,
                entry,
            } => {
                self.table(tbl, pipe).mat.insert(index, entry);
            }
            Instr::MatUpdate {
                tbl,
                pipe,
                index,
                action,
                ttl,
                resources,
            } => {
                let entry =
                    self.table(tbl, pipe).mat.get_mut(&index).ok_or_else(
                        || AsicError::Missing(format!("{tbl}/{pipe}/{index}")),
                    )?;
                entry.action = action;
                entry.ttl = ttl;
                entry.resources = resources;
            }
            Instr::MatClear { tbl, pipe, index } => {
                self.table(tbl, pipe).mat.remove(&index);
            }
            Instr::MatDefault { tbl, pipe, action } => {
                self.table(tbl, pipe).default = action;
            }
            Instr::AdtWrite {
                tbl,
                pipe,
                index,
                action,
            } => {
                self.table(tbl, pipe).adt.insert(index, action);
            }
            Instr::AdtClear { tbl, pipe, index } => {
                self.table(tbl, pipe).adt.remove(&index);
            }
            Instr::SelWrite {
                tbl,
                pipe,
                group,
                max_size,
                members,
            } => {
                self.table(tbl, pipe)
                    .groups
                    .insert(group, (max_size, members));
            }
            Instr::SelClear { tbl, pipe, group } => {
                self.table(tbl, pipe).groups.remove(&group);
            }
            Instr::SelFallback { tbl, pipe, member } => {
                self.table(tbl, pipe).fallback = member;
            }
            Instr::VersionBump => {
                self.version ^= 1;
                self.inflight_polls = drain_polls;
            }
            Instr::VersionReset => {
                self.version = 0;
            }
        }
        Ok(())
    }
}

/// A handle for a model ASIC.
pub struct Handle {
    config: Mutex<AsicConfig>,
    log: Logger,
    devices: Mutex<BTreeMap<DevId, Device>>,
}

impl Handle {
    /// Create a new model ASIC with the provided logger and config.
    pub fn new(log: &Logger, config: &AsicConfig) -> AsicResult<Self> {
        Ok(Handle {
            config: Mutex::new(config.clone()),
            log: log.new(o!("unit" => "asic")),
            devices: Mutex::new(BTreeMap::new()),
        })
    }

    /// Model ASICs always report as a model.
    pub fn is_model(&self) -> bool {
        true
    }

    /// Adjust the fault-injection settings of a running model.
    pub fn config_update<F>(&self, f: F)
    where
        F: FnOnce(&mut AsicConfig),
    {
        f(&mut self.config.lock().unwrap())
    }

    /// The number of instructions the device has executed since it was
    /// last cold-added.
    pub fn instr_count(&self, dev: DevId) -> AsicResult<u64> {
        self.with_device(dev, |d| Ok(d.executed))
    }

    /// The number of instruction lists pushed but not yet executed.
    pub fn pending_pushes(&self, dev: DevId) -> AsicResult<usize> {
        self.with_device(dev, |d| Ok(d.queue.len()))
    }

    /// Report whether a background task is currently running.
    pub fn background_get(
        &self,
        dev: DevId,
        task: BackgroundTask,
    ) -> AsicResult<bool> {
        self.with_device(dev, |d| {
            Ok(d.background.get(&task).copied().unwrap_or(false))
        })
    }

    fn with_device<T, F>(&self, dev: DevId, f: F) -> AsicResult<T>
    where
        F: FnOnce(&mut Device) -> AsicResult<T>,
    {
        let mut devices = self.devices.lock().unwrap();
        let device = devices.get_mut(&dev).ok_or(AsicError::NoDevice(dev))?;
        f(device)
    }
}

impl AsicOps for Handle {
    fn device_add(
        &self,
        dev: DevId,
        pipes: &[PipeId],
        cold: bool,
    ) -> AsicResult<()> {
        let mut devices = self.devices.lock().unwrap();
        match devices.get_mut(&dev) {
            Some(device) if !cold => {
                info!(self.log, "warm add of device {dev}";
                    "tables" => device.tables.len());
                if device.pipes != pipes {
                    return Err(AsicError::InvalidArg(format!(
                        "device {dev} pipe set changed across a warm add"
                    )));
                }
                // Anything still queued belonged to the previous owner.
                device.queue.clear();
            }
            _ => {
                info!(self.log, "cold add of device {dev}"; "pipes" => pipes.len());
                devices.insert(dev, Device::new(pipes));
            }
        }
        Ok(())
    }

    fn device_remove(&self, dev: DevId) -> AsicResult<()> {
        self.devices
            .lock()
            .unwrap()
            .remove(&dev)
            .map(|_| ())
            .ok_or(AsicError::NoDevice(dev))
    }

    fn instr_encode(&self, dev: DevId, instr: &Instr) -> AsicResult<()> {
        self.with_device(dev, |d| match instr {
            Instr::MatWrite { pipe, .. }
            | Instr::MatUpdate { pipe, .. }
            | Instr::MatClear { pipe, .. }
            | Instr::MatDefault { pipe, .. }
            | Instr::AdtWrite { pipe, .. }
            | Instr::AdtClear { pipe, .. }
            | Instr::SelWrite { pipe, .. }
            | Instr::SelClear { pipe, .. }
            | Instr::SelFallback { pipe, .. } => d.check_pipe(*pipe),
            Instr::VersionBump | Instr::VersionReset => Ok(()),
        })?;

        match instr {
            Instr::MatWrite { tbl, .. } => table_unfurl!(self, *tbl, mat_write),
            Instr::MatUpdate { tbl, .. } => {
                table_unfurl!(self, *tbl, mat_update)
            }
            Instr::MatClear { tbl, .. } => table_unfurl!(self, *tbl, mat_clear),
            Instr::MatDefault { tbl, .. } => {
                table_unfurl!(self, *tbl, mat_default)
            }
            Instr::AdtWrite { tbl, .. } => table_unfurl!(self, *tbl, adt_write),
            Instr::AdtClear { tbl, .. } => table_unfurl!(self, *tbl, adt_clear),
            Instr::SelWrite { tbl, .. } => table_unfurl!(self, *tbl, sel_write),
            Instr::SelClear { tbl, .. } => table_unfurl!(self, *tbl, sel_clear),
            Instr::SelFallback { tbl, .. } => {
                table_unfurl!(self, *tbl, sel_fallback)
            }
            Instr::VersionBump | Instr::VersionReset => {}
        }
        Ok(())
    }

    fn ilist_push(&self, dev: DevId, instrs: Vec<Instr>) -> AsicResult<PushId> {
        unfurl!(self, ilist_push);
        self.config
            .lock()
            .unwrap()
            .ilist_push_dev
            .unfurled(&self.log, dev, "ilist_push")?;
        self.with_device(dev, |d| {
            let id = d.next_push;
            d.next_push += 1;
            debug!(self.log, "ilist pushed";
                "dev" => dev, "push" => id, "instrs" => instrs.len());
            d.queue.push_back((id, instrs));
            Ok(id)
        })
    }

    fn complete_operations(&self, dev: DevId) -> AsicResult<Vec<PushId>> {
        unfurl!(self, complete_operations);
        let drain_polls = self.config.lock().unwrap().inflight_drain_polls;
        self.with_device(dev, |d| {
            let mut done = Vec::new();
            while let Some((id, instrs)) = d.queue.pop_front() {
                for instr in instrs {
                    d.execute(instr, drain_polls)?;
                }
                done.push(id);
            }
            Ok(done)
        })
    }

    fn version_get(&self, dev: DevId) -> AsicResult<u8> {
        self.with_device(dev, |d| Ok(d.version))
    }

    fn inflight_pkts(&self, dev: DevId) -> AsicResult<u64> {
        self.with_device(dev, |d| {
            if d.inflight_polls > 0 {
                d.inflight_polls -= 1;
                Ok(d.inflight_polls as u64 + 1)
            } else {
                Ok(0)
            }
        })
    }

    fn table_read(
        &self,
        dev: DevId,
        tbl: TblHdl,
        pipe: PipeScope,
    ) -> AsicResult<Vec<HwRecord>> {
        table_unfurl!(self, tbl, table_read);
        self.with_device(dev, |d| {
            d.check_pipe(pipe)?;
            Ok(d
                .tables
                .get(&(tbl, pipe))
                .map(|t| t.records())
                .unwrap_or_default())
        })
    }

    fn background_set(
        &self,
        dev: DevId,
        task: BackgroundTask,
        enabled: bool,
    ) -> AsicResult<()> {
        self.with_device(dev, |d| {
            debug!(self.log, "background task {task:?} enabled: {enabled}";
                "dev" => dev);
            d.background.insert(task, enabled);
            Ok(())
        })
    }
}
