// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The per-session log of hardware instructions waiting to be pushed.

use std::collections::BTreeMap;

use slog::debug;

use aal::{AsicOps, Instr, PushId};
use common::DevId;

use crate::types::PipeError;

/// Which part of the log an instruction belongs in.  The cleanup section is
/// only pushed by an atomic commit, once no packet can still be using the
/// state it removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Main,
    Cleanup,
}

/// A push that failed part way through.  The devices in `pushed` accepted
/// their lists before `dev` refused its own.
#[derive(Debug)]
pub struct PartialPush {
    pub pushed: BTreeMap<DevId, PushId>,
    pub dev: DevId,
    pub err: PipeError,
}

impl From<PartialPush> for PipeError {
    fn from(p: PartialPush) -> Self {
        p.err
    }
}

#[derive(Debug, Default)]
pub struct InstrLog {
    main: BTreeMap<DevId, Vec<Instr>>,
    cleanup: BTreeMap<DevId, Vec<Instr>>,
    checkpoint: Option<BTreeMap<DevId, (usize, usize)>>,
}

impl InstrLog {
    pub fn new() -> Self {
        InstrLog::default()
    }

    pub fn append(&mut self, dev: DevId, section: Section, instr: Instr) {
        let log = match section {
            Section::Main => &mut self.main,
            Section::Cleanup => &mut self.cleanup,
        };
        log.entry(dev).or_default().push(instr);
    }

    /// Remember the current length of the log, so a later failure can
    /// discard only what came after this point.
    pub fn checkpoint(&mut self) {
        let mut mark = BTreeMap::new();
        for dev in self.main.keys().chain(self.cleanup.keys()) {
            mark.insert(
                *dev,
                (
                    self.main.get(dev).map_or(0, |v| v.len()),
                    self.cleanup.get(dev).map_or(0, |v| v.len()),
                ),
            );
        }
        self.checkpoint = Some(mark);
    }

    /// Discard everything appended since the last checkpoint, or everything
    /// if there is no checkpoint.
    pub fn rollback(&mut self) {
        let Some(mark) = self.checkpoint.clone() else {
            self.abort();
            return;
        };
        for (dev, instrs) in self.main.iter_mut() {
            instrs.truncate(mark.get(dev).map_or(0, |m| m.0));
        }
        for (dev, instrs) in self.cleanup.iter_mut() {
            instrs.truncate(mark.get(dev).map_or(0, |m| m.1));
        }
    }

    /// Discard the whole log.
    pub fn abort(&mut self) {
        self.main.clear();
        self.cleanup.clear();
        self.checkpoint = None;
    }

    pub fn is_empty(&self) -> bool {
        self.main.values().all(|v| v.is_empty())
            && self.cleanup.values().all(|v| v.is_empty())
    }

    /// Remove the cleanup section, leaving the main section in place.
    pub fn take_cleanup(&mut self) -> BTreeMap<DevId, Vec<Instr>> {
        std::mem::take(&mut self.cleanup)
    }

    /// Drop everything logged for devices other than those in `keep`.
    pub fn retain_devices(&mut self, keep: &BTreeMap<DevId, PushId>) {
        self.main.retain(|dev, _| keep.contains_key(dev));
        self.cleanup.retain(|dev, _| keep.contains_key(dev));
    }

    /// Hand the main section to the hardware, one list per device.  The
    /// cleanup section is left in the log.  Returns the id of each list
    /// pushed; with `sync` set, returns only once the device has executed
    /// them all.  On failure the lists already accepted stay with the
    /// hardware, and the error names them.
    pub fn push(
        &mut self,
        log: &slog::Logger,
        asic: &dyn AsicOps,
        sync: bool,
    ) -> Result<BTreeMap<DevId, PushId>, PartialPush> {
        self.checkpoint = None;
        let main = std::mem::take(&mut self.main);
        let mut pushed = BTreeMap::new();
        for (dev, instrs) in main {
            if instrs.is_empty() {
                continue;
            }
            let count = instrs.len();
            let id = match asic.ilist_push(dev, instrs) {
                Ok(id) => id,
                Err(e) => {
                    return Err(PartialPush {
                        pushed,
                        dev,
                        err: e.into(),
                    })
                }
            };
            debug!(log, "pushed instruction list";
                "dev" => dev, "push" => id, "instrs" => count, "sync" => sync);
            pushed.insert(dev, id);
        }
        if sync {
            for dev in pushed.keys().copied().collect::<Vec<_>>() {
                if let Err(e) = asic.complete_operations(dev) {
                    return Err(PartialPush {
                        pushed,
                        dev,
                        err: e.into(),
                    });
                }
            }
        }
        Ok(pushed)
    }
}
