// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Transactions and batches.
//!
//! A transaction holds every move its operations produce until it commits,
//! at which point the moves are applied and pushed together.  An atomic
//! commit additionally flips the pipeline's table version around the
//! change, and holds back every removal until no packet can still be using
//! the old version:
//!
//! ```text
//!   Initial --> VersionUpdate --> Cleanup --> VersionReset --> done
//!      \
//!       `-- (non-atomic) --> done
//! ```
//!
//! Each arrow is taken once the hardware has executed everything pushed in
//! the previous phase.  A batch has no such machinery: its operations are
//! applied as they are made and pushed together when the batch is flushed
//! or ended.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use slog::{debug, error, warn};

use aal::{AsicError, Instr};
use common::{DevId, SessHdl};

use crate::api::no_device;
use crate::session::{CommitPhase, PendingCommit, SessState, Session};
use crate::table::ApplyCtx;
use crate::types::{PipeError, PipeResult};
use crate::{Device, PipeMgr};

impl PipeMgr {
    /// Open a transaction.  Nothing the session does reaches the hardware
    /// until the transaction commits.
    pub fn begin_txn(&self, sess: SessHdl, atomic: bool) -> PipeResult<()> {
        let _gate = self.api_gate.lock().unwrap();
        let sref = self.session_get(sess)?;
        let mut s = sref.lock().unwrap();
        s.check_not_committing()?;
        s.begin_txn(atomic)?;
        debug!(s.log, "transaction opened"; "atomic" => atomic);
        Ok(())
    }

    /// Apply and push everything the open transaction produced.  With
    /// `hw_sync` set, the call returns once the hardware has executed the
    /// whole commit; otherwise the commit finishes in a later call to
    /// `complete_operations`.
    pub fn commit_txn(&self, sess: SessHdl, hw_sync: bool) -> PipeResult<()> {
        let _gate = self.api_gate.lock().unwrap();
        let sref = self.session_get(sess)?;
        let mut guard = sref.lock().unwrap();
        let s = &mut *guard;
        s.check_not_committing()?;
        let SessState::InTxn { atomic } = s.state else {
            return Err(PipeError::Invalid(format!(
                "session {sess} has no transaction open"
            )));
        };

        let devices = self.devices.lock().unwrap();
        if let Err(e) = self.commit_start(s, &devices, atomic) {
            error!(s.log, "transaction commit failed"; "error" => %e);
            if s.commit.is_none() {
                self.txn_discard(s, &devices);
                return Err(e);
            }
            // Some devices took their lists, so the commit goes ahead on
            // those alone
            drop(devices);
            if let Err(drive) = self.commit_drive(s) {
                error!(s.log, "partial commit failed"; "error" => %drive);
            }
            return Err(e);
        }
        drop(devices);

        if hw_sync {
            self.commit_drive(s)?;
        }
        Ok(())
    }

    /// Apply the saved moves, push them, and close every stage the
    /// transaction opened.  If only some devices accept their lists, the
    /// commit is started on those and the stages of the others are
    /// reverted; the push error is still returned.
    fn commit_start(
        &self,
        s: &mut Session,
        devices: &BTreeMap<DevId, Device>,
        atomic: bool,
    ) -> PipeResult<()> {
        let saved = std::mem::take(&mut s.saved);
        let mut updates = Vec::new();
        let mut pushed = BTreeSet::new();
        let mut moves = 0;
        for ((dev, tbl), list) in saved {
            let device = devices.get(&dev).ok_or_else(|| no_device(dev))?;
            moves += list.len();
            updates.extend(list.updates(dev, tbl));
            if device.virtual_device {
                continue;
            }
            let owner = device.table(tbl)?;
            let mut ctx = ApplyCtx {
                asic: self.asic_ops(),
                dev,
                ilog: &mut s.ilog,
                atomic,
            };
            owner.lock().unwrap().apply(&mut ctx, list)?;
            pushed.insert(dev);
        }
        let failure = match s.ilog.push(&s.log, self.asic_ops(), false) {
            Ok(_) => None,
            Err(partial) if partial.pushed.is_empty() => {
                return Err(partial.into())
            }
            Err(partial) => {
                warn!(s.log, "device refused its part of the commit";
                    "dev" => partial.dev,
                    "accepted" => partial.pushed.len());
                s.ilog.retain_devices(&partial.pushed);
                Some(partial)
            }
        };
        // Devices that took nothing keep their pre-transaction state
        let refused: BTreeSet<DevId> = match &failure {
            Some(p) => pushed
                .iter()
                .copied()
                .filter(|dev| !p.pushed.contains_key(dev))
                .collect(),
            None => BTreeSet::new(),
        };
        pushed.retain(|dev| !refused.contains(dev));
        updates.retain(|u| !refused.contains(&u.dev));

        for (dev, tbl, pipe) in std::mem::take(&mut s.touched) {
            let owner = devices.get(&dev).and_then(|d| d.tables.get(&tbl));
            if let Some(owner) = owner {
                let mut o = owner.lock().unwrap();
                if refused.contains(&dev) {
                    o.stage_revert(pipe);
                } else {
                    o.stage_commit(pipe);
                }
            }
        }
        debug!(s.log, "transaction committing";
            "atomic" => atomic, "moves" => moves, "devices" => pushed.len());
        s.commit = Some(PendingCommit {
            atomic,
            phase: CommitPhase::Initial,
            devices: pushed,
            updates,
        });
        match failure {
            Some(p) => Err(p.err),
            None => Ok(()),
        }
    }

    /// Run a pending commit through its remaining phases.  A failure at any
    /// phase abandons the commit and returns the session to idle.
    fn commit_drive(&self, s: &mut Session) -> PipeResult<()> {
        match self.commit_phases(s) {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(s.log, "transaction commit abandoned"; "error" => %e);
                s.reset();
                self.reservations.lock().unwrap().release_all(s.hdl);
                Err(e)
            }
        }
    }

    fn commit_phases(&self, s: &mut Session) -> PipeResult<()> {
        let asic = self.asic_ops();
        loop {
            let Some(commit) = s.commit.as_mut() else {
                return Ok(());
            };
            let devs: Vec<DevId> = commit.devices.iter().copied().collect();
            for dev in &devs {
                asic.complete_operations(*dev)?;
            }

            let next = match (commit.phase, commit.atomic) {
                (CommitPhase::Initial, false) | (CommitPhase::VersionReset, _) => {
                    None
                }
                (CommitPhase::Initial, true) => {
                    for dev in &devs {
                        asic.ilist_push(*dev, vec![Instr::VersionBump])?;
                    }
                    Some(CommitPhase::VersionUpdate)
                }
                (CommitPhase::VersionUpdate, _) => {
                    self.drain_wait(&devs)?;
                    for (dev, instrs) in s.ilog.take_cleanup() {
                        if !instrs.is_empty() {
                            asic.ilist_push(dev, instrs)?;
                        }
                    }
                    Some(CommitPhase::Cleanup)
                }
                (CommitPhase::Cleanup, _) => {
                    for dev in &devs {
                        asic.ilist_push(*dev, vec![Instr::VersionReset])?;
                    }
                    Some(CommitPhase::VersionReset)
                }
            };

            match next {
                Some(phase) => {
                    debug!(s.log, "commit phase"; "phase" => ?phase);
                    commit.phase = phase;
                }
                None => {
                    let updates = std::mem::take(&mut commit.updates);
                    s.commit = None;
                    s.state = SessState::Idle;
                    self.reservations.lock().unwrap().release_all(s.hdl);
                    debug!(s.log, "transaction committed";
                        "updates" => updates.len());
                    self.updates_send(updates);
                    return Ok(());
                }
            }
        }
    }

    /// Wait for packets still using the previous table version to leave the
    /// pipeline.
    fn drain_wait(&self, devs: &[DevId]) -> PipeResult<()> {
        for dev in devs {
            let mut polls = 0;
            while self.asic_ops().inflight_pkts(*dev)? > 0 {
                polls += 1;
                if polls >= self.config.atomic_drain_polls {
                    return Err(PipeError::Switch(AsicError::DriverError {
                        ctx: format!("device {dev} version drain"),
                        err: format!("packets still in flight after {polls} polls"),
                    }));
                }
            }
        }
        Ok(())
    }

    /// Throw away everything the open transaction did.
    pub fn abort_txn(&self, sess: SessHdl) -> PipeResult<()> {
        let _gate = self.api_gate.lock().unwrap();
        let sref = self.session_get(sess)?;
        let mut guard = sref.lock().unwrap();
        let s = &mut *guard;
        s.check_not_committing()?;
        if !s.in_txn() {
            return Err(PipeError::Invalid(format!(
                "session {sess} has no transaction open"
            )));
        }
        let devices = self.devices.lock().unwrap();
        self.txn_discard(s, &devices);
        Ok(())
    }

    /// Revert every stage the transaction opened, drop its saved moves and
    /// reservations, and return the session to idle.
    pub(crate) fn txn_discard(
        &self,
        s: &mut Session,
        devices: &BTreeMap<DevId, Device>,
    ) {
        let moves: usize = s.saved.values().map(|l| l.len()).sum();
        for (dev, tbl, pipe) in &s.touched {
            if let Some(owner) = devices.get(dev).and_then(|d| d.tables.get(tbl))
            {
                owner.lock().unwrap().stage_revert(*pipe);
            }
        }
        s.reset();
        self.reservations.lock().unwrap().release_all(s.hdl);
        debug!(s.log, "transaction discarded"; "moves" => moves);
    }

    /// Open a batch.  Operations inside it are applied as they are made but
    /// only pushed when the batch is flushed or ended.
    pub fn begin_batch(&self, sess: SessHdl) -> PipeResult<()> {
        let _gate = self.api_gate.lock().unwrap();
        let sref = self.session_get(sess)?;
        let mut s = sref.lock().unwrap();
        s.check_not_committing()?;
        s.begin_batch()?;
        debug!(s.log, "batch opened");
        Ok(())
    }

    /// Push what the batch has accumulated so far, leaving the batch open.
    pub fn flush_batch(&self, sess: SessHdl) -> PipeResult<()> {
        let _gate = self.api_gate.lock().unwrap();
        let sref = self.session_get(sess)?;
        let mut guard = sref.lock().unwrap();
        let s = &mut *guard;
        if !s.in_batch() {
            return Err(PipeError::Invalid(format!(
                "session {sess} has no batch open"
            )));
        }
        let sync = s.sync;
        s.ilog.push(&s.log, self.asic_ops(), sync)?;
        Ok(())
    }

    /// Push what remains of the batch and close it.  If any operation in the
    /// batch failed, the first failure is reported here.
    pub fn end_batch(&self, sess: SessHdl, hw_sync: bool) -> PipeResult<()> {
        let _gate = self.api_gate.lock().unwrap();
        let sref = self.session_get(sess)?;
        let mut guard = sref.lock().unwrap();
        let s = &mut *guard;
        if !s.in_batch() {
            return Err(PipeError::Invalid(format!(
                "session {sess} has no batch open"
            )));
        }
        let sync = hw_sync || s.sync;
        let pushed = s.ilog.push(&s.log, self.asic_ops(), sync);
        s.ilog.abort();
        s.state = SessState::Idle;
        self.reservations.lock().unwrap().release_all(sess);
        let batch_error = s.batch_error.take();
        debug!(s.log, "batch ended"; "failed" => batch_error.is_some());

        pushed?;
        match batch_error {
            Some((status, detail)) => Err(PipeError::Deferred { status, detail }),
            None => Ok(()),
        }
    }

    /// Wait for the hardware to execute everything the session pushed.  A
    /// pending commit is driven to completion.
    pub fn complete_operations(&self, sess: SessHdl) -> PipeResult<()> {
        let _gate = self.api_gate.lock().unwrap();
        let sref = self.session_get(sess)?;
        let mut guard = sref.lock().unwrap();
        let s = &mut *guard;
        if s.commit.is_some() {
            return self.commit_drive(s);
        }
        let devs: Vec<DevId> = self
            .devices
            .lock()
            .unwrap()
            .values()
            .filter(|d| !d.virtual_device)
            .map(|d| d.dev)
            .collect();
        for dev in devs {
            self.asic_ops().complete_operations(dev)?;
        }
        Ok(())
    }
}
