// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Per-client session state.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::Logger;

use common::table::TblHdl;
use common::{DevId, PipeScope, PipeStatus, SessHdl};

use crate::ilist::InstrLog;
use crate::move_list::{MoveList, TableUpdate};
use crate::types::{PipeError, PipeResult};

/// The session used by the pipeline manager itself, e.g. to push the
/// reconciliation delta of a restarting device.  It is never handed to a
/// client.
pub const INTERNAL_SESSION: SessHdl = 0;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum SessState {
    Idle,
    InTxn { atomic: bool },
    InBatch,
}

/// The steps of a transaction commit.  A non-atomic commit only passes
/// through `Initial`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum CommitPhase {
    /// The transaction's instructions have been pushed
    Initial,
    /// The table-version bump has been pushed
    VersionUpdate,
    /// The deferred removals have been pushed
    Cleanup,
    /// The version reset has been pushed
    VersionReset,
}

/// A commit whose hardware work has not yet finished.
#[derive(Debug)]
pub struct PendingCommit {
    pub atomic: bool,
    pub phase: CommitPhase,
    /// The devices the commit pushed instructions to
    pub devices: BTreeSet<DevId>,
    /// Notifications to send once the commit completes
    pub updates: Vec<TableUpdate>,
}

pub struct Session {
    pub hdl: SessHdl,
    pub log: Logger,
    pub state: SessState,
    /// Whether each push waits for the device to execute it
    pub sync: bool,
    /// Moves produced inside the open transaction, per table
    pub saved: BTreeMap<(DevId, TblHdl), MoveList>,
    /// Table instances with a stage open on behalf of this session
    pub touched: BTreeSet<(DevId, TblHdl, PipeScope)>,
    pub ilog: InstrLog,
    /// The first failure seen inside the open batch
    pub batch_error: Option<(PipeStatus, String)>,
    pub commit: Option<PendingCommit>,
}

impl Session {
    pub fn new(log: Logger, hdl: SessHdl, sync: bool) -> Self {
        Session {
            hdl,
            log,
            state: SessState::Idle,
            sync,
            saved: BTreeMap::new(),
            touched: BTreeSet::new(),
            ilog: InstrLog::new(),
            batch_error: None,
            commit: None,
        }
    }

    pub fn in_txn(&self) -> bool {
        matches!(self.state, SessState::InTxn { .. })
    }

    pub fn in_batch(&self) -> bool {
        self.state == SessState::InBatch
    }

    pub fn is_atomic(&self) -> bool {
        self.state == SessState::InTxn { atomic: true }
    }

    fn check_idle(&self) -> PipeResult<()> {
        match self.state {
            SessState::Idle => Ok(()),
            SessState::InTxn { .. } => Err(PipeError::Exists(format!(
                "session {} already has a transaction open",
                self.hdl
            ))),
            SessState::InBatch => Err(PipeError::Exists(format!(
                "session {} already has a batch open",
                self.hdl
            ))),
        }
    }

    /// Refuse any change while an earlier commit is still in flight.
    pub fn check_not_committing(&self) -> PipeResult<()> {
        match self.commit {
            Some(ref c) => Err(PipeError::Busy(format!(
                "session {} is committing ({:?})",
                self.hdl, c.phase
            ))),
            None => Ok(()),
        }
    }

    pub fn begin_txn(&mut self, atomic: bool) -> PipeResult<()> {
        self.check_idle()?;
        self.state = SessState::InTxn { atomic };
        Ok(())
    }

    pub fn begin_batch(&mut self) -> PipeResult<()> {
        self.check_idle()?;
        self.state = SessState::InBatch;
        self.batch_error = None;
        Ok(())
    }

    /// Remember a failure seen inside a batch.  Only the first is kept.
    pub fn batch_error_record(&mut self, err: &PipeError) {
        if self.batch_error.is_none() {
            self.batch_error = Some((err.status(), err.to_string()));
        }
    }

    /// Drop all transaction and batch state, returning the session to idle.
    pub fn reset(&mut self) {
        self.state = SessState::Idle;
        self.saved.clear();
        self.touched.clear();
        self.ilog.abort();
        self.commit = None;
    }
}
