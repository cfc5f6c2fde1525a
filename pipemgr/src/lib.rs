// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The pipeline-table manager.
//!
//! `PipeMgr` owns the logical model of every table compiled into a switch
//! pipeline and turns client mutations into ordered hardware instructions.
//! Clients work through sessions: each mutation runs immediately, inside a
//! batch that is flushed as a unit, or inside a transaction that only
//! reaches the hardware when it commits.  After a restart, a device can be
//! brought back without disturbing traffic by reading its tables back from
//! the hardware, replaying the desired configuration, and pushing only the
//! difference.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use slog::{debug, info, o};
use tokio::sync::mpsc::UnboundedSender;

use aal::AsicOps;
use common::table::TblHdl;
use common::{DevId, PipeId, SessHdl};

use crate::config::Config;
use crate::move_list::TableUpdate;
use crate::reservation::Reservations;
use crate::session::{Session, INTERNAL_SESSION};
use crate::table::TableRef;
use crate::types::{PipeError, PipeResult};

pub mod api;
pub mod config;
pub mod ha;
mod ilist;
pub mod move_list;
mod reservation;
pub mod session;
pub mod table;
pub mod txn;
pub mod types;

/// A device known to the pipeline manager.
pub struct Device {
    pub dev: DevId,
    pub pipes: Vec<PipeId>,
    /// Virtual devices keep table state in software only
    pub virtual_device: bool,
    pub tables: BTreeMap<TblHdl, TableRef>,
    pub ha: ha::HaState,
}

impl Device {
    pub fn table(&self, tbl: TblHdl) -> PipeResult<TableRef> {
        self.tables
            .get(&tbl)
            .cloned()
            .ok_or(PipeError::NoSuchTable(tbl))
    }
}

pub type SessionRef = Arc<Mutex<Session>>;

/// The pipeline manager's context.  Everything it manages is reached through
/// this object; lock acquisition follows the order in which the fields are
/// declared, from the API gate down to the per-table owners held by each
/// device.
pub struct PipeMgr {
    pub log: slog::Logger,
    pub config: Config,
    asic_hdl: asic::Handle,
    api_gate: Mutex<()>,
    sessions: Mutex<BTreeMap<SessHdl, SessionRef>>,
    devices: Mutex<BTreeMap<DevId, Device>>,
    reservations: Mutex<Reservations>,
    updates: Mutex<BTreeMap<TblHdl, Vec<UnboundedSender<TableUpdate>>>>,
}

impl PipeMgr {
    pub fn new(log: slog::Logger, config: Config) -> PipeResult<Self> {
        let asic_hdl = asic::Handle::new(&log, &config.asic)?;
        PipeMgr::with_handle(log, config, asic_hdl)
    }

    /// Build a manager from its config, logging where the config says.
    pub fn start(config: Config) -> PipeResult<Self> {
        let log = common::logging::init(
            "pipemgr",
            &config.log_file,
            config.log_format,
        )?;
        PipeMgr::new(log, config)
    }

    /// Build a manager around an existing ASIC handle.  This is how a
    /// restarted control plane picks up a device that kept running.
    pub fn with_handle(
        log: slog::Logger,
        config: Config,
        asic_hdl: asic::Handle,
    ) -> PipeResult<Self> {
        config.validate()?;
        let log = log.new(o!("unit" => "pipemgr"));
        let internal = Session::new(
            log.new(o!("session" => INTERNAL_SESSION)),
            INTERNAL_SESSION,
            true,
        );
        info!(log, "pipeline manager initialized";
            "tables" => config.tables.len(),
            "devices" => config.devices.len());

        Ok(PipeMgr {
            log,
            config,
            asic_hdl,
            api_gate: Mutex::new(()),
            sessions: Mutex::new(BTreeMap::from([(
                INTERNAL_SESSION,
                Arc::new(Mutex::new(internal)),
            )])),
            devices: Mutex::new(BTreeMap::new()),
            reservations: Mutex::new(Reservations::new()),
            updates: Mutex::new(BTreeMap::new()),
        })
    }

    /// Tear down the manager, handing back the ASIC handle.  Devices are
    /// left running in whatever state they were last programmed to.
    pub fn fini(self) -> asic::Handle {
        info!(self.log, "pipeline manager shutting down");
        self.asic_hdl
    }

    pub fn asic(&self) -> &asic::Handle {
        &self.asic_hdl
    }

    pub(crate) fn asic_ops(&self) -> &dyn AsicOps {
        &self.asic_hdl
    }

    /// Open a new client session.
    pub fn session_create(&self) -> PipeResult<SessHdl> {
        let mut sessions = self.sessions.lock().unwrap();
        // The internal session doesn't count against the limit
        let open = sessions.len() as u32 - 1;
        if open >= self.config.max_sessions {
            return Err(PipeError::TooManySessions(self.config.max_sessions));
        }
        let hdl = (1..=SessHdl::MAX)
            .find(|h| !sessions.contains_key(h))
            .ok_or(PipeError::TooManySessions(self.config.max_sessions))?;
        let session = Session::new(
            self.log.new(o!("session" => hdl)),
            hdl,
            self.config.sync_push,
        );
        sessions.insert(hdl, Arc::new(Mutex::new(session)));
        debug!(self.log, "created session"; "session" => hdl);
        Ok(hdl)
    }

    /// Close a session.  An open transaction is aborted, and an open batch
    /// is ended, before its reservations are released.
    pub fn session_destroy(&self, sess: SessHdl) -> PipeResult<()> {
        if sess == INTERNAL_SESSION {
            return Err(PipeError::Invalid(
                "the internal session cannot be destroyed".into(),
            ));
        }
        let (in_txn, in_batch, committing) = {
            let s = self.session_get(sess)?;
            let s = s.lock().unwrap();
            (s.in_txn(), s.in_batch(), s.commit.is_some())
        };
        if committing {
            self.complete_operations(sess)?;
        } else if in_txn {
            self.abort_txn(sess)?;
        } else if in_batch {
            if let Err(e) = self.end_batch(sess, true) {
                debug!(self.log, "batch ended with error at session close";
                    "session" => sess, "error" => %e);
            }
        }

        let _gate = self.api_gate.lock().unwrap();
        self.reservations.lock().unwrap().release_all(sess);
        self.sessions.lock().unwrap().remove(&sess);
        debug!(self.log, "destroyed session"; "session" => sess);
        Ok(())
    }

    /// Choose whether the session's pushes wait for the hardware.
    pub fn session_sync_set(&self, sess: SessHdl, sync: bool) -> PipeResult<()> {
        let s = self.session_get(sess)?;
        s.lock().unwrap().sync = sync;
        Ok(())
    }

    pub(crate) fn session_get(&self, sess: SessHdl) -> PipeResult<SessionRef> {
        self.sessions
            .lock()
            .unwrap()
            .get(&sess)
            .cloned()
            .ok_or(PipeError::NoSuchSession(sess))
    }

    /// Register a channel on which to receive a notification for every
    /// change applied to a table.
    pub fn table_register_updates(
        &self,
        tbl: TblHdl,
        tx: UnboundedSender<TableUpdate>,
    ) -> PipeResult<()> {
        if !self.config.tables.iter().any(|t| t.handle == tbl) {
            return Err(PipeError::NoSuchTable(tbl));
        }
        self.updates.lock().unwrap().entry(tbl).or_default().push(tx);
        Ok(())
    }

    pub(crate) fn updates_send(&self, updates: Vec<TableUpdate>) {
        if updates.is_empty() {
            return;
        }
        let mut handlers = self.updates.lock().unwrap();
        for update in updates {
            if let Some(txs) = handlers.get_mut(&update.tbl) {
                // Receivers that have gone away are dropped
                txs.retain(|tx| tx.send(update).is_ok());
            }
        }
    }
}
