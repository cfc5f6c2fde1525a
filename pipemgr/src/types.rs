// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! General types used throughout the pipeline manager.

use std::convert;

use aal::AsicError;
use common::table::TblHdl;
use common::{PipeScope, PipeStatus, SessHdl};

pub type PipeResult<T> = Result<T, PipeError>;

#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    #[error("I/O error: {0:?}")]
    Io(std::io::Error),
    #[error("ASIC error: {0:?}")]
    Switch(AsicError),
    #[error("Resource already exists: {0}")]
    Exists(String),
    #[error("Resource is busy: {0}")]
    Busy(String),
    #[error("Resource is missing: {0}")]
    Missing(String),
    #[error("Invalid argument: {0}")]
    Invalid(String),
    #[error("Table {0} is full")]
    TableFull(String),
    #[error("No such table: {0}")]
    NoSuchTable(TblHdl),
    #[error("No such session: {0}")]
    NoSuchSession(SessHdl),
    #[error("Session limit of {0} reached")]
    TooManySessions(u32),
    #[error("Table {tbl} ({pipe}) is reserved by session {owner}")]
    TableLocked {
        tbl: TblHdl,
        pipe: PipeScope,
        owner: SessHdl,
    },
    #[error("Transactions not supported: {0}")]
    TxnNotSupported(String),
    #[error("Operation not supported: {0}")]
    NotSupported(String),
    #[error("Entry {0} is still referenced")]
    Referenced(String),
    #[error("Out of resources: {0}")]
    NoResources(String),
    #[error("Device not ready: {0}")]
    NotReady(String),
    /// An error recorded earlier, reported once more by a later call.
    #[error("{detail}")]
    Deferred { status: PipeStatus, detail: String },
    #[error("Error: {0}")]
    Other(String),
}

impl PipeError {
    /// The process-wide status code that represents this error at the API
    /// boundary.
    pub fn status(&self) -> PipeStatus {
        match self {
            PipeError::Io(_) => PipeStatus::Io,
            PipeError::Switch(e) => match e {
                AsicError::InvalidArg(_) => PipeStatus::InvalidArg,
                AsicError::NoDevice(_) => PipeStatus::ObjNotFound,
                AsicError::Missing(_) => PipeStatus::ObjNotFound,
                AsicError::Exists => PipeStatus::AlreadyExists,
                AsicError::OperationUnsupported => PipeStatus::NotSupported,
                AsicError::Uninitialized(_) => PipeStatus::NotReady,
                AsicError::DriverError { .. } | AsicError::Synthetic(_) => {
                    PipeStatus::HwCommFail
                }
                AsicError::Internal(_) => PipeStatus::Unexpected,
            },
            PipeError::Exists(_) => PipeStatus::AlreadyExists,
            PipeError::Busy(_) => PipeStatus::TryAgain,
            PipeError::Missing(_) => PipeStatus::ObjNotFound,
            PipeError::Invalid(_) => PipeStatus::InvalidArg,
            PipeError::TableFull(_) => PipeStatus::NoSpace,
            PipeError::NoSuchTable(_) => PipeStatus::ObjNotFound,
            PipeError::NoSuchSession(_) => PipeStatus::SessionNotFound,
            PipeError::TooManySessions(_) => PipeStatus::MaxSessionsExceeded,
            PipeError::TableLocked { .. } => PipeStatus::TableLocked,
            PipeError::TxnNotSupported(_) => PipeStatus::TxnNotSupported,
            PipeError::NotSupported(_) => PipeStatus::NotSupported,
            PipeError::Referenced(_) => PipeStatus::EntryReferencesExist,
            PipeError::NoResources(_) => PipeStatus::NoSysResources,
            PipeError::NotReady(_) => PipeStatus::NotReady,
            PipeError::Deferred { status, .. } => *status,
            PipeError::Other(_) => PipeStatus::Unexpected,
        }
    }
}

impl convert::From<std::io::Error> for PipeError {
    fn from(err: std::io::Error) -> Self {
        PipeError::Io(err)
    }
}

impl convert::From<AsicError> for PipeError {
    fn from(err: AsicError) -> Self {
        PipeError::Switch(err)
    }
}

impl convert::From<std::collections::TryReserveError> for PipeError {
    fn from(err: std::collections::TryReserveError) -> Self {
        PipeError::NoResources(err.to_string())
    }
}

impl convert::From<&str> for PipeError {
    fn from(err: &str) -> Self {
        PipeError::Other(err.to_string())
    }
}

impl convert::From<String> for PipeError {
    fn from(err: String) -> Self {
        PipeError::Other(err)
    }
}

impl convert::From<anyhow::Error> for PipeError {
    fn from(err: anyhow::Error) -> Self {
        PipeError::Other(err.to_string())
    }
}
