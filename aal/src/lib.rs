// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use common::table::TblHdl;
use common::{DevId, PipeId, PipeScope};

mod instr;
pub use instr::*;

mod match_action;
pub use match_action::*;

/// A specialized Result type for ASIC operations
pub type AsicResult<T> = Result<T, AsicError>;

/// Error type conveying additional information about ASIC errors
#[derive(Error, Debug)]
pub enum AsicError {
    /// Error reported by the device driver.  This will report both the
    /// location in the ASIC layer that detected the error, as well as the
    /// detailed error message from the driver.
    #[error("driver error at {ctx}: {err}")]
    DriverError { ctx: String, err: String },
    /// An argument passed to the ASIC layer is invalid or inappropriate.  This
    /// indicates misbehavior from the caller.
    #[error("Invalid argument: {}", .0)]
    InvalidArg(String),
    /// An Asic function was called before the ASIC layer was properly
    /// initialized.  Indicates misbehavior from the caller.
    #[error("ASIC layer uninitialized: {}", .0)]
    Uninitialized(String),
    /// The device has not been added to the ASIC layer
    #[error("No such device: {}", .0)]
    NoDevice(DevId),
    /// This operation is unsupported by the ASIC model being used
    #[error("Operation unsupported by the ASIC")]
    OperationUnsupported,
    /// The ASIC layer detected some internal inconsistency
    #[error("Internal error: {}",.0)]
    Internal(String),
    /// An error derived from a purposely triggered synthetic fault for testing
    /// purposes.
    #[error("Synthetic ASIC error: {}", .0)]
    Synthetic(String),
    /// A general indication that a caller is trying to create something that
    /// already exists.
    #[error("Already exists")]
    Exists,
    /// A general indication that a caller is trying to modify something that
    /// is not present.
    #[error("Missing: {}", .0)]
    Missing(String),
}

/// Identifies a single instruction list handed to the device.  Ids are
/// assigned per device, in push order.
pub type PushId = u64;

/// Periodic activity the ASIC layer runs on its own behalf.  These are
/// suspended while a hitless restart reconciles the tables, since they would
/// otherwise act on state that is known to be stale.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundTask {
    /// Periodic comparison of hardware memories against shadow copies
    HwScrub,
    /// Detection of ports whose MAC has stopped draining
    StuckPortDetect,
}

impl BackgroundTask {
    pub const ALL: [BackgroundTask; 2] =
        [BackgroundTask::HwScrub, BackgroundTask::StuckPortDetect];
}

/// The `AsicOps` trait contains all of the hardware-facing operations that
/// the pipeline manager requires.  Everything chip-specific (how a table
/// write is laid out in a DMA descriptor, how the version register is
/// addressed) lives on the far side of this trait.
pub trait AsicOps {
    /// Make a device known to the ASIC layer.  A cold add discards whatever
    /// the hardware holds; a warm add leaves the live hardware state in place
    /// so it can be read back.
    fn device_add(
        &self,
        dev: DevId,
        pipes: &[PipeId],
        cold: bool,
    ) -> AsicResult<()>;

    /// Forget about a device.
    fn device_remove(&self, dev: DevId) -> AsicResult<()>;

    /// Encode a single instruction for the device.  The ASIC layer rejects
    /// instructions it cannot express.  Nothing reaches the hardware until
    /// the instruction is part of a pushed list.
    fn instr_encode(&self, dev: DevId, instr: &Instr) -> AsicResult<()>;

    /// Hand an ordered list of encoded instructions to the device.  The list
    /// is executed in order, and its completion is reported by
    /// `complete_operations`.
    fn ilist_push(&self, dev: DevId, instrs: Vec<Instr>) -> AsicResult<PushId>;

    /// Block until every instruction list pushed to the device has been
    /// executed, returning the ids of the lists completed by this call.
    fn complete_operations(&self, dev: DevId) -> AsicResult<Vec<PushId>>;

    /// Report the current value of the device's table-version register.
    fn version_get(&self, dev: DevId) -> AsicResult<u8>;

    /// Report the number of packets still in flight in the pipeline under
    /// the previous table version.
    fn inflight_pkts(&self, dev: DevId) -> AsicResult<u64>;

    /// Read the contents of a table back from the hardware.
    fn table_read(
        &self,
        dev: DevId,
        tbl: TblHdl,
        pipe: PipeScope,
    ) -> AsicResult<Vec<HwRecord>>;

    /// Enable or suspend a periodic background task.
    fn background_set(
        &self,
        dev: DevId,
        task: BackgroundTask,
        enabled: bool,
    ) -> AsicResult<()>;
}

/// For a counter, this contains the number of bytes, packets, or both that were
/// counted.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    JsonSchema,
)]
pub struct CounterData {
    pub pkts: Option<u64>,
    pub bytes: Option<u64>,
}
