// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Types and helpers shared by every crate in the pipeline manager workspace.

pub mod logging;
pub mod status;
pub mod table;
pub mod target;

pub use status::PipeStatus;
pub use target::{DevId, DevTarget, EntryHdl, PipeId, PipeScope, SessHdl};

/// Entry handles at or above this value are handed out for entries recovered
/// from hardware during a hitless restart.  They live only until the
/// reconciliation pass maps them onto the handles chosen by the replay.
pub const HA_TEMP_HDL_BASE: EntryHdl = 0x8000_0000;

/// Returns true if the handle was assigned to an entry read back from
/// hardware, rather than one created by a client.
pub fn is_temp_hdl(hdl: EntryHdl) -> bool {
    hdl >= HA_TEMP_HDL_BASE
}
