// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The process-wide status codes returned across the table-management ABI.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, IntoStaticStr};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    EnumIter,
    IntoStaticStr,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum PipeStatus {
    Success = 0,
    NotReady = 1,
    NoSysResources = 2,
    InvalidArg = 3,
    AlreadyExists = 4,
    HwCommFail = 5,
    ObjNotFound = 6,
    MaxSessionsExceeded = 7,
    SessionNotFound = 8,
    NoSpace = 9,
    TryAgain = 10,
    InitError = 11,
    TxnNotSupported = 12,
    TableLocked = 13,
    Io = 14,
    Unexpected = 15,
    EntryReferencesExist = 16,
    NotSupported = 17,
}

impl PipeStatus {
    /// The numeric code carried across the ABI.
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn is_success(self) -> bool {
        self == PipeStatus::Success
    }
}
