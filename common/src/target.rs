// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Identifies a single ASIC managed by this process.
pub type DevId = u16;

/// Identifies a single pipe within an ASIC.
pub type PipeId = u8;

/// A handle for a table entry, action-data entry, selector group or member.
/// Handles are unique within a table.
pub type EntryHdl = u32;

/// A handle for a client session.
pub type SessHdl = u32;

/// The set of pipes an operation applies to.  Symmetric tables are always
/// programmed identically in every pipe and are only addressed with `All`.
/// Asymmetric tables hold independent contents per pipe and are addressed
/// one pipe at a time.
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
pub enum PipeScope {
    All,
    Pipe(PipeId),
}

impl fmt::Display for PipeScope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PipeScope::All => write!(f, "all"),
            PipeScope::Pipe(p) => write!(f, "pipe{p}"),
        }
    }
}

/// The device, and the pipes within that device, that an operation targets.
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
pub struct DevTarget {
    pub dev: DevId,
    pub pipe: PipeScope,
}

impl DevTarget {
    /// Target every pipe of the given device.
    pub fn all_pipes(dev: DevId) -> Self {
        DevTarget {
            dev,
            pipe: PipeScope::All,
        }
    }

    /// Target a single pipe of the given device.
    pub fn pipe(dev: DevId, pipe: PipeId) -> Self {
        DevTarget {
            dev,
            pipe: PipeScope::Pipe(pipe),
        }
    }
}

impl fmt::Display for DevTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "dev{}/{}", self.dev, self.pipe)
    }
}
