// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::collections::HashMap;

use rand::random;
use serde::{Deserialize, Serialize};
use slog::Logger;

use aal::{AsicError, AsicResult};
use common::table::TblHdl;
use common::DevId;

/// Chaos that happens according to a probability.
#[derive(Default, Debug, Serialize, Deserialize, Copy, Clone)]
pub struct Chaos {
    /// A probability between 0.0 and 1.0
    pub value: f64,
}

impl Chaos {
    /// Create a new chaos value.
    pub fn new(value: f64) -> Self {
        let mut c = Self::default();
        c.set(value);
        c
    }

    /// Set the chaos value. Panics if value is outside the range [0.0, 1.0].
    pub fn set(&mut self, value: f64) {
        if !(0.0..=1.0).contains(&value) {
            panic!("probability out of range");
        }
        self.value = value;
    }

    /// Get the underlying chaos value.
    pub fn get(&self) -> f64 {
        self.value
    }

    /// Return a chaos error according to the underlying probability value.
    pub fn unfurled(&self, log: &Logger, message: &str) -> AsicResult<()> {
        // `random()` yields a value in [0, 1), so a probability of 0.0 never
        // fires and 1.0 always does.
        if self.value > random::<f64>() {
            slog::error!(log, "chaos error: {}", message);
            return Err(AsicError::Synthetic(message.into()));
        }
        Ok(())
    }
}

/// A form of chaos that applies to tables.  Probabilities are keyed by the
/// table handle, rendered in decimal so the config can be expressed in TOML.
#[derive(Default, Debug, Serialize, Deserialize, Clone)]
pub struct TableChaos {
    /// Track a set of chaos probabilities keyed by table.
    pub values: HashMap<String, f64>,
}

/// A convenience function for creating chaos tables.
#[macro_export]
macro_rules! table_chaos {
    ( $( ($tbl:expr, $prob:expr) ),* ) => {
        $crate::TableChaos {
            values: std::collections::HashMap::from([
                $( ($tbl.to_string(), $prob) ),*
            ])
        }
    }
}

impl TableChaos {
    /// Create a chaos table that assigns the same probability to each of the
    /// given tables.
    pub fn uniform(tables: &[TblHdl], v: f64) -> Self {
        TableChaos {
            values: tables.iter().map(|t| (t.to_string(), v)).collect(),
        }
    }

    /// Set the probability for a single table.
    pub fn set(&mut self, tbl: TblHdl, v: f64) {
        if !(0.0..=1.0).contains(&v) {
            panic!("probability out of range");
        }
        self.values.insert(tbl.to_string(), v);
    }

    /// Return a chaos error according to the underlying probability value for
    /// the given table.
    pub fn unfurled(
        &self,
        log: &Logger,
        tbl: TblHdl,
        message: &str,
    ) -> AsicResult<()> {
        if let Some(value) = self.values.get(&tbl.to_string()) {
            if *value > random::<f64>() {
                slog::error!(log, "chaos table error: {}", message;
                    "table" => tbl);
                return Err(AsicError::Synthetic(message.into()));
            }
        }
        Ok(())
    }
}

/// Chaos that applies to a single device.  Keyed the same way as
/// [`TableChaos`].
#[derive(Default, Debug, Serialize, Deserialize, Clone)]
pub struct DeviceChaos {
    pub values: HashMap<String, f64>,
}

impl DeviceChaos {
    /// Set the probability for a single device.
    pub fn set(&mut self, dev: DevId, v: f64) {
        if !(0.0..=1.0).contains(&v) {
            panic!("probability out of range");
        }
        self.values.insert(dev.to_string(), v);
    }

    pub fn unfurled(
        &self,
        log: &Logger,
        dev: DevId,
        message: &str,
    ) -> AsicResult<()> {
        if let Some(value) = self.values.get(&dev.to_string()) {
            if *value > random::<f64>() {
                slog::error!(log, "chaos device error: {}", message;
                    "dev" => dev);
                return Err(AsicError::Synthetic(message.into()));
            }
        }
        Ok(())
    }
}

/// The model ASIC config contains a chaos value for each ASIC operation, and
/// the knobs controlling the model's simulated pipeline.
#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AsicConfig {
    /// The number of times `inflight_pkts` reports packets still in flight
    /// after the table version is bumped.
    pub inflight_drain_polls: u32,

    pub ilist_push: Chaos,
    /// Push failures confined to particular devices
    pub ilist_push_dev: DeviceChaos,
    pub complete_operations: Chaos,
    pub mat_write: TableChaos,
    pub mat_update: TableChaos,
    pub mat_clear: TableChaos,
    pub mat_default: TableChaos,
    pub adt_write: TableChaos,
    pub adt_clear: TableChaos,
    pub sel_write: TableChaos,
    pub sel_clear: TableChaos,
    pub sel_fallback: TableChaos,
    pub table_read: TableChaos,
}

impl AsicConfig {
    /// Apply a uniform probability to every encoding operation on the given
    /// tables.  The device-level operations are left alone.
    pub fn uniform_encode(tables: &[TblHdl], v: f64) -> Self {
        Self {
            mat_write: TableChaos::uniform(tables, v),
            mat_update: TableChaos::uniform(tables, v),
            mat_clear: TableChaos::uniform(tables, v),
            mat_default: TableChaos::uniform(tables, v),
            adt_write: TableChaos::uniform(tables, v),
            adt_clear: TableChaos::uniform(tables, v),
            sel_write: TableChaos::uniform(tables, v),
            sel_clear: TableChaos::uniform(tables, v),
            sel_fallback: TableChaos::uniform(tables, v),
            ..Default::default()
        }
    }
}

/// A convenience macro for unfurling chaos. The $name should be a regular
/// `Chaos` member of [`AsicConfig`]. The `handle` is a [`crate::Handle`].
macro_rules! unfurl {
    ($handle:ident, $name:ident) => {
        $handle
            .config
            .lock()
            .unwrap()
            .$name
            .unfurled(&$handle.log, stringify!($name))?
    };
}
pub(crate) use unfurl;

/// A convenience macro for unfurling tabular chaos. The $name should be a
/// `TableChaos` member of [`AsicConfig`]. The `handle` is a
/// [`crate::Handle`].
macro_rules! table_unfurl {
    ($handle:ident, $tbl: expr, $name:ident) => {
        $handle
            .config
            .lock()
            .unwrap()
            .$name
            .unfurled(&$handle.log, $tbl, stringify!($name))?
    };
}
pub(crate) use table_unfurl;
