// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Configuration for the pipeline manager.

use std::collections::BTreeSet;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use aal::ActionData;
use asic::AsicConfig;
use common::logging::LogFormat;
use common::table::{TableKind, TblHdl};
use common::{DevId, PipeId};

use crate::ha::spec_map::Worklist;

/// The Config structure captures all of the run-time settings of the
/// pipeline manager.  It is normally loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// If set, where the log should be written.  If not set, the log goes to
    /// stdout.
    pub log_file: Option<String>,

    /// Output log info in unstructured text or json?
    pub log_format: LogFormat,

    /// Whether new sessions wait for the device to acknowledge each pushed
    /// instruction list.
    pub sync_push: bool,

    /// The maximum number of concurrently open client sessions.
    pub max_sessions: u32,

    /// How many times an atomic commit polls the in-flight packet count
    /// before it gives up waiting for the old table version to drain.
    pub atomic_drain_polls: u32,

    /// The devices this process may manage.
    pub devices: Vec<DeviceConfig>,

    /// The tables compiled into the pipeline.
    pub tables: Vec<TableConfig>,

    /// Asic-specific config settings.
    pub asic: AsicConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_file: None,
            log_format: LogFormat::default(),
            sync_push: false,
            max_sessions: 64,
            atomic_drain_polls: 16,
            devices: Vec::new(),
            tables: Vec::new(),
            asic: AsicConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub dev: DevId,
    pub pipes: Vec<PipeId>,
    /// A virtual device tracks table state in software only.
    #[serde(default)]
    pub virtual_device: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    pub handle: TblHdl,
    pub name: String,
    pub kind: TableKind,
    /// Number of entries (or, for a selector table, groups) per pipe scope
    pub size: u32,
    /// Symmetric tables are programmed identically in all pipes.
    #[serde(default = "default_symmetric")]
    pub symmetric: bool,
    /// Ternary tables order their entries by priority.
    #[serde(default)]
    pub ternary: bool,
    /// The action installed on a miss whenever no other default is set.
    #[serde(default)]
    pub default_action: Option<ActionData>,
    /// The order in which reconciliation drains its worklists.
    #[serde(default = "default_reconcile_order")]
    pub reconcile_order: Vec<Worklist>,
    /// For a selector table, the action-data table holding its members.
    #[serde(default)]
    pub action_table: Option<TblHdl>,
}

fn default_symmetric() -> bool {
    true
}

pub fn default_reconcile_order() -> Vec<Worklist> {
    vec![Worklist::Delete, Worklist::Modify, Worklist::Add]
}

impl Config {
    /// Load a config from a TOML file and validate it.
    pub fn from_file(path: &str) -> anyhow::Result<Config> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {path}"))?;
        Config::from_toml(&data)
            .with_context(|| format!("parsing config file {path}"))
    }

    pub fn from_toml(data: &str) -> anyhow::Result<Config> {
        let config: Config = toml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the cross-references within the config.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut devs = BTreeSet::new();
        for d in &self.devices {
            if !devs.insert(d.dev) {
                anyhow::bail!("device {} configured twice", d.dev);
            }
            if d.pipes.is_empty() {
                anyhow::bail!("device {} has no pipes", d.dev);
            }
        }

        let mut handles = BTreeSet::new();
        for t in &self.tables {
            if !handles.insert(t.handle) {
                anyhow::bail!("table handle {} used twice", t.handle);
            }
            if t.size == 0 {
                anyhow::bail!("table {} has no capacity", t.name);
            }
            let order: BTreeSet<Worklist> =
                t.reconcile_order.iter().copied().collect();
            if t.reconcile_order.len() != 3
                || order
                    != BTreeSet::from([
                        Worklist::Add,
                        Worklist::Modify,
                        Worklist::Delete,
                    ])
            {
                anyhow::bail!(
                    "table {}: reconcile_order must list add, modify and \
                     delete exactly once",
                    t.name
                );
            }
        }

        for t in &self.tables {
            match (t.kind, t.action_table) {
                (TableKind::Selector, Some(adt)) => {
                    let target = self.tables.iter().find(|a| a.handle == adt);
                    match target {
                        Some(a) if a.kind == TableKind::ActionData => {
                            if a.symmetric != t.symmetric {
                                anyhow::bail!(
                                    "selector {} and its action table \
                                     disagree on symmetry",
                                    t.name
                                );
                            }
                        }
                        _ => anyhow::bail!(
                            "selector {} references {adt}, which is not an \
                             action-data table",
                            t.name
                        ),
                    }
                }
                (TableKind::Selector, None) => anyhow::bail!(
                    "selector {} has no action table",
                    t.name
                ),
                (_, Some(_)) => anyhow::bail!(
                    "only selector tables may name an action table ({})",
                    t.name
                ),
                _ => {}
            }
        }
        Ok(())
    }

    pub fn device(&self, dev: DevId) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.dev == dev)
    }
}
