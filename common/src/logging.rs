// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::fs::OpenOptions;
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use slog::Drain;

/// How log records should be rendered.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Unstructured, human-readable text
    Human,
    /// Bunyan-formatted json, one record per line
    #[default]
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "human" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("invalid log format: {s}")),
        }
    }
}

/// Build the root logger for a process.  If `log_file` is set, records are
/// appended to that file, otherwise they go to stdout.
pub fn init(
    name: &str,
    log_file: &Option<String>,
    log_format: LogFormat,
) -> anyhow::Result<slog::Logger> {
    let drain = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {path}"))?;
            build_drain(file, log_format)
        }
        None => build_drain(std::io::stdout(), log_format),
    };

    Ok(slog::Logger::root(drain, slog::o!("name" => name.to_string())))
}

fn build_drain<W>(
    w: W,
    log_format: LogFormat,
) -> slog::Fuse<slog_async::Async>
where
    W: std::io::Write + Send + 'static,
{
    match log_format {
        LogFormat::Json => {
            let drain = slog_bunyan::with_name("pipemgr", w).build().fuse();
            slog_async::Async::new(drain).build().fuse()
        }
        LogFormat::Human => {
            let decorator = slog_term::PlainDecorator::new(w);
            let drain = slog_term::FullFormat::new(decorator).build().fuse();
            slog_async::Async::new(drain).build().fuse()
        }
    }
}
