// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use slog::{o, Drain};

use aal::{ActionData, MatchData};
use common::table::{TableKind, TblHdl};
use common::{DevTarget, PipeScope};
use pipemgr::config::{
    default_reconcile_order, Config, DeviceConfig, TableConfig,
};
use pipemgr::ha::DeviceMode;
use pipemgr::move_list::{EntrySpec, MatEntry};
use pipemgr::PipeMgr;

pub mod prelude {
    pub use super::*;
    pub use aal::{ActionData, MatchData};
    pub use common::{DevTarget, PipeScope, PipeStatus, SessHdl};
    pub use pipemgr::ha::{DeviceMode, HaPhase};
    pub use pipemgr::move_list::{EntrySpec, MatEntry, MoveKind};
    pub use pipemgr::PipeMgr;
}

/// An exact-match routing table with a static default
pub const ROUTE: TblHdl = 1;
/// The action-data table holding next hops
pub const NEXTHOP: TblHdl = 2;
/// A selector choosing among next hops
pub const ECMP: TblHdl = 3;
/// A ternary table programmed independently in each pipe
pub const ACL: TblHdl = 4;

pub const PHYS: DevTarget = DevTarget {
    dev: 0,
    pipe: PipeScope::All,
};
/// A second physical device, with a single pipe
pub const PHYS2: DevTarget = DevTarget {
    dev: 2,
    pipe: PipeScope::All,
};
pub const VIRT: DevTarget = DevTarget {
    dev: 1,
    pipe: PipeScope::All,
};

pub fn logger() -> slog::Logger {
    let decorator =
        slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    slog::Logger::root(drain, o!())
}

fn table(
    handle: TblHdl,
    name: &str,
    kind: TableKind,
    size: u32,
) -> TableConfig {
    TableConfig {
        handle,
        name: name.to_string(),
        kind,
        size,
        symmetric: true,
        ternary: false,
        default_action: None,
        reconcile_order: default_reconcile_order(),
        action_table: None,
    }
}

pub fn config() -> Config {
    let mut route = table(ROUTE, "route", TableKind::Match, 16);
    route.default_action = Some(ActionData::new("drop"));
    let mut ecmp = table(ECMP, "ecmp", TableKind::Selector, 4);
    ecmp.action_table = Some(NEXTHOP);
    let mut acl = table(ACL, "acl", TableKind::Match, 8);
    acl.symmetric = false;
    acl.ternary = true;

    Config {
        max_sessions: 4,
        devices: vec![
            DeviceConfig {
                dev: 0,
                pipes: vec![0, 1],
                virtual_device: false,
            },
            DeviceConfig {
                dev: 1,
                pipes: vec![0],
                virtual_device: true,
            },
            DeviceConfig {
                dev: 2,
                pipes: vec![0],
                virtual_device: false,
            },
        ],
        tables: vec![
            route,
            table(NEXTHOP, "nexthop", TableKind::ActionData, 16),
            ecmp,
            acl,
        ],
        ..Default::default()
    }
}

/// A manager with the physical device cold-started.
pub fn switch() -> PipeMgr {
    let mgr = PipeMgr::new(logger(), config()).unwrap();
    mgr.device_add(0, DeviceMode::Cold).unwrap();
    mgr
}

/// Shut the manager down and start a new one on the same hardware, leaving
/// the physical device ready for replay.
pub fn restart(mgr: PipeMgr) -> PipeMgr {
    let config = mgr.config.clone();
    let asic = mgr.fini();
    let mgr = PipeMgr::with_handle(logger(), config, asic).unwrap();
    mgr.device_add(0, DeviceMode::Hitless).unwrap();
    mgr.ha_hw_read_complete(0).unwrap();
    mgr
}

pub fn route(dst: u32, port: u16) -> MatEntry {
    MatEntry {
        key: MatchData::exact([("dst", dst)]),
        priority: 0,
        spec: EntrySpec::new(forward(port)),
    }
}

pub fn forward(port: u16) -> ActionData {
    ActionData::new("forward").arg("port", port)
}

pub fn nexthop(port: u16) -> ActionData {
    ActionData::new("set_port").arg("port", port)
}
