// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use aal::{AsicOps, HwRecord};
use pretty_assertions::assert_eq;

use crate::integration_tests::common::prelude::*;

#[test]
fn test_abort_discards_everything() {
    let mgr = switch();
    let sess = mgr.session_create().unwrap();
    let kept = mgr.mat_ent_add(sess, PHYS, ROUTE, route(1, 1)).unwrap();
    mgr.complete_operations(sess).unwrap();
    let base = mgr.asic().instr_count(0).unwrap();

    mgr.begin_txn(sess, false).unwrap();
    for dst in 10..20 {
        mgr.mat_ent_add(sess, PHYS, ROUTE, route(dst, 2)).unwrap();
    }
    mgr.mat_ent_modify(sess, PHYS, ROUTE, kept, route(1, 5).spec)
        .unwrap();
    mgr.mat_default_set(sess, PHYS, ROUTE, forward(9)).unwrap();
    mgr.adt_ent_add(sess, PHYS, NEXTHOP, nexthop(1)).unwrap();
    assert_eq!(mgr.table_usage(0, ROUTE).unwrap().occupancy, 11);
    mgr.abort_txn(sess).unwrap();

    assert_eq!(mgr.table_usage(0, ROUTE).unwrap().occupancy, 1);
    assert_eq!(mgr.table_usage(0, NEXTHOP).unwrap().occupancy, 0);
    assert_eq!(mgr.mat_ent_get(PHYS, ROUTE, kept).unwrap(), route(1, 1));
    assert_eq!(
        mgr.mat_default_get(PHYS, ROUTE).unwrap(),
        Some(ActionData::new("drop"))
    );
    mgr.complete_operations(sess).unwrap();
    assert_eq!(mgr.asic().instr_count(0).unwrap(), base);

    // Handles handed out inside the aborted transaction are reused
    let hdl = mgr.mat_ent_add(sess, PHYS, ROUTE, route(10, 2)).unwrap();
    assert_eq!(hdl, kept + 1);
}

#[test]
fn test_atomic_commit_restores_version() {
    let mgr = switch();
    mgr.asic().config_update(|c| c.inflight_drain_polls = 2);
    let sess = mgr.session_create().unwrap();
    let old = mgr.mat_ent_add(sess, PHYS, ROUTE, route(1, 1)).unwrap();

    mgr.begin_txn(sess, true).unwrap();
    mgr.mat_ent_del(sess, PHYS, ROUTE, old).unwrap();
    let new = mgr.mat_ent_add(sess, PHYS, ROUTE, route(1, 2)).unwrap();
    mgr.commit_txn(sess, true).unwrap();

    assert_eq!(mgr.asic().version_get(0).unwrap(), 0);
    assert_eq!(mgr.asic().pending_pushes(0).unwrap(), 0);
    assert_eq!(mgr.mat_ent_get(PHYS, ROUTE, new).unwrap(), route(1, 2));
    assert_eq!(
        mgr.mat_ent_get(PHYS, ROUTE, old).unwrap_err().status(),
        PipeStatus::ObjNotFound
    );
}

#[test]
fn test_commit_touches_several_tables() {
    let mgr = switch();
    let sess = mgr.session_create().unwrap();

    mgr.begin_txn(sess, false).unwrap();
    let nh = mgr.adt_ent_add(sess, PHYS, NEXTHOP, nexthop(3)).unwrap();
    let grp = mgr.sel_grp_create(sess, PHYS, ECMP, 2).unwrap();
    mgr.sel_grp_mbr_add(sess, PHYS, ECMP, grp, nh).unwrap();
    let hdl = mgr.mat_ent_add(sess, PHYS, ROUTE, route(7, 3)).unwrap();
    mgr.commit_txn(sess, true).unwrap();

    assert_eq!(mgr.adt_ent_get(PHYS, NEXTHOP, nh).unwrap(), nexthop(3));
    assert_eq!(mgr.sel_grp_get(PHYS, ECMP, grp).unwrap().members.len(), 1);
    assert_eq!(mgr.mat_ent_get(PHYS, ROUTE, hdl).unwrap(), route(7, 3));
    assert_eq!(mgr.asic().pending_pushes(0).unwrap(), 0);
}

#[test]
fn test_txn_on_virtual_device() {
    let mgr = switch();
    mgr.device_add(1, DeviceMode::Cold).unwrap();
    let sess = mgr.session_create().unwrap();

    mgr.begin_txn(sess, true).unwrap();
    let kept = mgr.mat_ent_add(sess, VIRT, ROUTE, route(1, 1)).unwrap();
    mgr.commit_txn(sess, true).unwrap();

    mgr.begin_txn(sess, false).unwrap();
    mgr.mat_ent_del(sess, VIRT, ROUTE, kept).unwrap();
    mgr.abort_txn(sess).unwrap();
    assert_eq!(mgr.mat_ent_get(VIRT, ROUTE, kept).unwrap(), route(1, 1));
}

#[test]
fn test_failed_commit_releases_tables() {
    let mgr = switch();
    let a = mgr.session_create().unwrap();
    let b = mgr.session_create().unwrap();

    mgr.begin_txn(a, false).unwrap();
    mgr.mat_ent_add(a, PHYS, ROUTE, route(1, 1)).unwrap();
    mgr.asic().config_update(|c| c.ilist_push.set(1.0));
    let err = mgr.commit_txn(a, true).unwrap_err();
    assert_eq!(err.status(), PipeStatus::HwCommFail);
    mgr.asic().config_update(|c| c.ilist_push.set(0.0));

    // The table is free for the other session once the commit is abandoned
    mgr.mat_ent_add(b, PHYS, ROUTE, route(2, 1)).unwrap();
    mgr.begin_txn(a, false).unwrap();
}

#[test]
fn test_commit_kept_on_accepting_device() {
    let mgr = switch();
    mgr.device_add(2, DeviceMode::Cold).unwrap();
    let sess = mgr.session_create().unwrap();
    let hw_routes = |dev| {
        mgr.asic()
            .table_read(dev, ROUTE, PipeScope::All)
            .unwrap()
            .into_iter()
            .filter(|r| matches!(r, HwRecord::Mat { .. }))
            .count()
    };

    mgr.begin_txn(sess, false).unwrap();
    let accepted = mgr.mat_ent_add(sess, PHYS, ROUTE, route(1, 1)).unwrap();
    let refused = mgr.mat_ent_add(sess, PHYS2, ROUTE, route(1, 1)).unwrap();
    mgr.asic().config_update(|c| c.ilist_push_dev.set(2, 1.0));
    let err = mgr.commit_txn(sess, true).unwrap_err();
    assert_eq!(err.status(), PipeStatus::HwCommFail);
    mgr.asic().config_update(|c| c.ilist_push_dev.set(2, 0.0));

    // Device 0 took its writes and keeps them in software too
    assert_eq!(mgr.mat_ent_get(PHYS, ROUTE, accepted).unwrap(), route(1, 1));
    assert_eq!(hw_routes(0), 1);
    assert_eq!(mgr.asic().pending_pushes(0).unwrap(), 0);

    // Device 2 took nothing and is back where it started
    assert_eq!(
        mgr.mat_ent_get(PHYS2, ROUTE, refused).unwrap_err().status(),
        PipeStatus::ObjNotFound
    );
    assert_eq!(hw_routes(2), 0);

    // The session is idle and its tables are free
    let other = mgr.session_create().unwrap();
    mgr.mat_ent_add(other, PHYS2, ROUTE, route(1, 1)).unwrap();
    mgr.begin_txn(sess, false).unwrap();
}
