// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use aal::{AsicOps, HwRecord};
use pipemgr::move_list::SelMember;
use pretty_assertions::assert_eq;

use crate::integration_tests::common::prelude::*;

fn hw_routes(mgr: &PipeMgr) -> Vec<aal::HwMatEntry> {
    mgr.asic()
        .table_read(0, ROUTE, PipeScope::All)
        .unwrap()
        .into_iter()
        .filter_map(|r| match r {
            HwRecord::Mat { entry, .. } => Some(entry),
            _ => None,
        })
        .collect()
}

#[test]
fn test_failed_modify_in_batch() {
    let mgr = switch();
    let sess = mgr.session_create().unwrap();
    let hdl = mgr.mat_ent_add(sess, PHYS, ROUTE, route(1, 1)).unwrap();

    mgr.begin_batch(sess).unwrap();
    mgr.asic().config_update(|c| c.mat_update.set(ROUTE, 1.0));
    let err = mgr
        .mat_ent_modify(sess, PHYS, ROUTE, hdl, route(1, 2).spec)
        .unwrap_err();
    assert_eq!(err.status(), PipeStatus::HwCommFail);
    mgr.asic().config_update(|c| c.mat_update.set(ROUTE, 0.0));

    // Later operations in the batch are unaffected by the failure
    mgr.mat_ent_add(sess, PHYS, ROUTE, route(2, 1)).unwrap();
    mgr.mat_ent_add(sess, PHYS, ROUTE, route(3, 1)).unwrap();

    let err = mgr.end_batch(sess, true).unwrap_err();
    assert_eq!(err.status(), PipeStatus::HwCommFail);

    assert_eq!(mgr.mat_ent_get(PHYS, ROUTE, hdl).unwrap(), route(1, 1));
    assert_eq!(mgr.table_usage(0, ROUTE).unwrap().occupancy, 3);
    let hw = hw_routes(&mgr);
    assert_eq!(hw.len(), 3);
    assert!(hw.iter().all(|e| e.action == forward(1)));

    // The error was reported once, and the session is idle again
    mgr.begin_batch(sess).unwrap();
    mgr.end_batch(sess, true).unwrap();
}

#[test]
fn test_batch_builds_group() {
    let mgr = switch();
    let sess = mgr.session_create().unwrap();
    mgr.session_sync_set(sess, true).unwrap();

    mgr.begin_batch(sess).unwrap();
    let a = mgr.adt_ent_add(sess, PHYS, NEXTHOP, nexthop(1)).unwrap();
    let b = mgr.adt_ent_add(sess, PHYS, NEXTHOP, nexthop(2)).unwrap();
    let grp = mgr.sel_grp_create(sess, PHYS, ECMP, 4).unwrap();
    mgr.sel_grp_mbr_add(sess, PHYS, ECMP, grp, a).unwrap();
    mgr.sel_grp_mbr_add(sess, PHYS, ECMP, grp, b).unwrap();
    mgr.sel_grp_mbr_disable(sess, PHYS, ECMP, grp, b).unwrap();
    mgr.sel_fallback_set(sess, PHYS, ECMP, a).unwrap();
    let base = mgr.asic().instr_count(0).unwrap();
    mgr.end_batch(sess, false).unwrap();
    assert!(mgr.asic().instr_count(0).unwrap() > base);

    let group = mgr.sel_grp_get(PHYS, ECMP, grp).unwrap();
    assert_eq!(group.max_size, 4);
    assert_eq!(
        group.members,
        vec![
            SelMember {
                hdl: a,
                active: true
            },
            SelMember {
                hdl: b,
                active: false
            },
        ]
    );

    // A member still in a group cannot be deleted
    let err = mgr.adt_ent_del(sess, PHYS, NEXTHOP, b).unwrap_err();
    assert_eq!(err.status(), PipeStatus::EntryReferencesExist);
    mgr.sel_grp_mbr_del(sess, PHYS, ECMP, grp, b).unwrap();
    mgr.adt_ent_del(sess, PHYS, NEXTHOP, b).unwrap();
}

#[test]
fn test_batch_on_virtual_device() {
    let mgr = switch();
    mgr.device_add(1, DeviceMode::Cold).unwrap();
    let sess = mgr.session_create().unwrap();

    mgr.begin_batch(sess).unwrap();
    let hdl = mgr.mat_ent_add(sess, VIRT, ROUTE, route(1, 1)).unwrap();
    mgr.mat_ent_modify(sess, VIRT, ROUTE, hdl, route(1, 3).spec)
        .unwrap();
    mgr.end_batch(sess, true).unwrap();

    assert_eq!(mgr.mat_ent_get(VIRT, ROUTE, hdl).unwrap(), route(1, 3));
    // Only the physical device has hardware behind it
    assert!(mgr.asic().instr_count(1).is_err());
}
