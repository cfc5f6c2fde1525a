// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use aal::{AsicOps, DirectResource, HwRecord, MeterSpec};
use common::table::TblHdl;
use pipemgr::ha::spec_map::Classification;
use pipemgr::ha::{ReconcileReport, TableReport};
use pretty_assertions::assert_eq;

use crate::integration_tests::common::prelude::*;

fn table_report(
    report: &ReconcileReport,
    tbl: TblHdl,
    pipe: PipeScope,
) -> &TableReport {
    report
        .tables
        .iter()
        .find(|t| t.handle == tbl && t.pipe == pipe)
        .unwrap()
}

fn hw_records(mgr: &PipeMgr, tbl: TblHdl, pipe: PipeScope) -> Vec<HwRecord> {
    mgr.asic().table_read(0, tbl, pipe).unwrap()
}

fn hw_mat_count(mgr: &PipeMgr, tbl: TblHdl, pipe: PipeScope) -> usize {
    hw_records(mgr, tbl, pipe)
        .iter()
        .filter(|r| matches!(r, HwRecord::Mat { .. }))
        .count()
}

/// Compute and push the delta, returning the report and the number of
/// instructions the push executed.
fn converge(mgr: &PipeMgr) -> (ReconcileReport, u64) {
    let report = mgr.ha_compute_delta(0).unwrap();
    assert_eq!(mgr.ha_phase(0).unwrap(), HaPhase::DeltaComputed);
    let base = mgr.asic().instr_count(0).unwrap();
    mgr.ha_push_delta(0).unwrap();
    assert_eq!(mgr.ha_phase(0).unwrap(), HaPhase::Ready);
    let executed = mgr.asic().instr_count(0).unwrap() - base;
    (report, executed)
}

fn metered(dst: u32, cir_kbps: u64) -> MatEntry {
    let mut entry = route(dst, 1);
    entry.spec.resources = vec![DirectResource::Meter(MeterSpec {
        cir_kbps,
        pir_kbps: cir_kbps * 2,
        cburst_kbits: 64,
        pburst_kbits: 128,
    })];
    entry
}

#[test]
fn test_identical_replay_is_hitless() {
    let mgr = switch();
    let sess = mgr.session_create().unwrap();
    let h1 = mgr.mat_ent_add(sess, PHYS, ROUTE, route(1, 1)).unwrap();
    let h2 = mgr.mat_ent_add(sess, PHYS, ROUTE, route(2, 2)).unwrap();
    mgr.complete_operations(sess).unwrap();

    let mgr = restart(mgr);
    let sess = mgr.session_create().unwrap();
    assert_eq!(mgr.mat_ent_add(sess, PHYS, ROUTE, route(1, 1)).unwrap(), h1);
    assert_eq!(mgr.mat_ent_add(sess, PHYS, ROUTE, route(2, 2)).unwrap(), h2);

    let (report, executed) = converge(&mgr);
    assert_eq!(report.delta_moves(), 0);
    assert_eq!(executed, 0);

    let routes = table_report(&report, ROUTE, PipeScope::All);
    assert_eq!(routes.recovered, 2);
    assert_eq!(routes.remapped, 2);
    assert_eq!(routes.classes.get(&Classification::FullMatch), Some(&2));
    assert!(!routes.default_changed);

    // The recovered entries answer to their replayed handles
    assert_eq!(mgr.mat_ent_get(PHYS, ROUTE, h2).unwrap(), route(2, 2));
    let h3 = mgr.mat_ent_add(sess, PHYS, ROUTE, route(3, 3)).unwrap();
    assert_eq!(h3, h2 + 1);
}

#[test]
fn test_stale_entry_deleted() {
    let mgr = switch();
    let sess = mgr.session_create().unwrap();
    mgr.mat_ent_add(sess, PHYS, ROUTE, route(1, 1)).unwrap();
    mgr.mat_ent_add(sess, PHYS, ROUTE, route(2, 2)).unwrap();
    mgr.complete_operations(sess).unwrap();

    let mgr = restart(mgr);
    let sess = mgr.session_create().unwrap();
    mgr.mat_ent_add(sess, PHYS, ROUTE, route(1, 1)).unwrap();

    let (report, executed) = converge(&mgr);
    let routes = table_report(&report, ROUTE, PipeScope::All);
    assert_eq!(routes.deleted, 1);
    assert_eq!(routes.delta_moves, 1);
    assert_eq!(executed, 1);
    assert_eq!(hw_mat_count(&mgr, ROUTE, PipeScope::All), 1);
    assert_eq!(mgr.table_usage(0, ROUTE).unwrap().occupancy, 1);
}

#[test]
fn test_new_entry_added_under_replay_handle() {
    let mgr = switch();
    let sess = mgr.session_create().unwrap();
    mgr.mat_ent_add(sess, PHYS, ROUTE, route(1, 1)).unwrap();
    mgr.complete_operations(sess).unwrap();

    let mgr = restart(mgr);
    let sess = mgr.session_create().unwrap();
    mgr.mat_ent_add(sess, PHYS, ROUTE, route(1, 1)).unwrap();
    let added = mgr.mat_ent_add(sess, PHYS, ROUTE, route(5, 5)).unwrap();
    assert_eq!(mgr.mat_ent_get(PHYS, ROUTE, added).unwrap(), route(5, 5));

    let (report, executed) = converge(&mgr);
    let routes = table_report(&report, ROUTE, PipeScope::All);
    assert_eq!(routes.added, 1);
    assert_eq!(routes.remapped, 1);
    assert_eq!(executed, 1);
    assert_eq!(mgr.mat_ent_get(PHYS, ROUTE, added).unwrap(), route(5, 5));
    assert_eq!(hw_mat_count(&mgr, ROUTE, PipeScope::All), 2);
}

#[test]
fn test_changed_action_rewritten() {
    let mgr = switch();
    let sess = mgr.session_create().unwrap();
    let hdl = mgr.mat_ent_add(sess, PHYS, ROUTE, route(1, 1)).unwrap();
    mgr.complete_operations(sess).unwrap();

    let mgr = restart(mgr);
    let sess = mgr.session_create().unwrap();
    assert_eq!(mgr.mat_ent_add(sess, PHYS, ROUTE, route(1, 9)).unwrap(), hdl);

    let (report, executed) = converge(&mgr);
    let routes = table_report(&report, ROUTE, PipeScope::All);
    assert_eq!(
        routes.classes.get(&Classification::ActionDataDirty),
        Some(&1)
    );
    assert_eq!(routes.modified, 1);
    assert_eq!(executed, 1);
    let hw: Vec<_> = hw_records(&mgr, ROUTE, PipeScope::All)
        .into_iter()
        .filter_map(|r| match r {
            HwRecord::Mat { entry, .. } => Some(entry.action),
            _ => None,
        })
        .collect();
    assert_eq!(hw, vec![forward(9)]);
}

#[test]
fn test_selector_state_converges() {
    let build = |mgr: &PipeMgr, sess: SessHdl| -> (u32, u32, u32) {
        let a = mgr.adt_ent_add(sess, PHYS, NEXTHOP, nexthop(1)).unwrap();
        let b = mgr.adt_ent_add(sess, PHYS, NEXTHOP, nexthop(2)).unwrap();
        let grp = mgr.sel_grp_create(sess, PHYS, ECMP, 4).unwrap();
        mgr.sel_grp_mbr_add(sess, PHYS, ECMP, grp, a).unwrap();
        mgr.sel_grp_mbr_add(sess, PHYS, ECMP, grp, b).unwrap();
        mgr.sel_grp_mbr_disable(sess, PHYS, ECMP, grp, b).unwrap();
        mgr.sel_fallback_set(sess, PHYS, ECMP, a).unwrap();
        (a, b, grp)
    };

    let mgr = switch();
    let sess = mgr.session_create().unwrap();
    let before = build(&mgr, sess);
    let group = mgr.sel_grp_get(PHYS, ECMP, before.2).unwrap();
    mgr.complete_operations(sess).unwrap();

    let mgr = restart(mgr);
    let sess = mgr.session_create().unwrap();
    let after = build(&mgr, sess);
    assert_eq!(after, before);

    let (report, executed) = converge(&mgr);
    assert_eq!(report.delta_moves(), 0);
    assert_eq!(executed, 0);
    assert_eq!(
        table_report(&report, NEXTHOP, PipeScope::All).remapped,
        2
    );
    assert_eq!(mgr.sel_grp_get(PHYS, ECMP, after.2).unwrap(), group);
    assert_eq!(mgr.adt_ent_get(PHYS, NEXTHOP, after.1).unwrap(), nexthop(2));
}

#[test]
fn test_selector_member_change_rewritten() {
    let mgr = switch();
    let sess = mgr.session_create().unwrap();
    let a = mgr.adt_ent_add(sess, PHYS, NEXTHOP, nexthop(1)).unwrap();
    let b = mgr.adt_ent_add(sess, PHYS, NEXTHOP, nexthop(2)).unwrap();
    let grp = mgr.sel_grp_create(sess, PHYS, ECMP, 4).unwrap();
    mgr.sel_grp_mbr_add(sess, PHYS, ECMP, grp, a).unwrap();
    mgr.sel_grp_mbr_add(sess, PHYS, ECMP, grp, b).unwrap();
    mgr.complete_operations(sess).unwrap();

    // The replay drops a member from the group
    let mgr = restart(mgr);
    let sess = mgr.session_create().unwrap();
    mgr.adt_ent_add(sess, PHYS, NEXTHOP, nexthop(1)).unwrap();
    mgr.adt_ent_add(sess, PHYS, NEXTHOP, nexthop(2)).unwrap();
    mgr.sel_grp_create(sess, PHYS, ECMP, 4).unwrap();
    mgr.sel_grp_mbr_add(sess, PHYS, ECMP, grp, a).unwrap();

    let (report, executed) = converge(&mgr);
    assert!(table_report(&report, ECMP, PipeScope::All).delta_moves > 0);
    assert!(executed > 0);
    let groups: Vec<_> = hw_records(&mgr, ECMP, PipeScope::All)
        .into_iter()
        .filter_map(|r| match r {
            HwRecord::SelGroup { members, .. } => Some(members.len()),
            _ => None,
        })
        .collect();
    assert_eq!(groups, vec![1]);
}

#[test]
fn test_default_reconciled() {
    let mgr = switch();
    let sess = mgr.session_create().unwrap();
    mgr.mat_default_set(sess, PHYS, ROUTE, forward(9)).unwrap();
    mgr.complete_operations(sess).unwrap();

    let mgr = restart(mgr);
    // Nothing replayed yet, so the static default applies
    assert_eq!(
        mgr.mat_default_get(PHYS, ROUTE).unwrap(),
        Some(ActionData::new("drop"))
    );

    let (report, executed) = converge(&mgr);
    assert!(table_report(&report, ROUTE, PipeScope::All).default_changed);
    assert_eq!(executed, 1);
    assert_eq!(
        mgr.mat_default_get(PHYS, ROUTE).unwrap(),
        Some(ActionData::new("drop"))
    );
    let defaults: Vec<_> = hw_records(&mgr, ROUTE, PipeScope::All)
        .into_iter()
        .filter_map(|r| match r {
            HwRecord::MatDefault { action } => Some(action),
            _ => None,
        })
        .collect();
    assert_eq!(defaults, vec![ActionData::new("drop")]);
}

#[test]
fn test_pipes_reconciled_separately() {
    let rule = |dst| MatEntry {
        priority: 5,
        ..route(dst, 1)
    };
    let pipe0 = DevTarget::pipe(0, 0);
    let pipe1 = DevTarget::pipe(0, 1);

    let mgr = switch();
    let sess = mgr.session_create().unwrap();
    mgr.mat_ent_add(sess, pipe0, ACL, rule(1)).unwrap();
    mgr.complete_operations(sess).unwrap();

    let mgr = restart(mgr);
    let sess = mgr.session_create().unwrap();
    mgr.mat_ent_add(sess, pipe1, ACL, rule(1)).unwrap();

    let (report, _) = converge(&mgr);
    assert_eq!(table_report(&report, ACL, PipeScope::Pipe(0)).deleted, 1);
    assert_eq!(table_report(&report, ACL, PipeScope::Pipe(1)).added, 1);
    assert_eq!(hw_mat_count(&mgr, ACL, PipeScope::Pipe(0)), 0);
    assert_eq!(hw_mat_count(&mgr, ACL, PipeScope::Pipe(1)), 1);
}

#[test]
fn test_resource_mismatch_reported() {
    let mgr = switch();
    let sess = mgr.session_create().unwrap();
    let hdl = mgr.mat_ent_add(sess, PHYS, ROUTE, metered(1, 1000)).unwrap();
    mgr.complete_operations(sess).unwrap();

    let mgr = restart(mgr);
    let sess = mgr.session_create().unwrap();
    mgr.mat_ent_add(sess, PHYS, ROUTE, metered(1, 2000)).unwrap();

    let (report, _) = converge(&mgr);
    let routes = table_report(&report, ROUTE, PipeScope::All);
    assert_eq!(
        routes.classes.get(&Classification::ResourceMismatch),
        Some(&1)
    );
    assert_eq!(routes.mismatches.len(), 1);
    let mismatch = &routes.mismatches[0];
    assert_eq!(mismatch.hdl, hdl);
    assert_eq!(mismatch.hw, metered(1, 1000).spec.resources);
    assert_eq!(mismatch.replay, metered(1, 2000).spec.resources);
    assert_eq!(mgr.mat_ent_get(PHYS, ROUTE, hdl).unwrap(), metered(1, 2000));
}

#[test]
fn test_report_serializes() {
    let mgr = switch();
    let sess = mgr.session_create().unwrap();
    mgr.mat_ent_add(sess, PHYS, ROUTE, route(1, 1)).unwrap();
    mgr.complete_operations(sess).unwrap();

    let mgr = restart(mgr);
    converge(&mgr);
    let report = mgr.ha_report(0).unwrap().unwrap();
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["dev"], 0);
    let routes = json["tables"]
        .as_array()
        .unwrap()
        .iter()
        .find(|t| t["table"] == "route")
        .unwrap();
    assert_eq!(routes["deleted"], 1);
    assert_eq!(routes["pipe"], "all");

    let back: ReconcileReport = serde_json::from_value(json).unwrap();
    assert_eq!(back.delta_moves(), report.delta_moves());
}

#[test]
fn test_client_ops_blocked_until_read() {
    let mgr = switch();
    let config = mgr.config.clone();
    let asic = mgr.fini();
    let mgr = PipeMgr::with_handle(logger(), config, asic).unwrap();
    mgr.device_add(0, DeviceMode::Hitless).unwrap();
    let sess = mgr.session_create().unwrap();

    let err = mgr.mat_ent_add(sess, PHYS, ROUTE, route(1, 1)).unwrap_err();
    assert_eq!(err.status(), PipeStatus::NotReady);
    mgr.ha_hw_read_complete(0).unwrap();
    mgr.mat_ent_add(sess, PHYS, ROUTE, route(1, 1)).unwrap();

    // A virtual device has no hardware to recover from
    let err = mgr.device_add(1, DeviceMode::Hitless).unwrap_err();
    assert_eq!(err.status(), PipeStatus::NotSupported);
}

#[test]
fn test_key_swap_on_full_table() {
    let mgr = switch();
    let sess = mgr.session_create().unwrap();
    for dst in 0..16 {
        mgr.mat_ent_add(sess, PHYS, ROUTE, route(dst, 1)).unwrap();
    }
    mgr.complete_operations(sess).unwrap();

    // One key is replaced, so the add needs the slot the delete frees
    let mgr = restart(mgr);
    let sess = mgr.session_create().unwrap();
    for dst in 0..15 {
        mgr.mat_ent_add(sess, PHYS, ROUTE, route(dst, 1)).unwrap();
    }
    let added = mgr.mat_ent_add(sess, PHYS, ROUTE, route(100, 1)).unwrap();

    let (report, executed) = converge(&mgr);
    let routes = table_report(&report, ROUTE, PipeScope::All);
    assert_eq!(routes.deleted, 1);
    assert_eq!(routes.added, 1);
    assert_eq!(executed, 2);
    assert_eq!(hw_mat_count(&mgr, ROUTE, PipeScope::All), 16);
    assert_eq!(mgr.mat_ent_get(PHYS, ROUTE, added).unwrap(), route(100, 1));
}

#[test]
fn test_rejected_replay_keeps_handle_sequence() {
    let mgr = switch();
    let sess = mgr.session_create().unwrap();
    let h1 = mgr.mat_ent_add(sess, PHYS, ROUTE, route(1, 1)).unwrap();
    let h2 = mgr.mat_ent_add(sess, PHYS, ROUTE, route(2, 2)).unwrap();
    mgr.complete_operations(sess).unwrap();

    let mgr = restart(mgr);
    let sess = mgr.session_create().unwrap();
    assert_eq!(mgr.mat_ent_add(sess, PHYS, ROUTE, route(1, 1)).unwrap(), h1);
    let err = mgr.mat_ent_add(sess, PHYS, ROUTE, route(1, 5)).unwrap_err();
    assert_eq!(err.status(), PipeStatus::AlreadyExists);
    assert_eq!(mgr.mat_ent_add(sess, PHYS, ROUTE, route(2, 2)).unwrap(), h2);

    let (report, executed) = converge(&mgr);
    assert_eq!(report.delta_moves(), 0);
    assert_eq!(executed, 0);
}
