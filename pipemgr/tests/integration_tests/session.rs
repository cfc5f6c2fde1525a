// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use tokio::sync::mpsc;
use pretty_assertions::assert_eq;

use crate::integration_tests::common::prelude::*;

#[test]
fn test_second_txn_rejected() {
    let mgr = switch();
    let sess = mgr.session_create().unwrap();
    mgr.begin_txn(sess, false).unwrap();
    mgr.mat_ent_add(sess, PHYS, ROUTE, route(1, 1)).unwrap();

    let err = mgr.begin_txn(sess, true).unwrap_err();
    assert_eq!(err.status(), PipeStatus::AlreadyExists);
    let err = mgr.begin_batch(sess).unwrap_err();
    assert_eq!(err.status(), PipeStatus::AlreadyExists);

    // The open transaction is untouched by the failed calls
    mgr.commit_txn(sess, true).unwrap();
    assert_eq!(mgr.mat_ent_get(PHYS, ROUTE, 1).unwrap(), route(1, 1));
}

#[test]
fn test_table_locked_between_sessions() {
    let mgr = switch();
    let a = mgr.session_create().unwrap();
    let b = mgr.session_create().unwrap();

    mgr.begin_txn(a, false).unwrap();
    mgr.mat_ent_add(a, PHYS, ROUTE, route(1, 1)).unwrap();

    let err = mgr.mat_ent_add(b, PHYS, ROUTE, route(2, 1)).unwrap_err();
    assert_eq!(err.status(), PipeStatus::TableLocked);
    // Other tables are still open to the second session
    mgr.adt_ent_add(b, PHYS, NEXTHOP, nexthop(1)).unwrap();

    mgr.commit_txn(a, true).unwrap();
    mgr.mat_ent_add(b, PHYS, ROUTE, route(2, 1)).unwrap();
}

#[test]
fn test_asymmetric_pipes_locked_separately() {
    let mgr = switch();
    let a = mgr.session_create().unwrap();
    let b = mgr.session_create().unwrap();
    let rule = |dst| MatEntry {
        priority: 10,
        ..route(dst, 1)
    };

    mgr.begin_batch(a).unwrap();
    mgr.mat_ent_add(a, DevTarget::pipe(0, 0), ACL, rule(1)).unwrap();
    mgr.mat_ent_add(b, DevTarget::pipe(0, 1), ACL, rule(1)).unwrap();
    let err = mgr
        .mat_ent_add(b, DevTarget::pipe(0, 0), ACL, rule(2))
        .unwrap_err();
    assert_eq!(err.status(), PipeStatus::TableLocked);
    mgr.end_batch(a, true).unwrap();
}

#[test]
fn test_abort_leaves_other_pipe_alone() {
    let mgr = switch();
    let a = mgr.session_create().unwrap();
    let b = mgr.session_create().unwrap();
    let (pipe0, pipe1) = (DevTarget::pipe(0, 0), DevTarget::pipe(0, 1));
    let rule = |dst| MatEntry {
        priority: 10,
        ..route(dst, 1)
    };

    mgr.begin_txn(a, false).unwrap();
    let aborted = mgr.mat_ent_add(a, pipe0, ACL, rule(1)).unwrap();
    let kept = mgr.mat_ent_add(b, pipe1, ACL, rule(1)).unwrap();
    mgr.abort_txn(a).unwrap();

    assert_eq!(
        mgr.mat_ent_get(pipe0, ACL, aborted).unwrap_err().status(),
        PipeStatus::ObjNotFound
    );
    assert_eq!(mgr.mat_ent_get(pipe1, ACL, kept).unwrap(), rule(1));
    assert_eq!(mgr.table_usage(0, ACL).unwrap().occupancy, 1);
}

#[test]
fn test_failure_on_other_pipe_keeps_open_txn() {
    let mgr = switch();
    let a = mgr.session_create().unwrap();
    let b = mgr.session_create().unwrap();
    let (pipe0, pipe1) = (DevTarget::pipe(0, 0), DevTarget::pipe(0, 1));
    let rule = |dst| MatEntry {
        priority: 10,
        ..route(dst, 1)
    };

    mgr.begin_txn(a, false).unwrap();
    let first = mgr.mat_ent_add(a, pipe0, ACL, rule(1)).unwrap();
    mgr.mat_ent_add(b, pipe1, ACL, rule(1)).unwrap();
    let err = mgr.mat_ent_add(b, pipe1, ACL, rule(1)).unwrap_err();
    assert_eq!(err.status(), PipeStatus::AlreadyExists);
    let second = mgr.mat_ent_add(a, pipe0, ACL, rule(2)).unwrap();
    mgr.commit_txn(a, true).unwrap();

    assert_eq!(mgr.mat_ent_get(pipe0, ACL, first).unwrap(), rule(1));
    assert_eq!(mgr.mat_ent_get(pipe0, ACL, second).unwrap(), rule(2));
    assert_eq!(mgr.table_usage(0, ACL).unwrap().occupancy, 3);
}

#[test]
fn test_destroy_aborts_open_txn() {
    let mgr = switch();
    let a = mgr.session_create().unwrap();
    let b = mgr.session_create().unwrap();

    mgr.begin_txn(a, false).unwrap();
    mgr.mat_ent_add(a, PHYS, ROUTE, route(1, 1)).unwrap();
    mgr.session_destroy(a).unwrap();

    // The aborted add is gone, and its reservation with it
    assert_eq!(mgr.table_usage(0, ROUTE).unwrap().occupancy, 0);
    mgr.mat_ent_add(b, PHYS, ROUTE, route(1, 1)).unwrap();
    assert_eq!(
        mgr.begin_txn(a, false).unwrap_err().status(),
        PipeStatus::SessionNotFound
    );
}

#[test]
fn test_update_notifications() {
    let mgr = switch();
    let sess = mgr.session_create().unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    mgr.table_register_updates(ROUTE, tx).unwrap();

    let hdl = mgr.mat_ent_add(sess, PHYS, ROUTE, route(1, 1)).unwrap();
    let update = rx.try_recv().unwrap();
    assert_eq!(update.kind, MoveKind::MatAdd);
    assert_eq!(update.hdl, Some(hdl));

    // Nothing is reported for a transaction until it commits
    mgr.begin_txn(sess, false).unwrap();
    mgr.mat_ent_del(sess, PHYS, ROUTE, hdl).unwrap();
    assert!(rx.try_recv().is_err());
    mgr.commit_txn(sess, true).unwrap();
    assert_eq!(rx.try_recv().unwrap().kind, MoveKind::MatDelete);

    // A failed operation reports nothing
    assert!(mgr.mat_ent_del(sess, PHYS, ROUTE, hdl).is_err());
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_start_from_config() {
    let path = std::env::temp_dir()
        .join(format!("pipemgr-test-{}.log", std::process::id()));
    let mut config = config();
    config.log_file = Some(path.to_string_lossy().to_string());
    let mgr = PipeMgr::start(config).unwrap();
    mgr.device_add(0, DeviceMode::Cold).unwrap();
    assert!(path.exists());
    drop(mgr);
    let _ = std::fs::remove_file(path);
}
