//! Sweeping against live transactions, through the full runtime.
//!
//! The safety property under test: a sweep may only delete versions
//! that no open or future snapshot can read.

use std::time::{Duration, Instant};

use meridian_common::types::Value;
use meridian_common::MeridianError;
use meridian_kvs::{ConflictHandler, KeyValueService, SweepStrategy, TableSchema};
use meridian_server::MeridianConfig;
use meridian_sweep::{KvsBackedPersistentLockService, PersistentLockService, SweepRequest};
use meridian_test::{cell, TestCluster};

fn sweep_request(table_name: String) -> SweepRequest {
    SweepRequest {
        table_name,
        ..SweepRequest::default()
    }
}

#[test]
fn test_sweep_never_hides_data_from_open_snapshots() {
    let cluster = TestCluster::single().unwrap();
    let table = cluster.create_table("accounts", "balances").unwrap();
    let manager = cluster.transactions();
    let target = cell("alice", "balance");

    for value in [&b"v1"[..], &b"v2"[..]] {
        manager
            .run(|txn| txn.put(&table, target.clone(), Value::from_bytes(value)))
            .unwrap();
    }
    let reader = manager.begin().unwrap();
    manager
        .run(|txn| txn.put(&table, target.clone(), Value::from_bytes(b"v3")))
        .unwrap();

    let response = cluster
        .runtime()
        .sweeper()
        .sweep(&sweep_request(table.qualified_name()))
        .unwrap();
    assert_eq!(response.cell_ts_pairs_deleted, 1, "only v1 is unreachable");

    // The open snapshot predates v3 and must still resolve to v2.
    assert_eq!(
        reader.get(&table, &target).unwrap(),
        Some(Value::from_bytes(b"v2"))
    );
    let fresh = manager.run(|txn| txn.get(&table, &target)).unwrap();
    assert_eq!(fresh, Some(Value::from_bytes(b"v3")));
}

#[test]
fn test_sweep_after_snapshot_closes_reclaims_the_rest() {
    let cluster = TestCluster::single().unwrap();
    let table = cluster.create_table("accounts", "balances").unwrap();
    let manager = cluster.transactions();
    let target = cell("alice", "balance");

    for value in [&b"v1"[..], &b"v2"[..], &b"v3"[..]] {
        manager
            .run(|txn| txn.put(&table, target.clone(), Value::from_bytes(value)))
            .unwrap();
    }

    cluster
        .runtime()
        .sweeper()
        .sweep(&sweep_request(table.qualified_name()))
        .unwrap();
    let remaining = cluster.kvs().get_all_timestamps(&table, &target).unwrap();
    assert_eq!(remaining.len(), 1, "only the newest version survives");

    let read = manager.run(|txn| txn.get(&table, &target)).unwrap();
    assert_eq!(read, Some(Value::from_bytes(b"v3")));
}

#[test]
fn test_thorough_sweep_removes_committed_tombstones() {
    let cluster = TestCluster::single().unwrap();
    let table = cluster
        .create_table_with_schema(
            "accounts",
            "balances",
            TableSchema::new(ConflictHandler::RetryOnWriteWrite, SweepStrategy::Thorough),
        )
        .unwrap();
    let manager = cluster.transactions();
    let target = cell("alice", "balance");

    manager
        .run(|txn| txn.put(&table, target.clone(), Value::from_bytes(b"v1")))
        .unwrap();
    manager
        .run(|txn| txn.delete(&table, target.clone()))
        .unwrap();

    cluster
        .runtime()
        .sweeper()
        .sweep(&sweep_request(table.qualified_name()))
        .unwrap();

    let remaining = cluster.kvs().get_all_timestamps(&table, &target).unwrap();
    assert!(remaining.is_empty(), "left {remaining:?}");
    assert_eq!(manager.run(|txn| txn.get(&table, &target)).unwrap(), None);
}

#[test]
fn test_conservative_sweep_keeps_the_tombstone() {
    let cluster = TestCluster::single().unwrap();
    let table = cluster.create_table("accounts", "balances").unwrap();
    let manager = cluster.transactions();
    let target = cell("alice", "balance");

    manager
        .run(|txn| txn.put(&table, target.clone(), Value::from_bytes(b"v1")))
        .unwrap();
    manager
        .run(|txn| txn.delete(&table, target.clone()))
        .unwrap();

    cluster
        .runtime()
        .sweeper()
        .sweep(&sweep_request(table.qualified_name()))
        .unwrap();

    let remaining = cluster.kvs().get_all_timestamps(&table, &target).unwrap();
    assert_eq!(remaining.len(), 1, "the tombstone stays under Conservative");
}

#[test]
fn test_unsweepable_tables_are_refused() {
    let cluster = TestCluster::single().unwrap();
    let table = cluster
        .create_table_with_schema(
            "audit",
            "log",
            TableSchema::new(ConflictHandler::IgnoreAll, SweepStrategy::Nothing),
        )
        .unwrap();

    let err = cluster
        .runtime()
        .sweeper()
        .sweep(&sweep_request(table.qualified_name()))
        .unwrap_err();
    assert!(matches!(err, MeridianError::TableNotSweepable { .. }));
}

#[test]
fn test_manual_sweep_ignores_the_backup_lock() {
    let cluster = TestCluster::single().unwrap();
    let table = cluster.create_table("accounts", "balances").unwrap();
    let manager = cluster.transactions();
    let target = cell("alice", "balance");

    for value in [&b"v1"[..], &b"v2"[..]] {
        manager
            .run(|txn| txn.put(&table, target.clone(), Value::from_bytes(value)))
            .unwrap();
    }

    // A backup holds the persistent lock; only the background loop
    // defers to it.
    let lock_service = KvsBackedPersistentLockService::create(cluster.kvs() as _).unwrap();
    let entry = lock_service.acquire_backup_lock("nightly backup").unwrap();

    let response = cluster
        .runtime()
        .sweeper()
        .sweep(&sweep_request(table.qualified_name()))
        .unwrap();
    assert_eq!(response.cell_ts_pairs_deleted, 1);

    lock_service.release_backup_lock(&entry).unwrap();
}

#[test]
fn test_background_sweeper_reclaims_old_versions() {
    meridian_test::init_test_logging();
    let mut config = MeridianConfig::default();
    config.sweep.pause_millis = 20;
    let cluster = TestCluster::with_config(config).unwrap();
    let table = cluster.create_table("accounts", "balances").unwrap();
    let manager = cluster.transactions();
    let target = cell("alice", "balance");

    for value in [&b"v1"[..], &b"v2"[..], &b"v3"[..]] {
        manager
            .run(|txn| txn.put(&table, target.clone(), Value::from_bytes(value)))
            .unwrap();
    }
    assert!(cluster.runtime().background_sweep_running());

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let remaining = cluster.kvs().get_all_timestamps(&table, &target).unwrap();
        if remaining.len() == 1 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "background sweeper left {remaining:?}"
        );
        std::thread::sleep(Duration::from_millis(20));
    }

    let read = manager.run(|txn| txn.get(&table, &target)).unwrap();
    assert_eq!(read, Some(Value::from_bytes(b"v3")));
}
