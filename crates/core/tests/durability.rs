// DotStore
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Durability behavior against real files: corruption containment in
//! chunked mode, fatal corruption in single-file mode, drift detection,
//! and background flush convergence.

use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use dotstore_core::query::Filter;
use dotstore_core::{DocumentStore, Record, StorageMode, StoreConfig, StoreError, SyncConfig, WriteOptions};

fn record(value: serde_json::Value) -> Record {
    dotstore_common::record_from_value(value).unwrap()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn rows(n: usize) -> Vec<Record> {
    (0..n).map(|i| record(json!({"id": i, "name": format!("row-{i}")}))).collect()
}

/// Every table goes chunked, one record per chunk file.
fn chunk_heavy_config(dir: &TempDir) -> StoreConfig {
    let mut config = StoreConfig::with_root(dir.path());
    config.single_file_threshold = 0;
    config.chunk.max_chunk_bytes = 1;
    config
}

fn flip_byte(path: &std::path::Path) {
    let mut bytes = std::fs::read(path).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xFF;
    std::fs::write(path, bytes).unwrap();
}

#[tokio::test]
async fn test_chunk_corruption_is_contained() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = DocumentStore::open(chunk_heavy_config(&dir)).await.unwrap();
    store.create_table_with("events", &rows(5)).await.unwrap();
    store.close().await.unwrap();

    flip_byte(&dir.path().join("events").join("000002.db"));

    let store = DocumentStore::open(chunk_heavy_config(&dir)).await.unwrap();
    let report = store.read_report("events").await.unwrap();
    assert_eq!(report.skipped_chunks, 1);
    assert_eq!(report.records.len(), 4);
    // The damaged chunk's record is gone, the rest survive intact.
    assert!(report.records.iter().all(|r| r.get("id") != Some(&json!(2))));
    assert!(report.records.iter().any(|r| r.get("name") == Some(&json!("row-4"))));
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_chunk_corruption_surfaces_as_drift() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = DocumentStore::open(chunk_heavy_config(&dir)).await.unwrap();
    store.create_table_with("events", &rows(4)).await.unwrap();
    store.close().await.unwrap();

    flip_byte(&dir.path().join("events").join("000001.db"));

    let store = DocumentStore::open(chunk_heavy_config(&dir)).await.unwrap();
    let drift = store.verify("events").await.unwrap();
    assert!(!drift.consistent());
    assert_eq!(drift.recorded, 4);
    assert_eq!(drift.actual, 3);

    let all = store.verify_all().await.unwrap();
    assert!(all.iter().any(|d| d.table == "events" && !d.consistent()));
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_missing_chunk_file_is_skipped() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = DocumentStore::open(chunk_heavy_config(&dir)).await.unwrap();
    store.create_table_with("events", &rows(3)).await.unwrap();
    store.close().await.unwrap();

    std::fs::remove_file(dir.path().join("events").join("000000.db")).unwrap();

    let store = DocumentStore::open(chunk_heavy_config(&dir)).await.unwrap();
    let report = store.read_report("events").await.unwrap();
    assert_eq!(report.skipped_chunks, 1);
    assert_eq!(report.records.len(), 2);
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_single_file_corruption_is_fatal() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = DocumentStore::open(StoreConfig::with_root(dir.path())).await.unwrap();
    store.create_table_with("settings", &rows(2)).await.unwrap();
    store.close().await.unwrap();

    flip_byte(&dir.path().join("settings.db"));

    let store = DocumentStore::open(StoreConfig::with_root(dir.path())).await.unwrap();
    let err = store.read("settings").await.unwrap_err();
    assert!(matches!(err, StoreError::CorruptedData(_)));
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_catalog_corruption_rebuilds_from_scan() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = DocumentStore::open(StoreConfig::with_root(dir.path())).await.unwrap();
    store.create_table_with("alpha", &rows(3)).await.unwrap();
    store.create_table_with("beta", &rows(1)).await.unwrap();
    store.close().await.unwrap();

    flip_byte(&dir.path().join("catalog.db"));

    let store = DocumentStore::open(StoreConfig::with_root(dir.path())).await.unwrap();
    let mut names: Vec<String> = store.tables().into_iter().map(|t| t.name).collect();
    names.sort();
    assert_eq!(names, vec!["alpha", "beta"]);
    assert_eq!(store.read("alpha").await.unwrap().len(), 3);
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_migration_preserves_records() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = DocumentStore::open(StoreConfig::with_root(dir.path())).await.unwrap();
    store.create_table_with("logs", &rows(10)).await.unwrap();
    assert_eq!(store.tables()[0].mode, StorageMode::Single);

    store.migrate("logs", StorageMode::Chunked).await.unwrap();
    assert!(dir.path().join("logs").is_dir());
    assert!(!dir.path().join("logs.db").exists());

    let records = store.read("logs").await.unwrap();
    assert_eq!(records, rows(10));
    assert!(store.verify("logs").await.unwrap().consistent());

    store.migrate("logs", StorageMode::Single).await.unwrap();
    assert!(dir.path().join("logs.db").exists());
    assert_eq!(store.read("logs").await.unwrap(), rows(10));
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_deferred_writes_converge_to_disk() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut config = StoreConfig::with_root(dir.path());
    config.sync = SyncConfig {
        interval: Duration::from_millis(50),
        min_dirty_items: 1,
        batch_size: 100,
        poll_period: Duration::from_millis(10),
        retry_attempts: 2,
    };
    let store = DocumentStore::open(config).await.unwrap();
    store.create_table("queue").await.unwrap();
    store.write("queue", &rows(3), WriteOptions::append().deferred()).await.unwrap();

    // Deferred data is readable immediately from the cache.
    assert_eq!(store.read("queue").await.unwrap().len(), 3);

    // Wait for the background service to flush it.
    let mut synced = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if store.stats().await.sync.sync_count > 0 {
            synced = true;
            break;
        }
    }
    assert!(synced, "auto-sync never fired");
    store.close().await.unwrap();

    let reopened = DocumentStore::open(StoreConfig::with_root(dir.path())).await.unwrap();
    assert_eq!(reopened.read("queue").await.unwrap(), rows(3));
    assert_eq!(reopened.count("queue").await.unwrap(), 3);
    reopened.close().await.unwrap();
}

#[tokio::test]
async fn test_close_flushes_pending_writes() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = DocumentStore::open(StoreConfig::with_root(dir.path())).await.unwrap();
    store.create_table("queue").await.unwrap();
    // Default sync interval is far longer than this test; close must
    // drain what the service has not yet flushed.
    store.write("queue", &rows(2), WriteOptions::append().deferred()).await.unwrap();
    store.close().await.unwrap();

    let reopened = DocumentStore::open(StoreConfig::with_root(dir.path())).await.unwrap();
    assert_eq!(reopened.read("queue").await.unwrap(), rows(2));
    reopened.close().await.unwrap();
}

#[tokio::test]
async fn test_update_on_filtered_subset_persists() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = DocumentStore::open(chunk_heavy_config(&dir)).await.unwrap();
    store.create_table_with("events", &rows(6)).await.unwrap();

    let touched = store.update("events", &record(json!({"name": "renamed"})), Some(&Filter::cmp("id", dotstore_core::CmpOp::Gte, json!(4)))).await.unwrap();
    assert_eq!(touched, 2);
    store.close().await.unwrap();

    let store = DocumentStore::open(chunk_heavy_config(&dir)).await.unwrap();
    let renamed = store.find("events", Some(&Filter::eq("name", json!("renamed"))), None).await.unwrap();
    assert_eq!(renamed.len(), 2);
    store.close().await.unwrap();
}
