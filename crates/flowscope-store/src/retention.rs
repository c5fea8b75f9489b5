//! Retention GC and shard compression
//!
//! An hourly task deletes day folders older than the configured retention,
//! purges their rows from the global index, and gzips shards in day folders
//! that are closed but not yet reclaimed. The current day is never touched.

use crate::file::FileStore;
use crate::shard;
use chrono::{DateTime, NaiveDate, Utc};
use flowscope_core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::task::JoinHandle;

#[derive(Debug, Default, Clone)]
pub struct RetentionStats {
    pub days_deleted: u32,
    pub rows_purged: u64,
    pub shards_compressed: u32,
    pub bytes_freed: u64,
    pub disk_usage_bytes: u64,
}

/// Sidecar written after every GC run.
#[derive(Debug, Serialize, Deserialize)]
struct RetentionMeta {
    last_gc: DateTime<Utc>,
    disk_usage_bytes: u64,
}

pub async fn run_retention_once(store: &FileStore, retention_days: u32) -> Result<RetentionStats> {
    let flows_root = store.flows_root().to_path_buf();
    let today = shard::today();
    let today_date = parse_day(&today)?;
    let cutoff = today_date
        .checked_sub_days(chrono::Days::new(retention_days as u64))
        .ok_or_else(|| Error::Storage("retention cutoff underflow".to_string()))?;

    let days = {
        let flows_root = flows_root.clone();
        tokio::task::spawn_blocking(move || shard::list_day_dirs(&flows_root))
            .await
            .map_err(|e| Error::Storage(format!("retention scan task failed: {e}")))??
    };

    let mut stats = RetentionStats::default();
    for day in days {
        if day == today {
            continue;
        }
        let Ok(date) = parse_day(&day) else {
            continue;
        };

        if date < cutoff {
            stats.rows_purged += store.global().delete_day(&day).await?;
            store.forget_day_index(&day);
            let dir = shard::day_dir(&flows_root, &day);
            let freed = tokio::task::spawn_blocking(move || -> Result<u64> {
                let bytes = shard::total_size(&dir)?;
                std::fs::remove_dir_all(&dir)?;
                Ok(bytes)
            })
            .await
            .map_err(|e| Error::Storage(format!("retention delete task failed: {e}")))??;
            stats.days_deleted += 1;
            stats.bytes_freed += freed;
            tracing::info!(day = %day, bytes = freed, "reclaimed day folder");
        } else {
            stats.shards_compressed += compress_closed_day(&flows_root, &day).await?;
        }
    }

    stats.disk_usage_bytes = {
        let flows_root = flows_root.clone();
        tokio::task::spawn_blocking(move || shard::total_size(&flows_root))
            .await
            .map_err(|e| Error::Storage(format!("disk usage task failed: {e}")))??
    };
    write_meta(&flows_root, stats.disk_usage_bytes).await?;

    Ok(stats)
}

/// Gzip shard files in a closed day folder. Idempotent; already-compressed
/// shards are skipped.
async fn compress_closed_day(flows_root: &std::path::Path, day: &str) -> Result<u32> {
    let day_path = shard::day_dir(flows_root, day);
    let files = {
        let day_path = day_path.clone();
        tokio::task::spawn_blocking(move || shard::list_shard_files(&day_path))
            .await
            .map_err(|e| Error::Storage(format!("compression scan task failed: {e}")))??
    };

    let mut compressed = 0;
    for file in files {
        if file.ends_with(".gz") {
            continue;
        }
        let path = day_path.join(&file);
        let saved = tokio::task::spawn_blocking(move || shard::compress_shard(&path))
            .await
            .map_err(|e| Error::Storage(format!("compression task failed: {e}")))??;
        compressed += 1;
        tracing::debug!(day = %day, file = %file, saved, "compressed shard");
    }
    Ok(compressed)
}

async fn write_meta(flows_root: &std::path::Path, disk_usage_bytes: u64) -> Result<()> {
    let meta = RetentionMeta {
        last_gc: Utc::now(),
        disk_usage_bytes,
    };
    let path = flows_root.join("retention.meta");
    tokio::fs::write(&path, serde_json::to_vec_pretty(&meta)?).await?;
    Ok(())
}

fn parse_day(day: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .map_err(|e| Error::Storage(format!("bad day folder name {day}: {e}")))
}

/// Spawn the hourly GC loop. The handle aborts with the process; callers
/// keep it only to cancel in tests.
pub fn spawn_retention_task(
    store: FileStore,
    retention_days: u32,
    interval: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            match run_retention_once(&store, retention_days).await {
                Ok(stats) if stats.days_deleted > 0 || stats.shards_compressed > 0 => {
                    tracing::info!(
                        days_deleted = stats.days_deleted,
                        rows_purged = stats.rows_purged,
                        shards_compressed = stats.shards_compressed,
                        "retention pass complete"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "retention pass failed");
                }
            }
        }
    })
}

/// Resolve the retention meta path for observability surfaces.
pub fn meta_path(flows_root: &std::path::Path) -> PathBuf {
    flows_root.join("retention.meta")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileStoreConfig;
    use tempfile::TempDir;

    #[tokio::test]
    async fn gc_on_empty_repository_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path(), FileStoreConfig::default())
            .await
            .unwrap();
        let stats = run_retention_once(&store, 7).await.unwrap();
        assert_eq!(stats.days_deleted, 0);
        assert_eq!(stats.rows_purged, 0);
        assert!(meta_path(store.flows_root()).exists());
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn old_day_folders_are_reclaimed() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path(), FileStoreConfig::default())
            .await
            .unwrap();

        // Fabricate an ancient day folder with an indexed row
        let old_day = "2020-01-01";
        let day_dir = shard::day_dir(store.flows_root(), old_day);
        std::fs::create_dir_all(&day_dir).unwrap();
        std::fs::write(day_dir.join("flows.jsonl"), b"{}\n").unwrap();

        let stats = run_retention_once(&store, 7).await.unwrap();
        assert_eq!(stats.days_deleted, 1);
        assert!(!day_dir.exists());
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn current_day_is_never_touched() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path(), FileStoreConfig::default())
            .await
            .unwrap();

        let today_dir = shard::day_dir(store.flows_root(), &shard::today());
        std::fs::create_dir_all(&today_dir).unwrap();
        std::fs::write(today_dir.join("flows.jsonl"), b"{}\n").unwrap();

        // Retention of zero days would reclaim everything else
        let stats = run_retention_once(&store, 0).await.unwrap();
        assert_eq!(stats.days_deleted, 0);
        assert!(today_dir.join("flows.jsonl").exists());
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn closed_days_get_compressed() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path(), FileStoreConfig::default())
            .await
            .unwrap();

        let yesterday = (Utc::now().date_naive() - chrono::Days::new(1))
            .format("%Y-%m-%d")
            .to_string();
        let day_dir = shard::day_dir(store.flows_root(), &yesterday);
        std::fs::create_dir_all(&day_dir).unwrap();
        std::fs::write(day_dir.join("flows.jsonl"), b"{\"x\":1}\n").unwrap();

        let stats = run_retention_once(&store, 7).await.unwrap();
        assert_eq!(stats.shards_compressed, 1);
        assert!(day_dir.join("flows.jsonl.gz").exists());
        assert!(!day_dir.join("flows.jsonl").exists());
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn meta_records_last_gc() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path(), FileStoreConfig::default())
            .await
            .unwrap();
        run_retention_once(&store, 7).await.unwrap();
        let raw = std::fs::read_to_string(meta_path(store.flows_root())).unwrap();
        let meta: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(meta.get("last_gc").is_some());
        assert!(meta.get("disk_usage_bytes").is_some());
        store.shutdown().await.unwrap();
    }
}
