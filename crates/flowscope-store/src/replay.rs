//! Startup replay and crash recovery
//!
//! Each shard is scanned line by line. The recovery point is the last
//! fully-written line: a trailing partial record (or anything after a
//! corrupt line) is truncated away, index rows pointing past the recovery
//! point are purged, and fully-written lines missing from the index are
//! re-inserted in one transaction per shard. Tombstoned ids are skipped;
//! an explicit purge survives a restart even though its line is still in
//! the shard.

use crate::file::FileStore;
use crate::index::IndexRow;
use crate::shard::{self, AppendLocation};
use flowscope_core::error::{Error, Result};
use flowscope_core::flow::Flow;
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Default, Clone)]
pub struct ReplayReport {
    pub repaired_shards: u32,
    pub discarded_lines: u32,
    pub recovered_rows: u32,
}

struct ShardScan {
    /// Fully-written flows with their byte offsets.
    good: Vec<(u64, Flow)>,
    /// Byte length of the valid prefix.
    valid_len: u64,
    file_len: u64,
    discarded_lines: u32,
}

pub async fn replay(store: &FileStore) -> Result<ReplayReport> {
    let flows_root = store.flows_root().to_path_buf();
    let days =
        tokio::task::spawn_blocking(move || shard::list_day_dirs(&flows_root))
            .await
            .map_err(|e| Error::Storage(format!("replay scan task failed: {e}")))??;

    let global_tombstones = store.global().deleted_ids().await?;

    let mut report = ReplayReport::default();
    for day in days {
        replay_day(store, &day, &global_tombstones, &mut report).await?;
    }
    Ok(report)
}

async fn replay_day(
    store: &FileStore,
    day: &str,
    global_tombstones: &HashSet<String>,
    report: &mut ReplayReport,
) -> Result<()> {
    let day_path = shard::day_dir(store.flows_root(), day);
    let files = {
        let day_path = day_path.clone();
        tokio::task::spawn_blocking(move || shard::list_shard_files(&day_path))
            .await
            .map_err(|e| Error::Storage(format!("replay scan task failed: {e}")))??
    };

    let day_db = store.day_index(day).await?;
    // Either index may have survived the crash; believe both sets
    let mut tombstones = day_db.deleted_ids().await?;
    tombstones.extend(global_tombstones.iter().cloned());

    for file in files {
        // Gzipped shards were sealed by retention after a clean day; only
        // writable shards can hold a torn record.
        if file.ends_with(".gz") {
            continue;
        }

        let scan = {
            let path = day_path.join(&file);
            tokio::task::spawn_blocking(move || scan_shard(&path))
                .await
                .map_err(|e| Error::Storage(format!("replay scan task failed: {e}")))??
        };

        if scan.valid_len < scan.file_len {
            let path = day_path.join(&file);
            let valid_len = scan.valid_len;
            tokio::task::spawn_blocking(move || shard::truncate_shard(&path, valid_len))
                .await
                .map_err(|e| Error::Storage(format!("replay truncate task failed: {e}")))??;
            report.repaired_shards += 1;
            report.discarded_lines += scan.discarded_lines;
            store.count_index_repair();
            tracing::warn!(
                day = %day,
                file = %file,
                dropped_bytes = scan.file_len - scan.valid_len,
                "truncated partial trailing record"
            );
        }

        // Purge index rows that point at or past the recovery point
        let purged = day_db.delete_rows_past(&file, scan.valid_len).await?;
        if !purged.is_empty() {
            store.global().delete_ids(&purged).await?;
        }

        // Re-insert fully-written lines the index does not know about,
        // unless the id was explicitly purged
        let known: HashSet<String> = day_db
            .rows_for_file(&file)
            .await?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        let missing: Vec<IndexRow> = scan
            .good
            .iter()
            .filter(|(_, flow)| !known.contains(&flow.id) && !tombstones.contains(&flow.id))
            .map(|(offset, flow)| {
                IndexRow::from_flow(
                    flow,
                    &AppendLocation {
                        day: day.to_string(),
                        file: file.clone(),
                        offset: *offset,
                    },
                )
            })
            .collect();
        if !missing.is_empty() {
            day_db.upsert_many(&missing).await?;
            store.global().upsert_many(&missing).await?;
            report.recovered_rows += missing.len() as u32;
        }
    }
    Ok(())
}

/// Walk a shard, stopping at the first record that is not a complete,
/// parseable, newline-terminated JSON line.
fn scan_shard(path: &Path) -> Result<ShardScan> {
    let bytes = std::fs::read(path)?;
    let file_len = bytes.len() as u64;
    let mut good = Vec::new();
    let mut valid_len: u64 = 0;
    let mut discarded = 0u32;
    let mut cursor = 0usize;

    while cursor < bytes.len() {
        let Some(newline) = bytes[cursor..].iter().position(|&b| b == b'\n') else {
            // Unterminated trailing record
            discarded += 1;
            break;
        };
        let line = &bytes[cursor..cursor + newline];
        match serde_json::from_slice::<Flow>(line) {
            Ok(flow) => {
                good.push((cursor as u64, flow));
                cursor += newline + 1;
                valid_len = cursor as u64;
            }
            Err(_) => {
                // Everything past a corrupt line is suspect
                discarded += 1;
                break;
            }
        }
    }

    Ok(ShardScan {
        good,
        valid_len,
        file_len,
        discarded_lines: discarded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{FileStore, FileStoreConfig};
    use flowscope_core::flow::{FlowMetadata, FlowRequest, FlowState, Message, RequestParams};
    use tempfile::TempDir;

    fn terminal_flow(content_tag: &str) -> Flow {
        let mut flow = Flow::new(
            FlowRequest {
                method: "POST".to_string(),
                path: "/v1/messages".to_string(),
                headers: vec![],
                body: serde_json::Value::Null,
                messages: vec![Message::text("user", content_tag)],
                system: None,
                tools: None,
                model: "claude-sonnet-4".to_string(),
                original_model: None,
                params: RequestParams::default(),
                body_bytes: 8,
                created_at: chrono::Utc::now(),
            },
            FlowMetadata::for_provider("anthropic"),
        );
        flow.transition(FlowState::Completed).unwrap();
        flow.seal_timestamps();
        flow
    }

    async fn open_and_settle(root: &Path, flows: Vec<Flow>) -> (FileStore, Vec<String>) {
        let store = FileStore::open(root, FileStoreConfig::default())
            .await
            .unwrap();
        let ids: Vec<String> = flows.iter().map(|f| f.id.clone()).collect();
        for flow in flows {
            store.enqueue(flow);
        }
        store.shutdown().await.unwrap();
        (store, ids)
    }

    #[tokio::test]
    async fn truncated_trailing_record_is_discarded() {
        let dir = TempDir::new().unwrap();
        let (_store, ids) = open_and_settle(
            dir.path(),
            vec![terminal_flow("a"), terminal_flow("b"), terminal_flow("c")],
        )
        .await;

        // Chop the closing brace and newline off the third record
        let day = shard::today();
        let shard_path = dir.path().join("flows").join(&day).join("flows.jsonl");
        let contents = std::fs::read(&shard_path).unwrap();
        std::fs::write(&shard_path, &contents[..contents.len() - 2]).unwrap();

        // Reopen: replay runs before the writer starts
        let store = FileStore::open(dir.path(), FileStoreConfig::default())
            .await
            .unwrap();

        assert!(store.get(&ids[0]).await.unwrap().is_some());
        assert!(store.get(&ids[1]).await.unwrap().is_some());
        assert!(store.get(&ids[2]).await.unwrap().is_none(), "torn record must be purged");
        assert_eq!(store.index_repairs(), 1);
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn missing_index_rows_are_recovered() {
        let dir = TempDir::new().unwrap();
        let (_store, ids) = open_and_settle(dir.path(), vec![terminal_flow("x")]).await;

        // Simulate a crash that lost the index but kept the shard
        let day = shard::today();
        let day_dir = dir.path().join("flows").join(&day);
        for name in ["index.sqlite", "index.sqlite-wal", "index.sqlite-shm"] {
            let _ = std::fs::remove_file(day_dir.join(name));
        }
        let flows_root = dir.path().join("flows");
        for name in ["global.sqlite", "global.sqlite-wal", "global.sqlite-shm"] {
            let _ = std::fs::remove_file(flows_root.join(name));
        }

        let store = FileStore::open(dir.path(), FileStoreConfig::default())
            .await
            .unwrap();
        let back = store.get(&ids[0]).await.unwrap();
        assert!(back.is_some(), "replay should reindex fully-written lines");
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn purged_flow_is_not_resurrected_by_replay() {
        let dir = TempDir::new().unwrap();
        let kept = terminal_flow("kept");
        let purged = terminal_flow("purged");
        let kept_id = kept.id.clone();
        let purged_id = purged.id.clone();

        let store = FileStore::open(dir.path(), FileStoreConfig::default())
            .await
            .unwrap();
        store.enqueue(kept);
        store.enqueue(purged);
        store.shutdown().await.unwrap();
        assert!(store.delete(&purged_id).await.unwrap());
        assert!(store.get(&purged_id).await.unwrap().is_none());

        // Restart: the purged line is still in the shard, but its
        // tombstone must keep replay from re-indexing it
        let store = FileStore::open(dir.path(), FileStoreConfig::default())
            .await
            .unwrap();
        assert!(store.get(&kept_id).await.unwrap().is_some());
        assert!(
            store.get(&purged_id).await.unwrap().is_none(),
            "an explicit purge must survive restart"
        );
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn purge_survives_a_lost_day_index() {
        let dir = TempDir::new().unwrap();
        let flow = terminal_flow("gone");
        let id = flow.id.clone();

        let store = FileStore::open(dir.path(), FileStoreConfig::default())
            .await
            .unwrap();
        store.enqueue(flow);
        store.shutdown().await.unwrap();
        assert!(store.delete(&id).await.unwrap());
        drop(store);

        // Crash takes the per-day index with it; the global tombstone
        // still blocks re-insertion
        let day = shard::today();
        let day_dir = dir.path().join("flows").join(&day);
        for name in ["index.sqlite", "index.sqlite-wal", "index.sqlite-shm"] {
            let _ = std::fs::remove_file(day_dir.join(name));
        }

        let store = FileStore::open(dir.path(), FileStoreConfig::default())
            .await
            .unwrap();
        assert!(store.get(&id).await.unwrap().is_none());
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn replay_on_empty_root_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path(), FileStoreConfig::default())
            .await
            .unwrap();
        assert_eq!(store.index_repairs(), 0);
        store.shutdown().await.unwrap();
    }
}
