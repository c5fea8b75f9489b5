//! On-disk flow store
//!
//! A single writer task drains a bounded queue, appends each Flow as one
//! JSONL line, and upserts the per-day and global indexes. Enqueueing never
//! blocks: on overflow the oldest unwritten Flow is dropped and counted.
//! The in-memory copy survives until LRU eviction, it just is not durable.

use crate::index::{Candidate, IndexDb, IndexQuery, IndexRow};
use crate::shard::{self, ShardWriter};
use dashmap::DashMap;
use flowscope_core::error::{Error, Result};
use flowscope_core::flow::{Flow, FlowId};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct FileStoreConfig {
    pub queue_capacity: usize,
    pub max_shard_bytes: u64,
    pub flush_interval_ms: u64,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_shard_bytes: 64 * 1024 * 1024,
            flush_interval_ms: 500,
        }
    }
}

struct WriteQueue {
    entries: Mutex<VecDeque<Flow>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl WriteQueue {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            notify: Notify::new(),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Push, shedding the oldest unwritten entry on overflow.
    fn push(&self, flow: Flow) {
        {
            let mut entries = self.entries.lock().expect("write queue poisoned");
            if entries.len() >= self.capacity {
                if let Some(shed) = entries.pop_front() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        flow_id = %shed.id,
                        "write queue full, dropping oldest unwritten flow"
                    );
                }
            }
            entries.push_back(flow);
        }
        self.notify.notify_one();
    }

    async fn pop(&self) -> Option<Flow> {
        loop {
            let notified = self.notify.notified();
            if let Some(flow) = {
                let mut entries = self.entries.lock().expect("write queue poisoned");
                entries.pop_front()
            } {
                return Some(flow);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

struct Inner {
    flows_root: PathBuf,
    global: IndexDb,
    day_indices: DashMap<String, Arc<IndexDb>>,
    queue: WriteQueue,
    index_repairs: AtomicU64,
}

/// Handle to the on-disk tier. Cheap to clone.
#[derive(Clone)]
pub struct FileStore {
    inner: Arc<Inner>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl FileStore {
    /// Open the store under `<root>/flows`, replaying shards against the
    /// indexes before accepting writes.
    pub async fn open(root: &Path, config: FileStoreConfig) -> Result<Self> {
        let flows_root = root.join("flows");
        tokio::fs::create_dir_all(&flows_root).await?;
        let global = IndexDb::open_global(&flows_root.join("global.sqlite")).await?;

        let inner = Arc::new(Inner {
            flows_root,
            global,
            day_indices: DashMap::new(),
            queue: WriteQueue::new(config.queue_capacity),
            index_repairs: AtomicU64::new(0),
        });

        let store = Self {
            inner,
            worker: Arc::new(Mutex::new(None)),
        };

        let report = crate::replay::replay(&store).await?;
        if report.repaired_shards > 0 {
            tracing::warn!(
                repaired = report.repaired_shards,
                discarded = report.discarded_lines,
                recovered = report.recovered_rows,
                "startup replay repaired the index"
            );
        }

        let worker_inner = Arc::clone(&store.inner);
        let shard_writer = ShardWriter::new(store.inner.flows_root.clone(), config.max_shard_bytes);
        let handle = tokio::spawn(worker_loop(
            worker_inner,
            shard_writer,
            config.flush_interval_ms,
        ));
        *store.worker.lock().expect("worker slot poisoned") = Some(handle);

        Ok(store)
    }

    pub fn flows_root(&self) -> &Path {
        &self.inner.flows_root
    }

    pub(crate) fn global(&self) -> &IndexDb {
        &self.inner.global
    }

    /// Global index connection pool, shared with the entity store.
    pub fn global_pool(&self) -> &sqlx::sqlite::SqlitePool {
        self.inner.global.pool()
    }

    pub(crate) async fn day_index(&self, day: &str) -> Result<Arc<IndexDb>> {
        if let Some(existing) = self.inner.day_indices.get(day) {
            return Ok(existing.value().clone());
        }
        let path = shard::day_dir(&self.inner.flows_root, day).join("index.sqlite");
        let db = Arc::new(IndexDb::open_day(&path).await?);
        self.inner.day_indices.insert(day.to_string(), db.clone());
        Ok(db)
    }

    pub(crate) fn forget_day_index(&self, day: &str) {
        self.inner.day_indices.remove(day);
    }

    pub(crate) fn count_index_repair(&self) {
        self.inner.index_repairs.fetch_add(1, Ordering::Relaxed);
    }

    /// Queue a terminal Flow for persistence. Non-blocking.
    pub fn enqueue(&self, flow: Flow) {
        self.inner.queue.push(flow);
    }

    /// Flows shed from the write queue since open.
    pub fn dropped_writes(&self) -> u64 {
        self.inner.queue.dropped.load(Ordering::Relaxed)
    }

    /// Index repairs performed by startup replay.
    pub fn index_repairs(&self) -> u64 {
        self.inner.index_repairs.load(Ordering::Relaxed)
    }

    /// Point lookup: global index, day index, then one line off disk.
    pub async fn get(&self, id: &str) -> Result<Option<Flow>> {
        let Some(day) = self.inner.global.locate_day(id).await? else {
            return Ok(None);
        };
        self.hydrate(&Candidate {
            id: id.to_string(),
            day,
            created_at: String::new(),
        })
        .await
    }

    /// Read one candidate's Flow off disk.
    pub async fn hydrate(&self, candidate: &Candidate) -> Result<Option<Flow>> {
        let day_db = self.day_index(&candidate.day).await?;
        let Some((file, offset)) = day_db.locate(&candidate.id).await? else {
            return Ok(None);
        };
        let flows_root = self.inner.flows_root.clone();
        let day = candidate.day.clone();
        let line = tokio::task::spawn_blocking(move || {
            shard::read_line_at(&flows_root, &day, &file, offset)
        })
        .await
        .map_err(|e| Error::Storage(format!("hydration task failed: {e}")))??;

        let Some(line) = line else {
            return Ok(None);
        };
        match serde_json::from_str::<Flow>(&line) {
            Ok(flow) if flow.id == candidate.id => Ok(Some(flow)),
            Ok(other) => {
                tracing::warn!(
                    expected = %candidate.id,
                    found = %other.id,
                    "index offset pointed at the wrong flow"
                );
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(flow_id = %candidate.id, error = %e, "stored flow unparseable");
                Ok(None)
            }
        }
    }

    /// Candidate rows matching the pushed-down predicates.
    pub async fn candidates(&self, query: &IndexQuery) -> Result<Vec<Candidate>> {
        self.inner.global.candidates(query).await
    }

    /// Coarse FTS over previews; callers re-check hydrated flows.
    pub async fn search_previews(&self, text: &str, limit: usize) -> Result<Vec<FlowId>> {
        self.inner.global.search_previews(text, limit).await
    }

    /// Persist an annotation edit on a terminal Flow by re-appending it;
    /// the index follows the newest line.
    pub fn enqueue_annotation_update(&self, flow: Flow) {
        self.enqueue(flow);
    }

    /// Remove a flow from both indexes and tombstone the id. The JSONL
    /// line stays until its day folder is reclaimed; the tombstone keeps
    /// startup replay from re-indexing it.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let Some(day) = self.inner.global.locate_day(id).await? else {
            return Ok(false);
        };
        let ids = vec![id.to_string()];
        self.inner.global.delete_ids(&ids).await?;
        self.inner.global.mark_deleted(&ids, &day).await?;
        let day_db = self.day_index(&day).await?;
        day_db.delete_ids(&ids).await?;
        day_db.mark_deleted(&ids, &day).await?;
        Ok(true)
    }

    /// Drain the queue, flush the shard, and stop the writer.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.queue.close();
        let handle = self.worker.lock().expect("worker slot poisoned").take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| Error::Storage(format!("writer task panicked: {e}")))?;
        }
        tracing::info!("file store shutdown complete");
        Ok(())
    }
}

async fn worker_loop(inner: Arc<Inner>, mut shard: ShardWriter, flush_interval_ms: u64) {
    let mut tick =
        tokio::time::interval(std::time::Duration::from_millis(flush_interval_ms.max(10)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe = inner.queue.pop() => {
                match maybe {
                    Some(flow) => {
                        if let Err(e) = write_one(&inner, &mut shard, &flow).await {
                            tracing::error!(flow_id = %flow.id, error = %e, "failed to persist flow");
                        }
                    }
                    None => break,
                }
            }
            _ = tick.tick() => {
                if let Err(e) = shard.flush().await {
                    tracing::warn!(error = %e, "shard flush failed");
                }
            }
        }
    }

    if let Err(e) = shard.flush().await {
        tracing::warn!(error = %e, "final shard flush failed");
    }
    tracing::debug!("file store writer exited");
}

async fn write_one(inner: &Inner, shard: &mut ShardWriter, flow: &Flow) -> Result<()> {
    let line = serde_json::to_string(flow)?;
    let location = shard.append(&line).await?;
    let row = IndexRow::from_flow(flow, &location);

    let day_db = match inner.day_indices.get(&location.day) {
        Some(existing) => existing.value().clone(),
        None => {
            let path = shard::day_dir(&inner.flows_root, &location.day).join("index.sqlite");
            let db = Arc::new(IndexDb::open_day(&path).await?);
            inner.day_indices.insert(location.day.clone(), db.clone());
            db
        }
    };
    day_db.upsert(&row).await?;
    inner.global.upsert(&row).await?;
    Ok(())
}
