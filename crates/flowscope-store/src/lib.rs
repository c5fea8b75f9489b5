//! Two-tier flow storage
//!
//! - [`memory`]: bounded in-memory hot store with terminal-only eviction
//! - [`file`]: append-only JSONL shards behind a single writer task
//! - [`index`]: per-day and global SQLite side indexes with preview FTS
//! - [`shard`]: day-sharded files, rotation, gzip read-through
//! - [`replay`]: startup crash recovery and index reconciliation
//! - [`retention`]: scheduled reclamation of old day folders
//! - [`entities`]: CRUD for sessions, quick filters, bookmarks

pub mod entities;
pub mod file;
pub mod index;
pub mod memory;
pub mod replay;
pub mod retention;
pub mod shard;

pub use entities::EntityStore;
pub use file::{FileStore, FileStoreConfig};
pub use index::{Candidate, IndexQuery, IndexRow};
pub use memory::{MemoryStore, SharedFlow};
pub use replay::ReplayReport;
pub use retention::{run_retention_once, spawn_retention_task, RetentionStats};
