//! Flowscope service wiring and command surface
//!
//! [`FlowscopeCore`] assembles the pipeline at startup: memory store, event
//! bus, file store, capture service, query service, entity store, and the
//! retention scheduler. There is no global singleton; shells and tests
//! instantiate their own core.

pub mod commands;
pub mod replay;
pub mod tracing;

pub use commands::{
    BatchReply, CommandError, CommandResult, CommandService, ExportArgs, ExportReply,
    ParseFilterReply, QueryFlowsArgs,
};
pub use replay::{BatchReplayResult, ReplayConfig, ReplayHandler, ReplayResult};
pub use crate::tracing::init_tracing;

use flowscope_bus::EventBus;
use flowscope_capture::CaptureService;
use flowscope_core::config::CoreConfig;
use flowscope_core::error::Result;
use flowscope_query::QueryService;
use flowscope_store::{
    spawn_retention_task, EntityStore, FileStore, FileStoreConfig, MemoryStore,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const RETENTION_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// The assembled observability core.
pub struct FlowscopeCore {
    config: CoreConfig,
    bus: EventBus,
    memory: Arc<MemoryStore>,
    files: FileStore,
    capture: Arc<CaptureService>,
    commands: CommandService,
    retention_task: JoinHandle<()>,
}

impl FlowscopeCore {
    /// Open storage under `root`, replay shards, and start the background
    /// workers.
    pub async fn start(root: &Path, config: CoreConfig) -> Result<Self> {
        Self::start_with_replay(root, config, None).await
    }

    pub async fn start_with_replay(
        root: &Path,
        config: CoreConfig,
        replay_handler: Option<Arc<dyn ReplayHandler>>,
    ) -> Result<Self> {
        config.validate()?;

        let bus = EventBus::new(config.subscriber_capacity);
        let memory = Arc::new(MemoryStore::new(config.memory_store_size));
        let files = FileStore::open(
            root,
            FileStoreConfig {
                queue_capacity: config.write_queue_capacity,
                max_shard_bytes: config.max_shard_bytes,
                ..Default::default()
            },
        )
        .await?;
        let entities = Arc::new(EntityStore::new(files.global_pool().clone()).await?);

        let capture = CaptureService::new(
            memory.clone(),
            bus.clone(),
            files.clone(),
            config.clone(),
        );
        let query = QueryService::new(memory.clone(), files.clone());
        let commands = CommandService::new(
            query,
            entities,
            bus.clone(),
            capture.clone(),
            config.clone(),
            replay_handler,
        );

        let retention_task =
            spawn_retention_task(files.clone(), config.retention_days, RETENTION_INTERVAL);

        ::tracing::info!(
            root = %root.display(),
            memory_size = config.memory_store_size,
            retention_days = config.retention_days,
            "flowscope core started"
        );

        Ok(Self {
            config,
            bus,
            memory,
            files,
            capture,
            commands,
            retention_task,
        })
    }

    /// The hooks the proxy drives.
    pub fn capture(&self) -> &Arc<CaptureService> {
        &self.capture
    }

    /// The verbs the UI drives.
    pub fn commands(&self) -> &CommandService {
        &self.commands
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    pub fn files(&self) -> &FileStore {
        &self.files
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Stop background work and flush pending writes.
    pub async fn shutdown(self) -> Result<()> {
        self.retention_task.abort();
        self.files.shutdown().await?;
        ::tracing::info!("flowscope core shutdown complete");
        Ok(())
    }
}
