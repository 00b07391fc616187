use crate::domains::export::assembler::{ChainTarget, SheetPipelineAssembler};
use crate::domains::export::dispatcher::JobChainDispatcher;
use crate::domains::export::executor::ExportUnitExecutor;
use crate::domains::export::hooks::{BeforeWritingHook, HookRegistry};
use crate::domains::export::queue_manager::{ChainHandle, ChainQueue, QueueStats, UnitProcessor};
use crate::domains::export::repository::{QuerySource, SqliteQuerySource};
use crate::domains::export::source::ExportDefinition;
use crate::domains::export::storage::{LocalDiskStorage, StorageTarget};
use crate::domains::export::types::*;
use crate::domains::export::writer::{SheetWriter, StagingWriter};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;

/// Per-call overrides for [`QueuedExportWriter::store_with`]
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub disk: Option<String>,
    pub format: Option<WriterFormat>,
    pub chunk_size: Option<ChunkSize>,
}

impl StoreOptions {
    pub fn disk(mut self, disk: impl Into<String>) -> Self {
        self.disk = Some(disk.into());
        self
    }

    pub fn format(mut self, format: WriterFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn chunk_size(mut self, chunk_size: ChunkSize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }
}

/// Entry point: turns an export definition into a dispatched chain.
pub struct QueuedExportWriter {
    config: ExportConfig,
    writer: Arc<dyn SheetWriter>,
    query_source: Arc<dyn QuerySource>,
    storage: Arc<dyn StorageTarget>,
    hooks: Arc<HookRegistry>,
    // Holds the only strong reference; the queue sees it weakly
    _processor: Arc<dyn UnitProcessor>,
    queue: Arc<ChainQueue>,
    dispatcher: JobChainDispatcher,
}

impl std::fmt::Debug for QueuedExportWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedExportWriter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl QueuedExportWriter {
    pub fn new(
        config: ExportConfig,
        writer: Arc<dyn SheetWriter>,
        query_source: Arc<dyn QuerySource>,
        storage: Arc<dyn StorageTarget>,
        hooks: Arc<HookRegistry>,
    ) -> ExportResult<Self> {
        config.validate()?;

        let processor: Arc<dyn UnitProcessor> = Arc::new(ExportUnitExecutor::new(
            writer.clone(),
            query_source.clone(),
            storage.clone(),
            hooks.clone(),
        ));
        let queue = Arc::new(ChainQueue::new(Arc::downgrade(&processor), &config));
        let dispatcher = JobChainDispatcher::new(queue.clone());

        Ok(Self {
            config,
            writer,
            query_source,
            storage,
            hooks,
            _processor: processor,
            queue,
            dispatcher,
        })
    }

    /// Local setup: SQLite for queryable sheets, staging under
    /// `config.temp_dir`, and `disk_root` as the default disk.
    pub fn local(config: ExportConfig, pool: SqlitePool, disk_root: impl Into<PathBuf>) -> ExportResult<Self> {
        let writer = Arc::new(StagingWriter::new(&config.temp_dir)?);
        let storage = Arc::new(LocalDiskStorage::new(&config.default_disk, disk_root)?);
        let query_source = Arc::new(SqliteQuerySource::new(pool));
        Self::new(
            config,
            writer,
            query_source,
            storage,
            Arc::new(HookRegistry::new()),
        )
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// Register a hook that exports can name in `before_writing`
    pub fn register_hook(&self, name: impl Into<String>, hook: Arc<dyn BeforeWritingHook>) {
        self.hooks.register(name, hook);
    }

    /// Queue an export of `export` to `destination`.
    ///
    /// The disk defaults to the configured one and the format is inferred from
    /// the destination's extension when not given.
    pub async fn store(
        &self,
        export: &ExportDefinition,
        destination: &str,
        disk: Option<&str>,
        format: Option<WriterFormat>,
    ) -> ExportResult<ChainHandle> {
        let options = StoreOptions {
            disk: disk.map(str::to_string),
            format,
            chunk_size: None,
        };
        self.store_with(export, destination, options).await
    }

    pub async fn store_with(
        &self,
        export: &ExportDefinition,
        destination: &str,
        options: StoreOptions,
    ) -> ExportResult<ChainHandle> {
        let format = match options.format {
            Some(format) => format,
            None => WriterFormat::from_destination(destination)?,
        };
        let disk = options
            .disk
            .unwrap_or_else(|| self.config.default_disk.clone());
        if !self.storage.has_disk(&disk) {
            return Err(ExportError::InvalidConfig(format!("unknown disk '{}'", disk)));
        }
        if let Some(name) = &export.before_writing {
            if !self.hooks.contains(name) {
                // Still dispatched: the hook may be registered before the unit runs
                log::warn!("Export names hook '{}' which is not registered yet", name);
            }
        }

        let mut assembler = SheetPipelineAssembler::new(self.query_source.clone(), &self.config);
        if let Some(chunk_size) = options.chunk_size {
            assembler = assembler.with_chunk_size(chunk_size);
        }

        let temp_file = self.writer.create_temp_file().await?;
        let target = ChainTarget::new(destination, disk);

        let dispatched = match assembler.assemble(export, &temp_file, format, &target).await {
            Ok(chain) => self.dispatcher.dispatch(export, chain).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &dispatched {
            log::error!("Export to {} was not dispatched: {}", destination, e);
            if let Err(discard_err) = self.writer.discard(&temp_file).await {
                log::warn!("Failed to discard staging artifact: {}", discard_err);
            }
        }
        dispatched
    }

    pub async fn stats(&self) -> QueueStats {
        self.queue.stats().await
    }
}
