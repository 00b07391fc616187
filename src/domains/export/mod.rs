pub mod assembler;
pub mod dispatcher;
pub mod executor;
pub mod hooks;
pub mod planner;
pub mod queue_manager;
pub mod repository;
pub mod service;
pub mod source;
pub mod storage;
pub mod types;
pub mod units;
pub mod writer;
pub mod writers;

pub use assembler::{ChainHead, ChainTarget, ExportChain, SheetPipelineAssembler};
pub use dispatcher::{ExecutionSubstrate, JobChainDispatcher};
pub use executor::ExportUnitExecutor;
pub use hooks::{BeforeWritingHook, DocumentProperties, HookContext, HookRegistry};
pub use planner::{ChunkBounds, ChunkDescriptor, ChunkPlanner};
pub use queue_manager::{ChainHandle, ChainQueue, ChainStatus, QueueStats, RetryPolicy, UnitProcessor};
pub use repository::{QuerySource, SqliteQuerySource};
pub use service::{QueuedExportWriter, StoreOptions};
pub use source::{
    ExportDefinition, Operator, RowCollection, SerializedQuery, SheetDefinition, SheetLayout,
    SortDirection, ToRow,
};
pub use storage::{LocalDiskStorage, StorageTarget};
pub use types::{ChunkSize, ExportConfig, ExportError, ExportResult, Row, WriterFormat};
pub use units::{build_unit, ExportSnapshot, TempFile, WorkUnit};
pub use writer::{RenderedFile, SheetWriter, StagingWriter};
