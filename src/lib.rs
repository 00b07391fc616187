//! Chunked, resumable spreadsheet exports executed as sequential job chains.

// Public modules
pub mod domains;
pub mod errors;
pub mod globals;
pub mod validation;

pub use domains::export::{
    ChainHandle, ChainStatus, ExportConfig, ExportDefinition, ExportError, ExportResult,
    QueuedExportWriter, RowCollection, SerializedQuery, SheetDefinition, StoreOptions,
    WriterFormat,
};

/// Initialize logging and load the process configuration.
/// Call once at startup, before creating a [`QueuedExportWriter`].
pub fn initialize() -> ExportResult<&'static ExportConfig> {
    globals::init_logging();
    let config = globals::export_config()?;
    log::info!(
        "queued_sheet_export initialized (chunk size {}, {} concurrent chains)",
        config.chunk_size.get(),
        config.max_concurrent_chains
    );
    Ok(config)
}
