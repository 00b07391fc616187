use crate::errors::{DbError, StorageError, ValidationError};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// A plain, writer-ready row: one JSON value per cell, in column order.
pub type Row = Vec<serde_json::Value>;

/// Result type for export operations
pub type ExportResult<T> = Result<T, ExportError>;

/// Output formats a queued export can be rendered to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WriterFormat {
    Csv { delimiter: u8, quote_char: u8 },
    Xlsx,
}

impl Default for WriterFormat {
    fn default() -> Self {
        Self::Xlsx
    }
}

impl WriterFormat {
    /// Comma separated CSV with double quotes.
    pub fn csv() -> Self {
        Self::Csv {
            delimiter: b',',
            quote_char: b'"',
        }
    }

    /// Get file extension for this format
    pub fn file_extension(&self) -> &'static str {
        match self {
            WriterFormat::Csv { .. } => "csv",
            WriterFormat::Xlsx => "xlsx",
        }
    }

    /// Whether the format can hold more than one sheet
    pub fn supports_multiple_sheets(&self) -> bool {
        matches!(self, WriterFormat::Xlsx)
    }

    /// Infer the writer format from a destination path's extension.
    pub fn from_destination(destination: &str) -> ExportResult<Self> {
        let extension = Path::new(destination)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());

        match extension.as_deref() {
            Some("xlsx") => Ok(WriterFormat::Xlsx),
            Some("csv") | Some("txt") => Ok(WriterFormat::csv()),
            Some(other) => Err(ExportError::InvalidConfig(format!(
                "No writer format registered for extension '.{}'",
                other
            ))),
            None => Err(ExportError::InvalidConfig(format!(
                "Cannot infer writer format for '{}' without an extension",
                destination
            ))),
        }
    }
}

/// Maximum number of rows carried by one data unit. Always at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct ChunkSize(NonZeroUsize);

impl ChunkSize {
    pub const DEFAULT: usize = 1000;

    pub fn new(size: usize) -> ExportResult<Self> {
        NonZeroUsize::new(size)
            .map(ChunkSize)
            .ok_or_else(|| ExportError::InvalidConfig("chunk size must be at least 1".to_string()))
    }

    pub fn get(&self) -> usize {
        self.0.get()
    }
}

impl Default for ChunkSize {
    fn default() -> Self {
        // 1000 is non-zero
        Self(NonZeroUsize::new(Self::DEFAULT).unwrap_or(NonZeroUsize::MIN))
    }
}

impl TryFrom<usize> for ChunkSize {
    type Error = ExportError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        ChunkSize::new(value)
    }
}

impl From<ChunkSize> for usize {
    fn from(value: ChunkSize) -> Self {
        value.get()
    }
}

/// Process-level export configuration, threaded explicitly through planning
/// and dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    pub chunk_size: ChunkSize,
    pub default_disk: String,
    pub temp_dir: PathBuf,
    pub max_concurrent_chains: usize,
    pub unit_max_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Emit one (empty) page unit for a queryable sheet whose count is zero.
    pub empty_query_emits_page: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            chunk_size: ChunkSize::default(),
            default_disk: "local".to_string(),
            temp_dir: std::env::temp_dir().join("queued_sheet_export"),
            max_concurrent_chains: 2,
            unit_max_attempts: 3,
            retry_backoff_ms: 250,
            empty_query_emits_page: false,
        }
    }
}

impl ExportConfig {
    /// Build a configuration from the environment (and `.env` when present).
    pub fn from_env() -> ExportResult<Self> {
        dotenv::dotenv().ok();
        let mut config = Self::default();

        if let Some(size) = read_env::<usize>("EXPORT_CHUNK_SIZE")? {
            config.chunk_size = ChunkSize::new(size)?;
        }
        if let Ok(disk) = std::env::var("EXPORT_DEFAULT_DISK") {
            config.default_disk = disk;
        }
        if let Ok(dir) = std::env::var("EXPORT_TEMP_DIR") {
            config.temp_dir = PathBuf::from(dir);
        }
        if let Some(max) = read_env::<usize>("EXPORT_MAX_CONCURRENT_CHAINS")? {
            config.max_concurrent_chains = max;
        }
        if let Some(attempts) = read_env::<u32>("EXPORT_UNIT_MAX_ATTEMPTS")? {
            config.unit_max_attempts = attempts;
        }
        if let Some(backoff) = read_env::<u64>("EXPORT_RETRY_BACKOFF_MS")? {
            config.retry_backoff_ms = backoff;
        }
        if let Some(flag) = read_env::<bool>("EXPORT_EMPTY_QUERY_EMITS_PAGE")? {
            config.empty_query_emits_page = flag;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ExportResult<()> {
        if self.max_concurrent_chains == 0 {
            return Err(ExportError::InvalidConfig(
                "max_concurrent_chains must be at least 1".to_string(),
            ));
        }
        if self.unit_max_attempts == 0 {
            return Err(ExportError::InvalidConfig(
                "unit_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.default_disk.trim().is_empty() {
            return Err(ExportError::InvalidConfig("default_disk cannot be empty".to_string()));
        }
        Ok(())
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn read_env<T: std::str::FromStr>(key: &str) -> ExportResult<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ExportError::InvalidConfig(format!("{} has an invalid value: '{}'", key, raw))),
        Err(_) => Ok(None),
    }
}

/// Error types for queued export operations
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
pub enum ExportError {
    /// Invalid export definition or configuration; raised before dispatch
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A row could not be normalized into a transportable unit
    #[error("Serialization error in sheet {sheet_index}, chunk {chunk}: {message}")]
    Serialization {
        sheet_index: usize,
        chunk: usize,
        message: String,
    },

    /// A value could not be encoded or decoded as JSON
    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("No before-writing hook registered under '{0}'")]
    HookNotRegistered(String),

    #[error("Hook '{name}' failed: {message}")]
    HookFailed { name: String, message: String },

    /// A unit exhausted its retries; the rest of the chain was abandoned
    #[error("Unit {position} ({unit}) failed: {message}")]
    UnitFailed {
        position: usize,
        unit: String,
        message: String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Communication channel closed")]
    ChannelClosed,

    #[error("Export queue is full")]
    QueueFull,
}

impl ExportError {
    /// Whether a unit failing with this error may succeed on another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExportError::Io(_) | ExportError::Database(_) | ExportError::Storage(_)
        )
    }
}

impl From<std::io::Error> for ExportError {
    fn from(error: std::io::Error) -> Self {
        ExportError::Io(error.to_string())
    }
}

impl From<DbError> for ExportError {
    fn from(error: DbError) -> Self {
        ExportError::Database(error.to_string())
    }
}

impl From<StorageError> for ExportError {
    fn from(error: StorageError) -> Self {
        ExportError::Storage(error.to_string())
    }
}

impl From<ValidationError> for ExportError {
    fn from(error: ValidationError) -> Self {
        ExportError::InvalidConfig(error.to_string())
    }
}

impl From<serde_json::Error> for ExportError {
    fn from(error: serde_json::Error) -> Self {
        ExportError::Encoding(error.to_string())
    }
}
