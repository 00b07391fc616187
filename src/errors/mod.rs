mod error;

pub use error::{DbError, StorageError, StorageResult, ValidationError};

/// Result type for database operations
pub type DbResult<T> = Result<T, DbError>;

/// Result type for validation checks
pub type ValidationResult<T> = Result<T, ValidationError>;
