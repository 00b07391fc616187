use thiserror::Error;

/// Database errors raised while counting or paging a queryable sheet
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Unsupported bind value for column '{column}': {reason}")]
    UnsupportedValue {
        column: String,
        reason: String,
    },
}

impl serde::Serialize for DbError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("DbError", 2)?;
        let kind = match self {
            DbError::Sqlx(_) => "Sqlx",
            DbError::Query(_) => "Query",
            DbError::InvalidIdentifier(_) => "InvalidIdentifier",
            DbError::UnsupportedValue { .. } => "UnsupportedValue",
        };
        state.serialize_field("type", kind)?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

/// Manual Clone implementation for DbError
impl Clone for DbError {
    fn clone(&self) -> Self {
        match self {
            DbError::Sqlx(err) => DbError::Query(format!("SQLx error: {}", err)),
            DbError::Query(s) => DbError::Query(s.clone()),
            DbError::InvalidIdentifier(s) => DbError::InvalidIdentifier(s.clone()),
            DbError::UnsupportedValue { column, reason } => DbError::UnsupportedValue {
                column: column.clone(),
                reason: reason.clone(),
            },
        }
    }
}

/// Errors raised by storage targets while finalizing an export
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown disk: {0}")]
    UnknownDisk(String),

    #[error("Invalid path component: {0}")]
    InvalidPathComponent(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Temporary artifact missing: {0}")]
    ArtifactMissing(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Validation errors for user supplied names (columns, tables, sheet titles)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Field '{field}' is required")]
    Required { field: String },

    #[error("Field '{field}' cannot exceed {max} characters")]
    MaxLength { field: String, max: usize },

    #[error("Field '{field}' contains invalid format: {reason}")]
    Format { field: String, reason: String },
}

impl ValidationError {
    pub fn required(field: &str) -> Self {
        Self::Required {
            field: field.to_string(),
        }
    }

    pub fn max_length(field: &str, max: usize) -> Self {
        Self::MaxLength {
            field: field.to_string(),
            max,
        }
    }

    pub fn format(field: &str, reason: &str) -> Self {
        Self::Format {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }
}
