//! Error types for bridge-migrate.

use thiserror::Error;

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while migrating records.
///
/// Schema errors (`MissingColumn`) abort the current table. Every remote
/// failure is propagated as-is: nothing is retried and already copied
/// records are never rolled back.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration or CLI arguments.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An expected column is absent from a query result.
    #[error("Column '{column}' not found in {context}")]
    MissingColumn {
        /// Column name that was looked up.
        column: String,
        /// Where the lookup happened (table id, view id, ...).
        context: String,
    },

    /// A cell holds a value that cannot be interpreted.
    #[error("Invalid value '{value}' in column '{column}'")]
    InvalidValue {
        /// Column the value came from.
        column: String,
        /// Offending value, stringified.
        value: String,
    },

    /// The query service rejected or failed a table query.
    #[error("Query failed: {0}")]
    Query(String),

    /// A file-handle column could not be materialized locally.
    #[error("Download failed: {0}")]
    Download(String),

    /// Storing a file or creating a folder in the destination failed.
    #[error("Destination store failed: {0}")]
    Store(String),

    /// The file was stored but its object-store metadata was not replaced.
    ///
    /// The destination now holds an entity without synchronized metadata.
    #[error("Stored entity {entity_id} but metadata copy of s3://{bucket}/{key} failed: {message}")]
    MetadataSync {
        /// Destination entity that was created.
        entity_id: String,
        /// Backing bucket.
        bucket: String,
        /// Backing key.
        key: String,
        /// Underlying object-store failure.
        message: String,
    },

    /// Object-store call failed.
    #[error("Object store error: {0}")]
    ObjectStore(String),

    /// Authentication rejected by a remote service.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Remote service asked us to slow down (seconds until retry).
    #[error("Rate limited, retry after {0}s")]
    RateLimit(u64),

    /// Any other non-success response from a remote service.
    #[error("Remote service error: {0}")]
    Remote(String),

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Shorthand for a missing column error.
    pub fn missing_column(column: impl Into<String>, context: impl Into<String>) -> Self {
        Self::MissingColumn {
            column: column.into(),
            context: context.into(),
        }
    }

    /// Whether this error left the destination in a partially synchronized state.
    #[must_use]
    pub fn is_partial_sync(&self) -> bool {
        matches!(self, Self::MetadataSync { .. })
    }
}
