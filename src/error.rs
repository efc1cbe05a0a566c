//! Error types
//!
//! Three families, matching how a request can fail:
//!
//! - [`StoreError`]: the Record Store is unreachable, a query failed, or the
//!   table does not have the expected shape.
//! - [`InputError`]: a query-string value could not be coerced.
//! - [`ConfigError`]: the YAML config could not be read.
//! - [`ServeError`]: the server could not start.
//!
//! [`ApiError`] folds the first two together and decides the HTTP status.

use thiserror::Error;

/// Error type for database operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("Query error: {0}")]
    Query(#[from] diesel::result::Error),

    /// The table, or some of its columns, is missing.
    #[error("Table structure error: {}", describe_structure(.table, .missing, .existing))]
    Structure {
        table: String,
        /// Missing column names. Empty when the table itself is missing.
        missing: Vec<String>,
        /// What was found instead: tables when the table is missing, columns otherwise.
        existing: Vec<String>,
    },
}

fn describe_structure(table: &str, missing: &[String], existing: &[String]) -> String {
    if missing.is_empty() {
        format!(
            "table '{}' does not exist (existing tables: {})",
            table,
            list_or_none(existing)
        )
    } else {
        format!(
            "table '{}' is missing columns: {} (existing columns: {})",
            table,
            missing.join(", "),
            list_or_none(existing)
        )
    }
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}

/// A query-string value that could not be coerced to what its filter needs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("invalid integer '{value}' for parameter '{param}'")]
    InvalidInteger { param: &'static str, value: String },

    #[error("invalid date '{value}' for parameter '{param}' (expected YYYY-MM-DD)")]
    InvalidDate { param: &'static str, value: String },

    #[error("parameter '{param}' must be at least 1, got {value}")]
    OutOfRange { param: &'static str, value: i64 },

    #[error("malformed query string: {0}")]
    Malformed(String),
}

/// Error type for config loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Errors that stop the HTTP server from starting
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Everything an API handler can fail with.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    /// HTTP status for this error. Bad input is the client's fault; anything
    /// from the store is ours.
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::Input(_) => 400,
            ApiError::Store(_) => 500,
        }
    }
}
