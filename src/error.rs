use thiserror::Error;

/// Failures raised by a record store backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[cfg(feature = "postgres")]
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid SQL identifier: {0:?}")]
    InvalidIdentifier(String),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("could not connect to {backend} store: {source}")]
    Connection {
        backend: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("failed to read {what}: {source}")]
    Read {
        what: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("malformed {field} payload for movie_id {movie_id}: {source}")]
    Decode {
        movie_id: i64,
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("batch {batch} failed to write: {source}")]
    Write {
        batch: usize,
        #[source]
        source: StoreError,
    },

    #[error("failed to commit cast rows: {source}")]
    Commit {
        #[source]
        source: StoreError,
    },

    #[error("clustering failed: {reason}")]
    Fit { reason: String },

    #[error("projection failed: {reason}")]
    Projection { reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub(crate) fn fit(reason: impl Into<String>) -> Self {
        PipelineError::Fit {
            reason: reason.into(),
        }
    }

    pub(crate) fn projection(reason: impl Into<String>) -> Self {
        PipelineError::Projection {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
