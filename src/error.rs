use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("I/O error on request log {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A log line that is not a valid captured request. `line` is 1-based.
    #[error("malformed request log line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: sonic_rs::Error,
    },

    #[error("failed to serialize captured request: {0}")]
    Serialize(#[source] sonic_rs::Error),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

pub type Result<T> = std::result::Result<T, ReplayError>;
