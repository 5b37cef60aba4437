//! Error types for the CF cache and the CF handoff protocol.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the cache tiers, the disk layer and the thread protocol.
///
/// A cache miss is not an error; see [`crate::cache::LocateStatus::NotCached`].
#[derive(Debug, Error)]
pub enum CfCacheError {
    /// Cache directory missing and uncreatable, unreadable, or unwritable.
    #[error("CF cache directory {path:?}: {reason}")]
    Configuration { path: PathBuf, reason: String },

    /// An artifact header or payload is missing fields or malformed.
    #[error("malformed CF artifact \"{name}\": {reason}")]
    ArtifactParse { name: String, reason: String },

    /// A cell was addressed that the buffer axes do not contain.
    #[error("no CF cell for freq={freq} Hz, w={w}, mueller={mueller}")]
    MissingCell { freq: f64, w: f64, mueller: i32 },

    /// The producer/consumer handoff was used out of order.
    #[error("CF handoff protocol violation: {0}")]
    ProtocolViolation(String),

    /// The external CF computation failed.
    #[error("CF computation failed: {0}")]
    Compute(String),

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CfCacheError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CfCacheError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn parse(name: impl Into<String>, reason: impl Into<String>) -> Self {
        CfCacheError::ArtifactParse {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn config(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        CfCacheError::Configuration {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for cache and handoff operations.
pub type CfResult<T> = Result<T, CfCacheError>;
