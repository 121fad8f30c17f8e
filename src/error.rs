//! Error types for fusecap
//!
//! All modules use `FusecapResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for fusecap operations
pub type FusecapResult<T> = Result<T, FusecapError>;

/// All errors that can occur in fusecap
#[derive(Error, Debug)]
pub enum FusecapError {
    // Capability registry errors
    #[error("No capabilities tracked for inode {0:#x}")]
    InodeNotTracked(u64),

    #[error("Client clock {client_clock} is out of sync with server clock {server_clock} (max skew {max_skew}s)")]
    ClockSkew {
        client_clock: i64,
        server_clock: i64,
        max_skew: u64,
    },

    #[error("Broadcast to client {client} failed: {reason}")]
    Transport { client: String, reason: String },

    #[error("Invalid filter expression '{pattern}': {source}")]
    InvalidFilter {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    // Cache authority errors
    #[error("Cache authority for inode {inode:#x} is held by another owner")]
    OwnershipConflict { inode: u64 },

    #[error("Unable to restore inode {inode:#x}: {reason}")]
    RestoreUnavailable { inode: u64, reason: String },

    #[error("Restore of inode {inode:#x} failed after {attempts} attempts")]
    RestoreExhausted { inode: u64, attempts: u32 },

    #[error("Replica I/O failed: {0}")]
    Replica(String),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid scenario {path}: {reason}")]
    ScenarioInvalid { path: PathBuf, reason: String },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("{0}")]
    User(String),
}

impl FusecapError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a broadcast transport error
    pub fn transport(client: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transport {
            client: client.into(),
            reason: reason.into(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::ClockSkew { .. } | Self::Replica(_)
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::ClockSkew { .. } => Some("Synchronize the client clock (e.g. enable NTP)"),
            Self::InvalidFilter { .. } => Some("Filters use extended regular expression syntax"),
            Self::RestoreUnavailable { .. } => {
                Some("Partially cached files cannot be restored; rewrite the file")
            }
            _ => None,
        }
    }

    /// Convert into a `std::io::Error` for callers that speak POSIX file semantics
    pub fn into_io_error(self) -> std::io::Error {
        match self {
            Self::Io { source, .. } => source,
            Self::InodeNotTracked(_) => std::io::Error::new(std::io::ErrorKind::NotFound, self),
            other => std::io::Error::other(other),
        }
    }
}
