//! Error taxonomy for LDX injection
//!
//! Per-file failures are categorized so the watch loop can log them uniformly
//! and decide what the next cycle should expect. None of them is fatal: a file
//! that failed is simply not recorded as processed and is picked up again.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Categorized error types for per-file handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// File vanished, permission denied, lock contention (retryable)
    TransientIo,

    /// Target file content could not be parsed (retried until fixed)
    MalformedTarget,

    /// Database failures while collecting values or committing logs
    Storage,

    /// Startup configuration errors (fatal)
    Configuration,
}

impl ErrorCategory {
    /// Check if a later cycle can be expected to succeed without operator action
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::TransientIo | ErrorCategory::Storage)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::TransientIo => "transient_io",
            ErrorCategory::MalformedTarget => "malformed_target",
            ErrorCategory::Storage => "storage",
            ErrorCategory::Configuration => "configuration",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single merge pass against one target file
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed target file {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl MergeError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        MergeError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn malformed(path: &Path, reason: impl Into<String>) -> Self {
        MergeError::Malformed {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            MergeError::Io { .. } => ErrorCategory::TransientIo,
            MergeError::Malformed { .. } => ErrorCategory::MalformedTarget,
            MergeError::Storage(_) => ErrorCategory::Storage,
        }
    }
}

/// Invalid startup configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::Configuration
    }
}
