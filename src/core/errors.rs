//! LK-prefixed error types with structured error codes.
//!
//! Startup classes (configuration, persistence) are fatal; runtime classes are
//! handled close to their source and surfaced through telemetry only.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, LkError>;

/// Top-level error type for loadkeeper.
#[derive(Debug, Error)]
pub enum LkError {
    #[error("[LK-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[LK-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[LK-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[LK-1101] unsupported platform: {details}")]
    UnsupportedPlatform { details: String },

    #[error("[LK-2001] sensor read failure from {source_name}: {details}")]
    Sensor {
        source_name: &'static str,
        details: String,
    },

    #[error("[LK-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[LK-2102] SQL failure in {context}: {details}")]
    Sql {
        context: &'static str,
        details: String,
    },

    #[error("[LK-2201] storage corrupt at {path}: {details}")]
    StorageCorrupt { path: PathBuf, details: String },

    #[error("[LK-2202] storage full at {path}")]
    StorageFull { path: PathBuf },

    #[error("[LK-3001] persistence unavailable at {path}: {details}")]
    PersistenceUnavailable { path: PathBuf, details: String },

    #[error("[LK-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[LK-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[LK-3101] network failure: {details}")]
    Net { details: String },

    #[error("[LK-3102] peer rejected: {addr}: {reason}")]
    PeerRejected { addr: String, reason: String },

    #[error("[LK-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl LkError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "LK-1001",
            Self::MissingConfig { .. } => "LK-1002",
            Self::ConfigParse { .. } => "LK-1003",
            Self::UnsupportedPlatform { .. } => "LK-1101",
            Self::Sensor { .. } => "LK-2001",
            Self::Serialization { .. } => "LK-2101",
            Self::Sql { .. } => "LK-2102",
            Self::StorageCorrupt { .. } => "LK-2201",
            Self::StorageFull { .. } => "LK-2202",
            Self::PersistenceUnavailable { .. } => "LK-3001",
            Self::Io { .. } => "LK-3002",
            Self::ChannelClosed { .. } => "LK-3003",
            Self::Net { .. } => "LK-3101",
            Self::PeerRejected { .. } => "LK-3102",
            Self::Runtime { .. } => "LK-3900",
        }
    }

    /// Whether the failure is fatal at startup (exits the process).
    ///
    /// Runtime errors never terminate the daemon; only these classes do, and
    /// only when raised before the control loop starts.
    #[must_use]
    pub const fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. }
                | Self::MissingConfig { .. }
                | Self::ConfigParse { .. }
                | Self::UnsupportedPlatform { .. }
                | Self::PersistenceUnavailable { .. }
        )
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Sensor { .. }
                | Self::Sql { .. }
                | Self::Net { .. }
                | Self::ChannelClosed { .. }
                | Self::Runtime { .. }
        )
    }

    /// Process exit code for startup failures.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::PersistenceUnavailable { .. } => 2,
            _ => 1,
        }
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<rusqlite::Error> for LkError {
    fn from(value: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(inner, _) = &value
            && inner.code == rusqlite::ErrorCode::DiskFull
        {
            return Self::StorageFull {
                path: PathBuf::new(),
            };
        }
        Self::Sql {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for LkError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for LkError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
