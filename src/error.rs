//! Error handling module for bootprov
//!
//! Provides the provisioning error taxonomy using thiserror. Every step
//! returns these types so the executor can decide between retrying and
//! aborting the run.

use thiserror::Error;

use crate::types::ErrorKind;

/// Main error type for the provisioner
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// Package mirror or index unreachable (retryable)
    #[error("Network transient error: {0}")]
    NetworkTransient(String),

    /// Unknown package, unavailable repository/extra, invalid config (fatal)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Unit file write or filesystem mutation failed (fatal)
    #[error("Filesystem error: {0}")]
    Filesystem(String),

    /// Privileged step attempted without privilege (fatal)
    #[error("Permission error: {0}")]
    Permission(String),

    /// A command exceeded its step timeout and was killed (retryable)
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A command exited non-zero without a recognisable cause
    #[error("Command failed: {0}")]
    Command(String),

    /// A unit file could not be parsed back into a service definition
    #[error("Unit file parse error: {0}")]
    UnitParse(String),

    /// IO errors outside unit materialisation
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for provisioning operations
pub type Result<T> = std::result::Result<T, ProvisionError>;

impl ProvisionError {
    /// Create a network transient error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkTransient(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a filesystem error
    pub fn filesystem(msg: impl Into<String>) -> Self {
        Self::Filesystem(msg.into())
    }

    /// Create a permission error
    pub fn permission(msg: impl Into<String>) -> Self {
        Self::Permission(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a generic command failure
    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }

    /// Create a unit parse error
    pub fn unit_parse(msg: impl Into<String>) -> Self {
        Self::UnitParse(msg.into())
    }

    /// Coarse classification used in step reports
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NetworkTransient(_) => ErrorKind::NetworkTransient,
            Self::Configuration(_) | Self::UnitParse(_) | Self::Json(_) => {
                ErrorKind::Configuration
            }
            Self::Filesystem(_) | Self::Io(_) => ErrorKind::Filesystem,
            Self::Permission(_) => ErrorKind::Permission,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Command(_) => ErrorKind::Command,
        }
    }

    /// Only transient network failures and timeouts are worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkTransient(_) | Self::Timeout(_))
    }
}
