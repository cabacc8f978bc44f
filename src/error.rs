//! Error types for pipelib
//!
//! All modules use `PipelibResult<T>` as their return type.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for pipelib operations
pub type PipelibResult<T> = Result<T, PipelibError>;

/// All errors that can occur in pipelib
#[derive(Error, Debug)]
pub enum PipelibError {
    // Resolution errors
    #[error("No version specified for library {library}")]
    NoVersionSpecified { library: String },

    #[error("Version override not permitted for library {library}: {reason}")]
    PolicyViolation { library: String, reason: String },

    #[error("Could not resolve a version for library {library}: {reason}")]
    ResolutionFailure { library: String, reason: String },

    #[error("No library named {0} is configured")]
    LibraryNotFound(String),

    #[error("Invalid library reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    // Retrieval errors
    #[error("Failed to fetch library {library}: {reason}")]
    FetchFailure { library: String, reason: String },

    #[error("Version {version} of library {library} does not exist in its source")]
    VersionNotFound { library: String, version: String },

    #[error("Integrity error: {0}")]
    IntegrityError(String),

    // Lock errors
    #[error("Timed out after {timeout:?} waiting for cache lock {key}")]
    LockTimeout { key: String, timeout: Duration },

    #[error("Operation cancelled")]
    Cancelled,

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl PipelibError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a fetch failure for a library
    pub fn fetch(library: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::FetchFailure {
            library: library.into(),
            reason: reason.into(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::FetchFailure { .. } | Self::Io { .. } | Self::CommandExecution { .. }
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::PolicyViolation { .. } => {
                Some("Enable the matching override flag for this library or drop the version")
            }
            Self::NoVersionSpecified { .. } => {
                Some("Reference the library as name@version or configure a default_version")
            }
            Self::LockTimeout { .. } => Some("Retry later or pass --force to bypass the lock"),
            Self::LibraryNotFound(_) => {
                Some("Check the [[providers.libraries]] entries: pipelib config show")
            }
            Self::ConfigNotFound(_) => Some("Create one with: pipelib config init"),
            Self::CommandFailed { .. } => Some("Is git installed and on PATH?"),
            _ => None,
        }
    }
}
