//! The closed error taxonomy shared by every subsystem of the runtime.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed enumeration of error kinds, grouped by concern: generic, file/IO,
/// lifecycle, policy, transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginErrorKind {
    // Generic
    Success,
    UnknownError,
    InvalidArgument,
    InvalidParameters,
    NotImplemented,
    NotFound,
    AlreadyExists,

    // File/IO
    FileNotFound,
    FileSystemError,
    PermissionDenied,
    InvalidFormat,

    // Lifecycle
    LoadFailed,
    UnloadFailed,
    AlreadyLoaded,
    NotLoaded,
    InitializationFailed,
    StateError,
    ExecutionFailed,
    CommandNotFound,

    // Policy
    SecurityViolation,
    ConfigurationError,
    VersionMismatch,
    DependencyMissing,
    ResourceUnavailable,
    ResourceExhausted,

    // Transport
    NetworkError,
    TimeoutError,
}

impl fmt::Display for PluginErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A structured error value: `{code, message, details}`.
///
/// Equality is by `(code, message, details)`. The canonical string form is
/// `code: message [details]` with the `[details]` suffix omitted when empty.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{}", self.display())]
pub struct PluginError {
    pub code: PluginErrorKind,
    pub message: String,
    pub details: Option<String>,
}

impl PluginError {
    pub fn new(code: PluginErrorKind, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    fn display(&self) -> String {
        match &self.details {
            Some(details) => format!("{}: {} [{}]", self.code, self.message, details),
            None => format!("{}: {}", self.code, self.message),
        }
    }
}

/// The workspace-wide result alias.
pub type PluginResult<T> = Result<T, PluginError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_string_form() {
        let err = PluginError::new(PluginErrorKind::NotFound, "plugin missing");
        assert_eq!(err.to_string(), "NotFound: plugin missing");
        let err = err.with_details("id=com.example.foo");
        assert_eq!(
            err.to_string(),
            "NotFound: plugin missing [id=com.example.foo]"
        );
    }

    #[test]
    fn equality_is_structural() {
        let a = PluginError::new(PluginErrorKind::LoadFailed, "x");
        let b = PluginError::new(PluginErrorKind::LoadFailed, "x");
        let c = PluginError::new(PluginErrorKind::LoadFailed, "y");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
