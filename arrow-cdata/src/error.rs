//! Error types for the C data interface layer.

use std::ffi::c_int;
use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

pub const EIO: c_int = 5;
pub const ENOMEM: c_int = 12;
pub const EINVAL: c_int = 22;
pub const ENOTSUP: c_int = 95;

/// Structural mismatch between an array and its schema.
///
/// `path` names the offending node, e.g. `root.children[1].dictionary`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }

    pub(crate) fn count(path: &str, what: &str, expected: i64, actual: i64) -> Self {
        Self::new(
            path,
            format!("expected {expected} {what} but found {actual}"),
        )
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("validation failed at {0}")]
    Validation(#[from] ValidationError),

    #[error("invalid format string '{format}': {message}")]
    InvalidFormat { format: String, message: String },

    #[error("out of memory allocating {requested} bytes on {device}")]
    OutOfMemory { device: String, requested: usize },

    #[error("device error on {device} (code {code}): {message}")]
    Device {
        device: String,
        code: i32,
        message: String,
    },

    #[error("no transfer path from {src} to {dst}")]
    UnsupportedTransfer { src: String, dst: String },

    #[error("{0} has already been released")]
    Released(&'static str),

    #[error("expected capsule '{expected}' but found '{found}'")]
    CapsuleName { expected: String, found: String },

    #[error("array stream error: {0}")]
    Stream(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    pub fn invalid_format(format: &str, message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            format: format.to_string(),
            message: message.into(),
        }
    }

    /// POSIX error code reported across the C ABI.
    pub fn errno(&self) -> c_int {
        match self {
            Error::OutOfMemory { .. } => ENOMEM,
            Error::Device { .. } | Error::Stream(_) => EIO,
            Error::UnsupportedTransfer { .. } => ENOTSUP,
            Error::Validation(_)
            | Error::InvalidFormat { .. }
            | Error::Released(_)
            | Error::CapsuleName { .. }
            | Error::InvalidArgument(_) => EINVAL,
        }
    }

    pub fn is_unsupported_transfer(&self) -> bool {
        matches!(self, Error::UnsupportedTransfer { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        let oom = Error::OutOfMemory {
            device: "cpu:0".into(),
            requested: 8,
        };
        assert_eq!(oom.errno(), ENOMEM);
        assert_eq!(Error::Released("schema").errno(), EINVAL);
        assert_eq!(Error::Stream("boom".into()).errno(), EIO);
    }

    #[test]
    fn validation_message_includes_path() {
        let err: Error = ValidationError::count("root.children[0]", "buffers", 2, 3).into();
        let msg = err.to_string();
        assert!(msg.contains("root.children[0]"));
        assert!(msg.contains("expected 2 buffers but found 3"));
    }
}
