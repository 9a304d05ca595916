//! Error types for ServeTune
//!
//! Hardware probes and registry queries never surface here: they degrade to
//! fallback values. What remains are the terminal conditions a caller has to
//! act on.

use crate::resolver::ResolutionFailure;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for ServeTune operations
#[derive(Error, Debug)]
pub enum ServeTuneError {
    /// I/O error while reading or writing a file
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No interpreter version satisfied the target package and its dependencies
    #[error("{0}")]
    Resolution(Box<ResolutionFailure>),

    /// Malformed interpreter version string
    #[error("Invalid Python version '{0}' (expected MAJOR.MINOR)")]
    InvalidVersion(String),

    /// Malformed requirement line
    #[error("Invalid requirement '{line}': {message}")]
    InvalidRequirement { line: String, message: String },

    /// Architecture name not recognised
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    /// Server process could not be launched
    #[error("Failed to launch '{program}': {message}")]
    Launch { program: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ServeTuneError {
    /// Create an I/O error with path context
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a requirement parse error
    pub fn requirement(line: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidRequirement {
            line: line.into(),
            message: message.into(),
        }
    }

    /// Create a launch error
    pub fn launch(program: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Launch {
            program: program.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Get the path associated with this error, if any
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::Io { path, .. } => Some(path),
            _ => None,
        }
    }
}

impl From<ResolutionFailure> for ServeTuneError {
    fn from(failure: ResolutionFailure) -> Self {
        Self::Resolution(Box::new(failure))
    }
}

/// Result type alias for ServeTune operations
pub type Result<T> = std::result::Result<T, ServeTuneError>;

/// Extension trait for adding path context to std::io::Result
pub trait IoResultExt<T> {
    /// Add path context to an I/O error
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| ServeTuneError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_with_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = ServeTuneError::io("/out/python_version.txt", io_err);
        assert_eq!(err.path().unwrap(), &PathBuf::from("/out/python_version.txt"));
        assert!(err.to_string().contains("/out/python_version.txt"));
    }

    #[test]
    fn test_with_path_extension() {
        let res: std::io::Result<()> =
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"));
        let err = res.with_path("/etc/shadow").unwrap_err();
        assert!(matches!(err, ServeTuneError::Io { .. }));
    }

    #[test]
    fn test_requirement_error_message() {
        let err = ServeTuneError::requirement("torch==", "missing version");
        assert_eq!(err.to_string(), "Invalid requirement 'torch==': missing version");
    }
}
