//! Library errors using thiserror for structured error handling.
//!
//! Detector execution failures never cross the manager boundary; they are
//! logged there and degrade to an empty region list. Only `Cancelled` is
//! surfaced to callers of the orchestration entry points.

use thiserror::Error;

/// A detection call was cancelled through its `CancellationToken`
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Detection cancelled")]
pub struct Cancelled;

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("Detection cancelled")]
    Cancelled,

    #[error("Invalid input image: {width}x{height}")]
    InvalidImage { width: u32, height: u32 },

    #[error("Image primitive failed")]
    Primitive(#[source] anyhow::Error),

    #[error("Region proposal service failed")]
    Proposal(#[source] anyhow::Error),

    #[error("Detector panicked: {0}")]
    Panicked(String),
}

impl DetectionError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DetectionError::Cancelled)
    }
}

impl From<Cancelled> for DetectionError {
    fn from(_: Cancelled) -> Self {
        DetectionError::Cancelled
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParameterError {
    #[error("Unknown parameter: {name}")]
    Unknown { name: String },

    #[error("Parameter {name} expects a {expected} value")]
    TypeMismatch { name: String, expected: &'static str },

    #[error("Parameter {name} out of range: {value}")]
    OutOfRange { name: String, value: String },
}

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("No profile directory available on this platform")]
    NoProfileDir,

    #[error("Profile I/O failed: {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize profile")]
    Serialize(#[source] serde_json::Error),

    #[error("Failed to parse profile {path}")]
    Deserialize {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Profile belongs to detector {found}, expected {expected}")]
    DetectorMismatch { expected: String, found: String },

    #[error("Profile parameter rejected")]
    Parameter(#[from] ParameterError),

    #[error("Detector not registered: {0}")]
    UnknownDetector(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration from {path}")]
    LoadFailed {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Failed to save configuration to {path}")]
    SaveFailed {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("No configuration directory available on this platform")]
    NoConfigDir,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_display() {
        let err = ParameterError::Unknown {
            name: "delta".to_string(),
        };
        assert_eq!(err.to_string(), "Unknown parameter: delta");

        let err = DetectionError::InvalidImage {
            width: 0,
            height: 10,
        };
        assert_eq!(err.to_string(), "Invalid input image: 0x10");
    }

    #[test]
    fn test_cancelled_converts() {
        let err: DetectionError = Cancelled.into();
        assert!(err.is_cancelled());
        assert!(!DetectionError::Panicked("boom".into()).is_cancelled());
    }

    #[test]
    fn test_error_source_chain() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let config_err = ConfigError::LoadFailed {
            path: "/test/engine.json".to_string(),
            source: Box::new(io_err),
        };

        assert!(config_err.source().is_some());
        assert_eq!(
            config_err.to_string(),
            "Failed to load configuration from /test/engine.json"
        );
    }
}
