use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Failed to open device '{device}': {reason}")]
    DeviceOpen { device: String, reason: String },

    #[error("Invalid filter '{expression}': {message}")]
    FilterSyntax {
        expression: String,
        message: String,
        /// Byte offset of the offending token, when the backend reports one
        position: Option<usize>,
        token: Option<String>,
    },

    #[error("Device not ready: {0}")]
    DeviceNotReady(String),

    #[error("Operation not supported by the {backend} backend: {operation}")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Send queue has been disposed")]
    QueueDisposed,

    #[error("Capture thread did not stop within {0:?}")]
    StopTimeout(Duration),

    #[error("Interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("Insufficient permissions to capture packets (try running as root)")]
    InsufficientPermissions,

    #[error("Device enumeration failed: {0}")]
    Enumeration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    pub(crate) fn not_ready(msg: impl Into<String>) -> Self {
        CaptureError::DeviceNotReady(msg.into())
    }

    pub(crate) fn unsupported(backend: &'static str, operation: &'static str) -> Self {
        CaptureError::Unsupported { backend, operation }
    }

    /// Classify a backend open failure, picking out privilege problems.
    pub(crate) fn open_failed(device: &str, reason: impl ToString) -> Self {
        let reason = reason.to_string();
        let lower = reason.to_lowercase();
        if lower.contains("permission") || lower.contains("operation not permitted") {
            return CaptureError::InsufficientPermissions;
        }
        CaptureError::DeviceOpen {
            device: device.to_string(),
            reason,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid value for '{key}': {value}")]
    InvalidValue { key: String, value: String },
}
