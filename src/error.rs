//! Error types for tomography acquisition.
//!
//! `TomoError` is the single error type surfaced by the crate. Device drivers
//! speak `anyhow::Result` (see [`crate::devices`]); the run engine converts
//! those into `TomoError` at the command boundary so callers always see which
//! device and which operation failed.
//!
//! ## Error Categories
//!
//! 1. **Pre-run errors** - `InvalidConfig`, `UnsupportedFormat`, `ScanInProgress`,
//!    `PreconditionNotMet`, `BackendUnavailable`, and the loading errors
//!    (`Config`, `Yaml`, `Io`). Raised before any device command is issued, so
//!    no cleanup is needed.
//! 2. **Run errors** - `DeviceTimeout`, `Device`, `TriggerShortfall`. Raised
//!    while a scan is in flight. The engine runs the cleanup sequence once and
//!    reports the error inside [`crate::engine::ScanFailure`] with the phase
//!    it happened in.

use std::time::Duration;
use thiserror::Error;

use crate::mode::Mode;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, TomoError>;

/// Primary error type for tomography acquisition.
#[derive(Error, Debug)]
pub enum TomoError {
    /// Scan configuration is malformed or out of range.
    ///
    /// **Error Type**: Permanent - requires fixing the scan document.
    ///
    /// **Recovery Strategy**: Nothing to undo. Fix the document and resubmit.
    #[error("Invalid scan configuration: {0}")]
    InvalidConfig(String),

    /// A device command did not complete within its allotted time.
    ///
    /// **Error Type**: Usually transient (IOC busy, motor stalled against a
    /// limit, detector waiting on a trigger that never came).
    ///
    /// **Recovery Strategy**: The engine has already closed the shutter and
    /// restored the motors. Check the device and rerun.
    #[error("{device} timed out during {operation} after {timeout:?}")]
    DeviceTimeout {
        /// Device that did not respond
        device: String,
        /// Operation in flight
        operation: String,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// A device command failed for a reason other than a timeout.
    #[error("{device} failed during {operation}: {source}")]
    Device {
        /// Device that reported the failure
        device: String,
        /// Operation in flight
        operation: String,
        /// Driver error
        #[source]
        source: anyhow::Error,
    },

    /// The fly controller emitted a different number of triggers than requested.
    ///
    /// **Error Type**: Fatal to the run, not to the process. The partial
    /// archive is kept on disk.
    #[error("Fly scan trigger count mismatch: expected {expected}, received {actual}")]
    TriggerShortfall {
        /// Triggers requested (number of projections)
        expected: u32,
        /// Triggers the detector actually received
        actual: u32,
    },

    /// Production binding attempted without the facility being ready.
    #[error("Production mode precondition not met: {0}")]
    PreconditionNotMet(String),

    /// Output type string is neither TIFF nor HDF5.
    #[error("Unsupported output type '{0}' (expected tiff or hdf5)")]
    UnsupportedFormat(String),

    /// Another scan already owns the device set.
    #[error("A scan is already in progress on this device set")]
    ScanInProgress,

    /// No live device backend was registered for a mode that needs one.
    #[error("No live device backend available for {0} mode")]
    BackendUnavailable(Mode),

    /// Session configuration could not be extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Scan document is not valid YAML or has the wrong shape.
    #[error("Scan document error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for TomoError {
    fn from(err: figment::Error) -> Self {
        TomoError::Config(Box::new(err))
    }
}

impl TomoError {
    /// Build a `Device` error from a driver failure.
    pub fn device(
        device: impl Into<String>,
        operation: impl Into<String>,
        source: anyhow::Error,
    ) -> Self {
        TomoError::Device {
            device: device.into(),
            operation: operation.into(),
            source,
        }
    }

    /// Whether the error was raised before any device command was issued.
    pub fn is_pre_run(&self) -> bool {
        !matches!(
            self,
            TomoError::DeviceTimeout { .. }
                | TomoError::Device { .. }
                | TomoError::TriggerShortfall { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_device_and_operation() {
        let err = TomoError::DeviceTimeout {
            device: "rotation".into(),
            operation: "move".into(),
            timeout: Duration::from_secs(30),
        };
        let msg = err.to_string();
        assert!(msg.contains("rotation"));
        assert!(msg.contains("move"));
        assert!(!err.is_pre_run());
    }

    #[test]
    fn test_shortfall_message() {
        let err = TomoError::TriggerShortfall {
            expected: 1000,
            actual: 900,
        };
        assert_eq!(
            err.to_string(),
            "Fly scan trigger count mismatch: expected 1000, received 900"
        );
    }

    #[test]
    fn test_pre_run_classification() {
        assert!(TomoError::ScanInProgress.is_pre_run());
        assert!(TomoError::UnsupportedFormat("png".into()).is_pre_run());
        assert!(!TomoError::device("shutter", "open", anyhow::anyhow!("PSS fault")).is_pre_run());
    }
}
