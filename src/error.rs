//! Custom error types for the application.
//!
//! This module defines the primary error type, `ScanError`, shared by the motion
//! controller, the device drivers and the scan orchestrator. Using the `thiserror`
//! crate, it keeps failure handling uniform across the crate.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: a device path or address could not be opened. Fatal to the
//!   component and surfaced before any background task is started.
//! - **`Protocol`**: a status line from the stage firmware could not be decoded. The
//!   poll loop logs it and skips the tick.
//! - **`DoubleArm`**: a spatial wait was requested while another one is pending. This is
//!   a programming error and is rejected instead of overwriting the first target.
//! - **`Configuration`** / **`Config`**: missing or invalid experiment parameters, or a
//!   configuration file that does not parse. Fatal to starting a scan.
//! - **`DeviceCommand`**: the signal generator or the oscilloscope failed a command. The
//!   orchestrator disables the excitation output before returning it.
//! - **`MotionTimeout`** / **`MotionCancelled`**: the position-reached wait did not
//!   complete, either because a deadline expired or because the controller stopped.
//!
//! By using `#[from]`, `ScanError` can be created from the underlying error types with
//! the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, ScanError>;

/// Primary error type for the scanning application.
#[derive(Error, Debug)]
pub enum ScanError {
    /// A device could not be opened.
    ///
    /// **Error Type**: Permanent for this attempt - check cabling and device path.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Serial transport was compiled out.
    #[error("Serial support not enabled. Rebuild with --features serial")]
    SerialFeatureDisabled,

    /// An operation needed an open transport but the controller is disconnected.
    #[error("Stage controller is not connected")]
    NotConnected,

    /// `start()` was called on a controller whose loops are already running.
    #[error("Stage controller loops are already running")]
    AlreadyRunning,

    /// The firmware answered with something that is not a status payload.
    ///
    /// **Error Type**: Transient - the next poll tick usually succeeds.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A second position-reached wait was requested while one is still armed.
    #[error("A position wait is already armed for ({x}, {y})")]
    DoubleArm {
        /// X coordinate of the pending target (machine frame).
        x: f64,
        /// Y coordinate of the pending target (machine frame).
        y: f64,
    },

    /// The stage did not report the target position in time.
    #[error("Stage did not reach ({x}, {y}) within {timeout:?}")]
    MotionTimeout {
        /// X coordinate of the target (machine frame).
        x: f64,
        /// Y coordinate of the target (machine frame).
        y: f64,
        /// Deadline that expired.
        timeout: std::time::Duration,
    },

    /// The position-reached wait was disarmed before it fired.
    #[error("Position wait was cancelled before the stage reached the target")]
    MotionCancelled,

    /// Configuration values are missing or semantically invalid.
    ///
    /// **Recovery Strategy**: Abort the scan, display the message, fix the parameters.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration file parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// The excitation or acquisition device failed a command.
    #[error("Device command error: {0}")]
    DeviceCommand(String),

    /// The scan was aborted through its abort handle.
    #[error("Scan aborted")]
    Aborted,

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScanError {
    /// Wrap a device-port failure, keeping the full context chain in the message.
    pub fn device(err: anyhow::Error) -> Self {
        ScanError::DeviceCommand(format!("{err:#}"))
    }

    /// Whether the error leaves the controller usable for another attempt.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ScanError::Protocol(_)
                | ScanError::MotionTimeout { .. }
                | ScanError::DeviceCommand(_)
                | ScanError::DoubleArm { .. }
        )
    }
}
