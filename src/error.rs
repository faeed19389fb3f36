//! Custom error types for the Merlin pipeline.
//!
//! This module defines the primary error type, `MerlinError`, for the whole crate.
//! Using the `thiserror` crate, it gives every component (codec, control client,
//! acquisition worker, storage) one consistent way to report failures.
//!
//! ## Error Hierarchy
//!
//! - **`Framing`**: the byte stream could not be resynchronized onto an `MPX` header
//!   within the configured budget. Fatal for the connection it happened on.
//! - **`Decode`**: a single data payload was malformed (unknown tag, unknown pixel
//!   depth, truncated pixels). The worker drops that frame and keeps going.
//! - **`Command`**: the detector answered with a non-zero status code. See
//!   [`CommandError`] for the three distinct cases.
//! - **`Timeout`**: arming did not complete within the configured window.
//! - **`Transport`**: wraps `std::io::Error` from either socket. Fatal for the
//!   component that owns the socket.
//! - **`Config`** / **`Configuration`**: loading or validating `MerlinConfig`.
//! - **`Storage`** / **`FeatureNotEnabled`**: the image sink failed, or the requested
//!   backend was not compiled in.
//!
//! By using `#[from]`, `MerlinError` can be created from the underlying error types
//! with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, MerlinError>;

/// Non-zero status codes returned by the detector on the control channel.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    /// Status `1`: the detector was busy and did not execute the request.
    #[error("detector was busy (code 1)")]
    Busy,

    /// Status `2`: the detector did not recognize the command or property.
    #[error("detector did not recognize the command (code 2)")]
    Unrecognized,

    /// Status `3`: the parameter value was out of range.
    #[error("parameter was out of range (code 3)")]
    OutOfRange,
}

impl CommandError {
    /// Numeric status code as sent on the wire.
    pub fn code(self) -> u8 {
        match self {
            Self::Busy => 1,
            Self::Unrecognized => 2,
            Self::OutOfRange => 3,
        }
    }
}

/// Primary error type for the Merlin pipeline.
#[derive(Error, Debug)]
pub enum MerlinError {
    /// No `MPX` header within the resync budget.
    #[error("Framing error: {0}")]
    Framing(String),

    /// One data payload could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The detector answered with a non-zero status.
    #[error("Command failed: {0}")]
    Command(#[from] CommandError),

    /// An operation exceeded its time limit.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Socket I/O failed or the peer closed the connection.
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration loaded but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The image sink failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The requested backend was not compiled in.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// The other end of the job channel is gone.
    #[error("Job channel closed")]
    JobChannelClosed,

    /// The worker has not consumed earlier job messages yet.
    #[error("Job channel full")]
    JobChannelFull,

    /// Another caller is already waiting for a completion notice.
    #[error("An acquisition is already in progress")]
    JobInFlight,

    /// The worker reported a failed job or exited unexpectedly.
    #[error("Acquisition worker failed: {0}")]
    Worker(String),
}

impl MerlinError {
    /// Whether the error leaves the owning connection unusable.
    ///
    /// Framing and transport errors close the socket they occurred on; all
    /// other errors are scoped to a single request, frame or job.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Framing(_) | Self::Transport(_))
    }
}
