//! Errors surfaced by the session core.
//!
//! Configuration problems are rejected synchronously and leave every piece of
//! session state untouched. Device problems end the active session. A stale
//! sensor is not an error at all; it shows up as a flag in
//! [`SessionStatus`](crate::session::SessionStatus).

use thiserror::Error;

/// An invalid protocol, sonification or tuning value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    /// A duration that must be strictly positive was zero.
    #[error("{field} must be greater than zero")]
    NonPositiveDuration {
        /// Name of the offending field
        field: &'static str,
    },

    /// A protocol needs at least one set.
    #[error("set count must be at least 1")]
    ZeroSetCount,

    /// The tolerance divides the deviation, so it has to be positive.
    #[error("tolerance must be greater than zero, got {0}")]
    NonPositiveTolerance(f32),

    /// NaN or infinity where a real number was expected.
    #[error("{field} must be a finite number")]
    NonFinite {
        /// Name of the offending field
        field: &'static str,
    },

    /// An engine tuning value outside its usable range.
    #[error("invalid tuning value for {field}: {reason}")]
    InvalidTuning {
        /// Name of the offending field
        field: &'static str,
        /// What was wrong with it
        reason: &'static str,
    },
}

/// The audio output could not be opened, or went away mid-stream.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeviceError {
    /// The host has no default output device.
    #[error("no audio output device available")]
    NoOutputDevice,

    /// The device refused to report a default output configuration.
    #[error("could not query output configuration: {0}")]
    DefaultConfig(String),

    /// The stream could not be built for the device.
    #[error("could not build output stream: {0}")]
    BuildStream(String),

    /// The stream was built but would not start.
    #[error("could not start output stream: {0}")]
    PlayStream(String),

    /// The device only offers a sample format we do not render.
    #[error("unsupported output sample format {0}")]
    UnsupportedSampleFormat(String),

    /// The backend reported an error after the stream was running.
    #[error("audio stream lost: {0}")]
    StreamLost(String),
}

/// A malformed notification frame from the load cell.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgressorError {
    /// The frame was shorter than its header claims.
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes the header asked for
        needed: usize,
        /// Bytes actually present
        available: usize,
    },

    /// A weight payload whose length is not a whole number of records.
    #[error("weight payload of {0} bytes is not a multiple of 8")]
    RaggedPayload(usize),

    /// A message kind this decoder does not know.
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
}

/// Anything the session facade can hand back to the UI layer.
#[derive(Debug, Error)]
pub enum SessionError {
    /// See [`ConfigurationError`].
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// See [`DeviceError`].
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// `start` was called while a session was already counting down or running.
    #[error("a session is already active")]
    AlreadyActive,

    /// The session file could not be parsed.
    #[error("could not parse session file: {0}")]
    SessionFile(#[from] ron::error::SpannedError),

    /// Reading a file or stream failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Writing a rendered session failed.
    #[error(transparent)]
    Wav(#[from] hound::Error),
}
