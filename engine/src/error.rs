//! Error types for the transfer engine.
//!
//! `EngineError` covers everything that can end a transfer early. Controllers
//! never see it directly: the producer converts it into a `Failed` terminal
//! event whose kind comes from [`EngineError::failure_kind`] and whose message
//! is the error's `Display` text.

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::limiter::Refusal;

/// Coarse failure taxonomy reported to controllers.
///
/// `PolicyRefused` is an expected outcome (present limit/upgrade messaging),
/// `TransferFailed` is a technical fault (present the raw message).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PolicyRefused,
    TransferFailed,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::PolicyRefused => write!(f, "policy refused"),
            FailureKind::TransferFailed => write!(f, "transfer failed"),
        }
    }
}

/// Errors that end a transfer or prevent one from starting.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The source is outside the configured limits
    #[error("{0}")]
    PolicyRefused(Refusal),

    /// The locator could not be turned into a source
    #[error("Failed to resolve {locator}: {message}")]
    ResolveFailed { locator: String, message: String },

    /// The server answered with an unexpected status
    #[error("HTTP {status} from {url}")]
    Http { url: String, status: u16 },

    /// Transport-level failure talking to the server
    #[error("Network error for {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Reading from the remote stream failed
    #[error("{source}")]
    StreamRead {
        #[source]
        source: io::Error,
    },

    /// Failed to read a local file
    #[error("Failed to read file {}: {source}", path.display())]
    ReadError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to write a local file
    #[error("Failed to write file {}: {source}", path.display())]
    WriteError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to create the destination directory
    #[error("Failed to create directory {}: {source}", path.display())]
    DirectoryCreationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Renaming the temp artifact to its final name failed
    #[error("Failed to move {} to {}: {source}", from.display(), to.display())]
    FinalizeFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The stream delivered more bytes than the source declared
    #[error("Stream exceeded declared size of {declared} bytes")]
    StreamOverflow { declared: u64 },

    /// The stream ended before the declared size was reached
    #[error("Stream ended after {received} of {declared} bytes")]
    StreamIncomplete { received: u64, declared: u64 },

    /// The downloaded bytes do not match the expected digest
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// The request itself is unusable
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Configuration could not be loaded or is inconsistent
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// The producer thread panicked
    #[error("Transfer worker panicked: {message}")]
    WorkerPanicked { message: String },
}

impl EngineError {
    /// Map this error onto the controller-facing taxonomy.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::PolicyRefused(_) => FailureKind::PolicyRefused,
            _ => FailureKind::TransferFailed,
        }
    }
}
