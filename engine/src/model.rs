//! Core data model for transfers.
//!
//! This module defines the main data structures:
//! - SourceInfo: what the resolver learned about a remote resource
//! - TransferRequest: one user action, never mutated after creation
//! - TransferState: producer-owned bookkeeping for a running transfer
//! - OutputKind, TransferPhase, PartialPolicy: enums controlling behavior

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checksums::ChecksumAlgorithm;
use crate::error::EngineError;
use crate::limiter::TransferLimiter;

/// Metadata describing a resolved remote resource.
///
/// Supplied by a `SourceResolver`; immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    /// Where the bytes come from (usually a URL)
    pub locator: String,

    /// Declared size in bytes; 0 means empty or not declared
    pub total_size: u64,

    /// Declared playback duration, if known
    pub duration: Option<Duration>,

    /// File name the source suggests for the final artifact
    pub default_filename: String,

    /// Whether the source can start a stream at a byte offset
    pub supports_resume: bool,

    /// Last modification time reported by the source
    pub last_modified: Option<SystemTime>,
}

impl SourceInfo {
    pub fn new(
        locator: impl Into<String>,
        total_size: u64,
        default_filename: impl Into<String>,
    ) -> Self {
        SourceInfo {
            locator: locator.into(),
            total_size,
            duration: None,
            default_filename: default_filename.into(),
            supports_resume: false,
            last_modified: None,
        }
    }
}

/// What the final artifact should be labelled as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Keep the source's name and extension
    #[default]
    Binary,
    /// Relabel the extension as audio; bytes are not transcoded
    AudioOnly,
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputKind::Binary => write!(f, "binary"),
            OutputKind::AudioOnly => write!(f, "audio"),
        }
    }
}

/// What to do with the temp artifact when a transfer is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialPolicy {
    /// Leave the partial bytes on disk so a later transfer can resume
    #[default]
    Keep,
    /// Remove the partial file
    Delete,
}

/// Checksum to compute (and optionally verify) before finalizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumRequest {
    pub algorithm: ChecksumAlgorithm,

    /// Expected hex digest; case-insensitive
    pub expected: Option<String>,
}

/// One request to fetch a source into a destination directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Locator handed to the resolver
    pub locator: String,

    /// Directory receiving the temp and final artifacts
    pub destination: PathBuf,

    /// Binary as-is or audio-only relabel
    pub output: OutputKind,

    /// Policy evaluated before any content byte is fetched
    pub limits: TransferLimiter,

    /// Optional digest of the finished bytes
    pub checksum: Option<ChecksumRequest>,
}

impl TransferRequest {
    /// Create a binary request with the default limits.
    pub fn new(locator: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        TransferRequest {
            locator: locator.into(),
            destination: destination.into(),
            output: OutputKind::Binary,
            limits: TransferLimiter::default(),
            checksum: None,
        }
    }

    pub fn with_output(mut self, output: OutputKind) -> Self {
        self.output = output;
        self
    }

    pub fn with_limits(mut self, limits: TransferLimiter) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_checksum(mut self, algorithm: ChecksumAlgorithm, expected: Option<String>) -> Self {
        self.checksum = Some(ChecksumRequest {
            algorithm,
            expected,
        });
        self
    }

    /// Reject requests that cannot possibly succeed.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.locator.trim().is_empty() {
            return Err(EngineError::InvalidRequest {
                reason: "Locator is empty".to_string(),
            });
        }
        if self.destination.as_os_str().is_empty() {
            return Err(EngineError::InvalidRequest {
                reason: "Destination path is empty".to_string(),
            });
        }
        if self.destination.is_file() {
            return Err(EngineError::InvalidRequest {
                reason: format!(
                    "Destination must be a directory: {}",
                    self.destination.display()
                ),
            });
        }
        Ok(())
    }
}

/// Lifecycle phase of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPhase {
    /// Created, not yet started
    Created,
    /// Moving bytes
    Running,
    /// Blocked at a checkpoint until resumed or cancelled
    Paused,
    /// Final artifact in place
    Completed,
    /// Stopped by the controller
    Cancelled,
    /// Stopped by a fault or a policy refusal
    Failed,
}

impl TransferPhase {
    /// Returns true if this phase is terminal (no further changes expected).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferPhase::Completed | TransferPhase::Cancelled | TransferPhase::Failed
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: TransferPhase) -> bool {
        use TransferPhase::*;
        match (self, next) {
            (Created, Running) | (Created, Cancelled) | (Created, Failed) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Running, Completed) => true,
            (Running | Paused, Cancelled) | (Running | Paused, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferPhase::Created => "created",
            TransferPhase::Running => "running",
            TransferPhase::Paused => "paused",
            TransferPhase::Completed => "completed",
            TransferPhase::Cancelled => "cancelled",
            TransferPhase::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Mutable bookkeeping owned by the producer of one transfer.
///
/// Pause and cancel flags are not here: they live in the `PauseGate`.
#[derive(Debug, Clone)]
pub struct TransferState {
    pub id: Uuid,
    phase: TransferPhase,
    bytes_transferred: u64,
    total_bytes: u64,
    resumed_from: u64,
}

impl TransferState {
    pub fn new(id: Uuid) -> Self {
        TransferState {
            id,
            phase: TransferPhase::Created,
            bytes_transferred: 0,
            total_bytes: 0,
            resumed_from: 0,
        }
    }

    pub fn phase(&self) -> TransferPhase {
        self.phase
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn resumed_from(&self) -> u64 {
        self.resumed_from
    }

    /// Move to `next`, ignoring transitions the state machine forbids.
    ///
    /// Returns whether the phase changed.
    pub fn set_phase(&mut self, next: TransferPhase) -> bool {
        if self.phase.can_transition_to(next) {
            self.phase = next;
            true
        } else {
            false
        }
    }

    /// Enter `Running` with `offset` bytes already on disk.
    pub fn begin(&mut self, total_bytes: u64, offset: u64) {
        self.total_bytes = total_bytes;
        self.resumed_from = offset;
        self.bytes_transferred = offset;
        self.set_phase(TransferPhase::Running);
    }

    /// How many more bytes may be written without passing the declared total.
    ///
    /// `None` when the total is not declared.
    pub fn remaining(&self) -> Option<u64> {
        if self.total_bytes == 0 {
            None
        } else {
            Some(self.total_bytes.saturating_sub(self.bytes_transferred))
        }
    }

    /// Account for `n` freshly written bytes.
    pub fn record(&mut self, n: u64) -> Result<u64, EngineError> {
        let next = self.bytes_transferred + n;
        if self.total_bytes > 0 && next > self.total_bytes {
            return Err(EngineError::StreamOverflow {
                declared: self.total_bytes,
            });
        }
        self.bytes_transferred = next;
        Ok(next)
    }
}
