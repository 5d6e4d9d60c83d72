//! Events pushed from a transfer's producer to its controllers.
//!
//! The producer is the only sender, so events arrive in the order they were
//! produced. The terminal event is always last; the channel disconnects
//! right after it.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checksums::ChecksumValue;
use crate::error::{EngineError, FailureKind};
use crate::model::TransferPhase;

/// Byte-level progress of a running transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// 0..=100, non-decreasing for a given transfer
    pub percent: u8,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
}

/// How a transfer ended. Emitted exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TerminalEvent {
    Completed {
        path: PathBuf,
        bytes: u64,
        checksum: Option<ChecksumValue>,
    },
    Cancelled {
        /// The temp artifact, if it was left on disk
        partial: Option<PathBuf>,
    },
    Failed {
        kind: FailureKind,
        message: String,
    },
}

impl TerminalEvent {
    pub fn failed(err: &EngineError) -> Self {
        TerminalEvent::Failed {
            kind: err.failure_kind(),
            message: err.to_string(),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TerminalEvent::Completed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransferEvent {
    /// The stream is open; `resumed_from` bytes were already on disk
    Started {
        total_bytes: u64,
        resumed_from: u64,
        filename: String,
    },
    Progress(ProgressEvent),
    /// The producer reached a checkpoint and is now blocked
    Paused { bytes_transferred: u64 },
    /// The producer left a paused checkpoint
    Resumed,
    Terminal(TerminalEvent),
}

impl TransferEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferEvent::Terminal(_))
    }
}

/// Summary returned when a controller waits on a transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferReport {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub bytes_transferred: u64,
    pub resumed_from: u64,
    /// Phase the state machine ended in
    pub phase: TransferPhase,
    pub outcome: TerminalEvent,
}

impl TransferReport {
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}
