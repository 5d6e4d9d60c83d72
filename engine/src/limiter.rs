//! Pre-flight policy checks.
//!
//! A `TransferLimiter` is consulted after the source is resolved and before
//! the first content byte is requested. A refusal is a policy decision, not a
//! fault, and is reported with `FailureKind::PolicyRefused`.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::SourceInfo;

/// Declarative limits applied to a source before transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferLimiter {
    /// Longest source allowed, in seconds
    pub max_duration_secs: Option<u64>,

    /// Largest declared size allowed, in bytes
    pub max_size_bytes: Option<u64>,

    /// Refuse sources that do not declare a duration
    pub require_known_duration: bool,
}

impl Default for TransferLimiter {
    fn default() -> Self {
        TransferLimiter {
            max_duration_secs: Some(120),
            max_size_bytes: None,
            require_known_duration: false,
        }
    }
}

/// Why a source was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refusal {
    DurationExceeded { actual: Duration, limit: Duration },
    SizeExceeded { actual: u64, limit: u64 },
    /// An undeclared-size stream grew past the limit while transferring
    SizeLimitReached { limit: u64 },
    DurationUnknown,
}

// Whole seconds, rounded up so a source just over the limit never prints
// as equal to it.
fn whole_secs(duration: &Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

impl fmt::Display for Refusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Refusal::DurationExceeded { actual, limit } => write!(
                f,
                "Source is {}s long; the limit is {}s",
                whole_secs(actual),
                whole_secs(limit)
            ),
            Refusal::SizeExceeded { actual, limit } => write!(
                f,
                "Source is {} bytes; the limit is {} bytes",
                actual, limit
            ),
            Refusal::SizeLimitReached { limit } => write!(
                f,
                "Source is larger than the limit of {} bytes",
                limit
            ),
            Refusal::DurationUnknown => write!(f, "Source does not declare a duration"),
        }
    }
}

/// Outcome of a limiter check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitDecision {
    Allowed,
    Refused(Refusal),
}

impl TransferLimiter {
    /// A limiter that allows everything.
    pub fn unlimited() -> Self {
        TransferLimiter {
            max_duration_secs: None,
            max_size_bytes: None,
            require_known_duration: false,
        }
    }

    /// Limit sources to `secs` seconds.
    pub fn with_max_duration(secs: u64) -> Self {
        TransferLimiter {
            max_duration_secs: Some(secs),
            ..Self::unlimited()
        }
    }

    /// Evaluate the policy against a resolved source.
    ///
    /// Only declared metadata is inspected; nothing is fetched.
    pub fn check(&self, source: &SourceInfo) -> LimitDecision {
        match (source.duration, self.max_duration_secs) {
            (Some(actual), Some(limit)) => {
                let limit = Duration::from_secs(limit);
                if actual > limit {
                    return LimitDecision::Refused(Refusal::DurationExceeded { actual, limit });
                }
            }
            (None, _) if self.require_known_duration => {
                return LimitDecision::Refused(Refusal::DurationUnknown);
            }
            _ => {}
        }

        if let Some(limit) = self.max_size_bytes {
            if source.total_size > limit {
                return LimitDecision::Refused(Refusal::SizeExceeded {
                    actual: source.total_size,
                    limit,
                });
            }
        }

        LimitDecision::Allowed
    }

    /// Byte ceiling to enforce while streaming.
    ///
    /// `check` can only compare a declared size; when the source declares
    /// none, the size limit has to be applied to the bytes as they arrive.
    pub fn streaming_ceiling(&self, source: &SourceInfo) -> Option<u64> {
        if source.total_size == 0 {
            self.max_size_bytes
        } else {
            None
        }
    }
}
