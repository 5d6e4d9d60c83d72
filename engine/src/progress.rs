//! Progress accounting.
//!
//! Converts byte counts into a percentage that never moves backwards, so a
//! controller's progress display is monotonic even if a caller reports a
//! smaller count after a retried read.

/// Percentage of `total_bytes` covered by `bytes_so_far`, floored and clamped
/// to `0..=100`. An empty or undeclared total counts as complete.
pub fn percent(bytes_so_far: u64, total_bytes: u64) -> u8 {
    if total_bytes == 0 {
        return 100;
    }
    let scaled = (bytes_so_far as u128 * 100) / total_bytes as u128;
    scaled.min(100) as u8
}

/// Monotonic percentage tracker for a single transfer.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    last_percent: Option<u8>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a new observation in and return the visible percentage.
    pub fn update(&mut self, bytes_so_far: u64, total_bytes: u64) -> u8 {
        let current = percent(bytes_so_far, total_bytes);
        let visible = match self.last_percent {
            Some(prior) => prior.max(current),
            None => current,
        };
        self.last_percent = Some(visible);
        visible
    }

    pub fn is_complete(&self) -> bool {
        self.last_percent == Some(100)
    }
}
