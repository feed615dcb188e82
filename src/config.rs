//! Store configuration.

use std::path::PathBuf;
use std::time::Duration;

/// default rotation threshold for the active segment
pub const DEFAULT_MAX_SEGMENT_BYTES: u64 = 10 * 1024 * 1024;
/// default interval between background merge attempts
pub const DEFAULT_MERGE_INTERVAL: Duration = Duration::from_secs(10);

/// Configuration for a [`Store`](crate::Store).
///
/// Callers (the binaries) apply any environment overrides before handing
/// the config to `Store::open`.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the segment files
    pub dir: PathBuf,

    /// Rotate the active segment before a write would push it past this
    /// many bytes. `0` disables rotation.
    pub max_segment_bytes: u64,

    /// How often the background compactor wakes up (default: 10s)
    pub merge_interval: Duration,
}

impl StoreConfig {
    /// Builds a config for `dir` with default sizing.
    pub fn new<P: Into<PathBuf>>(dir: P) -> StoreConfig {
        StoreConfig {
            dir: dir.into(),
            max_segment_bytes: DEFAULT_MAX_SEGMENT_BYTES,
            merge_interval: DEFAULT_MERGE_INTERVAL,
        }
    }

    /// Sets the rotation threshold.
    pub fn max_segment_bytes(mut self, bytes: u64) -> StoreConfig {
        self.max_segment_bytes = bytes;
        self
    }

    /// Sets the background merge interval.
    pub fn merge_interval(mut self, interval: Duration) -> StoreConfig {
        self.merge_interval = interval;
        self
    }
}
