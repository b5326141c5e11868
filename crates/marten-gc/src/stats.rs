//! Collection statistics.

use std::time::Duration;

/// Counters accumulated across the lifetime of a collector.
#[derive(Debug, Default, Clone)]
pub struct GcStats {
    /// Number of completed collections.
    pub collections: u64,
    /// Bytes reclaimed by the last collection.
    pub last_reclaimed: usize,
    /// Bytes reclaimed across all collections.
    pub total_reclaimed: usize,
    /// Wall-clock duration of the last collection.
    pub last_pause: Duration,
    /// Wall-clock duration summed across all collections.
    pub total_pause: Duration,
}
