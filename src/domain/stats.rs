//! Capture statistics.

use std::fmt;

/// Counters reported by a backend since the device was opened.
///
/// All counters are monotonically non-decreasing for the lifetime of one
/// open handle and restart from zero when the device is reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureStatistics {
    pub received: u64,
    /// Dropped because the kernel or driver buffer overflowed
    pub dropped: u64,
    /// Dropped by the network interface before reaching the buffer
    pub interface_dropped: u64,
}

impl fmt::Display for CaptureStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received={} dropped={} if_dropped={}",
            self.received, self.dropped, self.interface_dropped
        )
    }
}
