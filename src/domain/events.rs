//! Domain events produced by the capture engine.

use std::fmt;

use super::capture::RawCapture;
use super::header::{CaptureHeader, Timestamped};

/// A frame together with the header its backend reported for it.
///
/// This is what packet observers receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPacket {
    pub raw: RawCapture,
    pub header: CaptureHeader,
}

impl CapturedPacket {
    pub fn new(raw: RawCapture, header: CaptureHeader) -> Self {
        Self { raw, header }
    }

    pub fn data(&self) -> &[u8] {
        self.raw.data()
    }
}

impl Timestamped for CapturedPacket {
    fn timeval(&self) -> super::PosixTimeval {
        self.header.timeval()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    /// Cancelled, packet limit reached, or end of stream
    Clean,
    /// The backend reported a fault
    Error,
}

/// Emitted exactly once each time a capture loop terminates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureStopped {
    pub status: CaptureStatus,
    pub diagnostic: String,
    /// Packets delivered to observers during this capture
    pub packets: u64,
}

impl CaptureStopped {
    pub fn clean(diagnostic: impl Into<String>, packets: u64) -> Self {
        Self {
            status: CaptureStatus::Clean,
            diagnostic: diagnostic.into(),
            packets,
        }
    }

    pub fn error(diagnostic: impl Into<String>, packets: u64) -> Self {
        Self {
            status: CaptureStatus::Error,
            diagnostic: diagnostic.into(),
            packets,
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == CaptureStatus::Error
    }
}

impl fmt::Display for CaptureStopped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self.status {
            CaptureStatus::Clean => "clean",
            CaptureStatus::Error => "error",
        };
        write!(
            f,
            "capture stopped ({}) after {} packets: {}",
            status, self.packets, self.diagnostic
        )
    }
}
