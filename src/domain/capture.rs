//! Captured frame domain models.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

/// Link-layer header types, using the libpcap `DLT_`/`LINKTYPE_` numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkType {
    Null,
    Ethernet,
    Raw,
    LinuxSll,
    Ieee80211Radiotap,
    Ipv4,
    Ipv6,
    Unknown(u32),
}

impl LinkType {
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Null,
            1 => Self::Ethernet,
            101 => Self::Raw,
            113 => Self::LinuxSll,
            127 => Self::Ieee80211Radiotap,
            228 => Self::Ipv4,
            229 => Self::Ipv6,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            Self::Null => 0,
            Self::Ethernet => 1,
            Self::Raw => 101,
            Self::LinuxSll => 113,
            Self::Ieee80211Radiotap => 127,
            Self::Ipv4 => 228,
            Self::Ipv6 => 229,
            Self::Unknown(code) => *code,
        }
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Ethernet => write!(f, "EN10MB"),
            Self::Raw => write!(f, "RAW"),
            Self::LinuxSll => write!(f, "LINUX_SLL"),
            Self::Ieee80211Radiotap => write!(f, "IEEE802_11_RADIO"),
            Self::Ipv4 => write!(f, "IPV4"),
            Self::Ipv6 => write!(f, "IPV6"),
            Self::Unknown(code) => write!(f, "Unknown({code})"),
        }
    }
}

/// A two-part capture timestamp.
///
/// The microsecond part is only as precise as the backend that produced
/// it; libpcap reports kernel timestamps, the datalink and TUN/TAP
/// backends stamp frames with the wall clock when `receive` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PosixTimeval {
    pub seconds: u64,
    pub microseconds: u32,
}

impl PosixTimeval {
    pub fn new(seconds: u64, microseconds: u32) -> Self {
        // Normalize so that microseconds stays below one second
        Self {
            seconds: seconds + u64::from(microseconds / 1_000_000),
            microseconds: microseconds % 1_000_000,
        }
    }

    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            seconds: since_epoch.as_secs(),
            microseconds: since_epoch.subsec_micros(),
        }
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.seconds) + Duration::from_micros(u64::from(self.microseconds))
    }

    pub fn to_system_time(&self) -> SystemTime {
        UNIX_EPOCH + self.as_duration()
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.to_system_time())
    }

    /// Time elapsed since `earlier`, zero if `earlier` is later than `self`.
    pub fn saturating_since(&self, earlier: &PosixTimeval) -> Duration {
        self.as_duration().saturating_sub(earlier.as_duration())
    }
}

impl fmt::Display for PosixTimeval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.seconds, self.microseconds)
    }
}

/// Where a frame's timestamp came from, and so how far it can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TimestampSource {
    /// Taken by the kernel or driver when the frame arrived (libpcap)
    #[default]
    Kernel,
    /// Host wall clock read when `receive` returned
    HostClock,
}

/// One captured frame.
///
/// Immutable once produced by a backend. Observers that need to modify
/// the bytes should copy them first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCapture {
    link_type: LinkType,
    timeval: PosixTimeval,
    timestamp_source: TimestampSource,
    data: Vec<u8>,
}

impl RawCapture {
    pub fn new(link_type: LinkType, timeval: PosixTimeval, data: Vec<u8>) -> Self {
        Self {
            link_type,
            timeval,
            timestamp_source: TimestampSource::Kernel,
            data,
        }
    }

    pub fn with_timestamp_source(mut self, source: TimestampSource) -> Self {
        self.timestamp_source = source;
        self
    }

    pub fn link_type(&self) -> LinkType {
        self.link_type
    }

    pub fn timeval(&self) -> PosixTimeval {
        self.timeval
    }

    pub fn timestamp_source(&self) -> TimestampSource {
        self.timestamp_source
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_type_roundtrip_known_values() {
        for code in [0, 1, 101, 113, 127, 228, 229] {
            assert_eq!(LinkType::from_u32(code).as_u32(), code);
        }
        assert_eq!(LinkType::from_u32(1), LinkType::Ethernet);
        assert_eq!(LinkType::from_u32(9999), LinkType::Unknown(9999));
    }

    #[test]
    fn test_timeval_normalizes_microseconds() {
        let tv = PosixTimeval::new(10, 2_500_000);
        assert_eq!(tv.seconds, 12);
        assert_eq!(tv.microseconds, 500_000);
    }

    #[test]
    fn test_timeval_ordering_and_difference() {
        let a = PosixTimeval::new(100, 900_000);
        let b = PosixTimeval::new(101, 100_000);
        assert!(a < b);
        assert_eq!(b.saturating_since(&a), Duration::from_millis(200));
        assert_eq!(a.saturating_since(&b), Duration::ZERO);
    }

    #[test]
    fn test_timeval_display() {
        assert_eq!(PosixTimeval::new(5, 42).to_string(), "5.000042");
    }

    #[test]
    fn test_timeval_datetime() {
        let tv = PosixTimeval::new(1_700_000_000, 0);
        assert_eq!(tv.to_datetime().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_raw_capture_accessors() {
        let raw = RawCapture::new(LinkType::Ethernet, PosixTimeval::new(1, 2), vec![1, 2, 3]);
        assert_eq!(raw.len(), 3);
        assert!(!raw.is_empty());
        assert_eq!(raw.data(), &[1, 2, 3]);
        assert_eq!(raw.link_type(), LinkType::Ethernet);
        assert_eq!(raw.timestamp_source(), TimestampSource::Kernel);
        assert_eq!(raw.into_data(), vec![1, 2, 3]);
    }
}
