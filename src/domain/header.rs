//! Backend-specific metadata accompanying a captured frame.

use super::capture::PosixTimeval;

/// Anything that carries a capture timestamp.
pub trait Timestamped {
    fn timeval(&self) -> PosixTimeval;
}

/// Header reported by libpcap, both live and offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcapHeader {
    pub timeval: PosixTimeval,
    /// Bytes actually captured (bounded by the snapshot length)
    pub caplen: u32,
    /// Length of the frame on the wire
    pub len: u32,
}

/// Where a link-layer frame came from, relative to this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketSource {
    FromNetwork,
    FromSystem,
}

/// Header for frames read from a layer-2 datalink channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatalinkHeader {
    pub timeval: PosixTimeval,
    pub interface_index: u32,
    pub source: PacketSource,
    /// 802.1Q VLAN identifier, if the frame was tagged
    pub vlan: Option<u16>,
}

/// Direction of a diverted layer-3 packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Header for packets read from a layer-3 diversion channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DivertHeader {
    pub timeval: PosixTimeval,
    pub interface_index: u32,
    pub direction: Direction,
}

/// Header for frames read from a TUN/TAP character device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapHeader {
    pub timeval: PosixTimeval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureHeader {
    Pcap(PcapHeader),
    Datalink(DatalinkHeader),
    Divert(DivertHeader),
    Tap(TapHeader),
}

impl Timestamped for PcapHeader {
    fn timeval(&self) -> PosixTimeval {
        self.timeval
    }
}

impl Timestamped for DatalinkHeader {
    fn timeval(&self) -> PosixTimeval {
        self.timeval
    }
}

impl Timestamped for DivertHeader {
    fn timeval(&self) -> PosixTimeval {
        self.timeval
    }
}

impl Timestamped for TapHeader {
    fn timeval(&self) -> PosixTimeval {
        self.timeval
    }
}

impl Timestamped for CaptureHeader {
    fn timeval(&self) -> PosixTimeval {
        match self {
            CaptureHeader::Pcap(h) => h.timeval(),
            CaptureHeader::Datalink(h) => h.timeval(),
            CaptureHeader::Divert(h) => h.timeval(),
            CaptureHeader::Tap(h) => h.timeval(),
        }
    }
}
