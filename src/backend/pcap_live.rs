//! libpcap live capture backend.

use std::time::Duration;

use tracing::{debug, info};

use super::{filter_syntax_error, Backend, ReceiveStatus};
use crate::config::DeviceConfig;
use crate::domain::{
    CaptureHeader, CaptureStatistics, CapturedPacket, LinkType, PcapHeader, PosixTimeval,
    RawCapture,
};
use crate::error::CaptureError;

/// Blocking-read kernel capture handle opened through libpcap.
pub struct PcapBackend {
    device: String,
    capture: Option<pcap::Capture<pcap::Active>>,
    link_type: LinkType,
    counters: WidenedStats,
}

impl PcapBackend {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            capture: None,
            link_type: LinkType::Ethernet,
            counters: WidenedStats::default(),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    fn activate(&self, config: &DeviceConfig) -> Result<pcap::Capture<pcap::Active>, pcap::Error> {
        let mut inactive = pcap::Capture::from_device(self.device.as_str())?
            .promisc(config.promiscuous)
            .snaplen(config.snapshot_len.min(i32::MAX as u32) as i32)
            .timeout(config.read_timeout_ms())
            .immediate_mode(config.immediate_mode);

        if let Some(size) = config.buffer_size {
            inactive = inactive.buffer_size(size.min(i32::MAX as u32) as i32);
        }

        #[cfg(not(windows))]
        if config.monitor_mode {
            inactive = inactive.rfmon(true);
        }

        inactive.open()
    }
}

impl Backend for PcapBackend {
    fn kind(&self) -> &'static str {
        "pcap"
    }

    fn open(&mut self, config: &DeviceConfig) -> Result<(), CaptureError> {
        if self.capture.is_some() {
            return Ok(());
        }

        #[cfg(windows)]
        if config.monitor_mode {
            return Err(CaptureError::DeviceOpen {
                device: self.device.clone(),
                reason: "monitor mode is not available on this platform".to_string(),
            });
        }

        let capture = self
            .activate(config)
            .map_err(|e| CaptureError::open_failed(&self.device, e))?;

        self.link_type = LinkType::from_u32(capture.get_datalink().0 as u32);
        self.counters = WidenedStats::default();
        self.capture = Some(capture);

        info!("Opened pcap device {} (link type {})", self.device, self.link_type);
        Ok(())
    }

    fn close(&mut self) {
        if self.capture.take().is_some() {
            debug!("Closed pcap device {}", self.device);
        }
    }

    fn is_open(&self) -> bool {
        self.capture.is_some()
    }

    fn link_type(&self) -> LinkType {
        self.link_type
    }

    fn receive(&mut self, _timeout: Duration) -> ReceiveStatus {
        let link_type = self.link_type;
        match self.capture.as_mut() {
            Some(capture) => map_next_packet(capture.next_packet(), link_type),
            None => ReceiveStatus::Error("device is not open".to_string()),
        }
    }

    fn send(&mut self, data: &[u8]) -> Result<usize, CaptureError> {
        let capture = self
            .capture
            .as_mut()
            .ok_or_else(|| CaptureError::not_ready("pcap device is not open"))?;
        capture
            .sendpacket(data)
            .map_err(|e| CaptureError::Send(e.to_string()))?;
        Ok(data.len())
    }

    fn set_filter(&mut self, expression: &str) -> Result<(), CaptureError> {
        let capture = self
            .capture
            .as_mut()
            .ok_or_else(|| CaptureError::not_ready("pcap device is not open"))?;
        capture
            .filter(expression, true)
            .map_err(|e| filter_syntax_error(expression, &e.to_string()))
    }

    fn statistics(&mut self) -> Result<CaptureStatistics, CaptureError> {
        let capture = self
            .capture
            .as_mut()
            .ok_or_else(|| CaptureError::not_ready("pcap device is not open"))?;
        let stat = capture
            .stats()
            .map_err(|e| CaptureError::Io(std::io::Error::other(e.to_string())))?;
        Ok(self.counters.update(stat.received, stat.dropped, stat.if_dropped))
    }
}

/// Map one libpcap read result onto the four-way receive status.
pub(super) fn map_next_packet(
    result: Result<pcap::Packet<'_>, pcap::Error>,
    link_type: LinkType,
) -> ReceiveStatus {
    match result {
        Ok(packet) => ReceiveStatus::PacketRead(captured_from_pcap(&packet, link_type)),
        Err(pcap::Error::TimeoutExpired) => ReceiveStatus::ReadTimeout,
        Err(pcap::Error::NoMorePackets) => ReceiveStatus::NoRemainingPackets,
        Err(e) => ReceiveStatus::Error(e.to_string()),
    }
}

fn captured_from_pcap(packet: &pcap::Packet<'_>, link_type: LinkType) -> CapturedPacket {
    let timeval = PosixTimeval::new(
        packet.header.ts.tv_sec as u64,
        packet.header.ts.tv_usec as u32,
    );
    let header = PcapHeader {
        timeval,
        caplen: packet.header.caplen,
        len: packet.header.len,
    };
    CapturedPacket::new(
        RawCapture::new(link_type, timeval, packet.data.to_vec()),
        CaptureHeader::Pcap(header),
    )
}

/// libpcap reports 32-bit counters that wrap; widen them so that the
/// reported statistics never decrease while the handle stays open.
#[derive(Debug, Default)]
struct WidenedStats {
    last: [u32; 3],
    totals: [u64; 3],
}

impl WidenedStats {
    fn update(&mut self, received: u32, dropped: u32, if_dropped: u32) -> CaptureStatistics {
        for (i, raw) in [received, dropped, if_dropped].into_iter().enumerate() {
            self.totals[i] += u64::from(raw.wrapping_sub(self.last[i]));
            self.last[i] = raw;
        }
        CaptureStatistics {
            received: self.totals[0],
            dropped: self.totals[1],
            interface_dropped: self.totals[2],
        }
    }
}
