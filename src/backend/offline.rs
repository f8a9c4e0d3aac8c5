//! Offline capture file backend.
//!
//! Replays a pcap/pcapng file through the same contract as a live handle.
//! End of file is reported as `NoRemainingPackets`, which the capture
//! loop treats exactly like a live capture that ran out of packets.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use super::pcap_live::map_next_packet;
use super::{filter_syntax_error, Backend, ReceiveStatus};
use crate::config::DeviceConfig;
use crate::domain::LinkType;
use crate::error::CaptureError;

pub struct OfflineBackend {
    path: PathBuf,
    capture: Option<pcap::Capture<pcap::Offline>>,
    link_type: LinkType,
}

impl OfflineBackend {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            capture: None,
            link_type: LinkType::Ethernet,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Backend for OfflineBackend {
    fn kind(&self) -> &'static str {
        "offline"
    }

    fn open(&mut self, _config: &DeviceConfig) -> Result<(), CaptureError> {
        if self.capture.is_some() {
            return Ok(());
        }
        let name = self.path.display().to_string();
        if !self.path.exists() {
            return Err(CaptureError::DeviceOpen {
                device: name,
                reason: "file does not exist".to_string(),
            });
        }

        let capture =
            pcap::Capture::from_file(&self.path).map_err(|e| CaptureError::open_failed(&name, e))?;
        self.link_type = LinkType::from_u32(capture.get_datalink().0 as u32);
        self.capture = Some(capture);

        info!("Opened capture file {} (link type {})", name, self.link_type);
        Ok(())
    }

    fn close(&mut self) {
        if self.capture.take().is_some() {
            debug!("Closed capture file {}", self.path.display());
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
            None => ReceiveStatus::Error("capture file is not open".to_string()),
        }
    }

    fn send(&mut self, _data: &[u8]) -> Result<usize, CaptureError> {
        Err(CaptureError::unsupported(self.kind(), "send"))
    }

    fn set_filter(&mut self, expression: &str) -> Result<(), CaptureError> {
        let capture = self
            .capture
            .as_mut()
            .ok_or_else(|| CaptureError::not_ready("capture file is not open"))?;
        capture
            .filter(expression, true)
            .map_err(|e| filter_syntax_error(expression, &e.to_string()))
    }
}

/// Write a minimal little-endian pcap file of Ethernet frames.
#[cfg(test)]
pub(crate) fn write_test_pcap(path: &Path, frames: &[Vec<u8>]) -> std::io::Result<()> {
    use std::io::Write;

    let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
    out.write_all(&0xa1b2_c3d4u32.to_le_bytes())?;
    out.write_all(&2u16.to_le_bytes())?;
    out.write_all(&4u16.to_le_bytes())?;
    out.write_all(&0i32.to_le_bytes())?;
    out.write_all(&0u32.to_le_bytes())?;
    out.write_all(&65535u32.to_le_bytes())?;
    out.write_all(&1u32.to_le_bytes())?;

    for (i, frame) in frames.iter().enumerate() {
        let len = frame.len() as u32;
        out.write_all(&(1_700_000_000u32 + i as u32 / 1000).to_le_bytes())?;
        out.write_all(&((i as u32 % 1000) * 1000).to_le_bytes())?;
        out.write_all(&len.to_le_bytes())?;
        out.write_all(&len.to_le_bytes())?;
        out.write_all(frame)?;
    }
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CaptureHeader;
    use tempfile::TempDir;

    fn frame(i: u32) -> Vec<u8> {
        let mut data = vec![0xffu8; 12];
        data.extend_from_slice(&[0x08, 0x00]);
        data.extend_from_slice(&i.to_be_bytes());
        data
    }

    #[test]
    fn test_missing_file_is_open_error() {
        let mut backend = OfflineBackend::new("/nonexistent/capture.pcap");
        let err = backend.open(&DeviceConfig::default()).unwrap_err();
        assert!(matches!(err, CaptureError::DeviceOpen { .. }));
        assert!(!backend.is_open());
    }

    #[test]
    fn test_reads_frames_then_end_of_stream() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("three.pcap");
        write_test_pcap(&path, &[frame(0), frame(1), frame(2)]).unwrap();

        let mut backend = OfflineBackend::new(&path);
        backend.open(&DeviceConfig::default()).unwrap();
        assert_eq!(backend.link_type(), LinkType::Ethernet);

        for i in 0..3u32 {
            match backend.receive(Duration::from_millis(10)) {
                ReceiveStatus::PacketRead(packet) => {
                    assert_eq!(packet.data(), frame(i).as_slice());
                    match packet.header {
                        CaptureHeader::Pcap(h) => assert_eq!(h.caplen, 18),
                        other => panic!("unexpected header: {other:?}"),
                    }
                }
                other => panic!("unexpected status: {other:?}"),
            }
        }
        assert_eq!(
            backend.receive(Duration::from_millis(10)),
            ReceiveStatus::NoRemainingPackets
        );
    }

    #[test]
    fn test_send_and_statistics_unsupported() {
        let mut backend = OfflineBackend::new("x.pcap");
        assert!(matches!(
            backend.send(&[1, 2, 3]),
            Err(CaptureError::Unsupported { .. })
        ));
        assert!(matches!(
            backend.statistics(),
            Err(CaptureError::Unsupported { .. })
        ));
    }
}
