//! Packet I/O backends.
//!
//! This module defines the `Backend` trait, the capability contract every
//! native packet-I/O mechanism implements. The capture engine is written
//! once against this trait and never against a concrete backend, so a new
//! mechanism (or a mock for tests) plugs in without touching the engine.

mod datalink;
mod divert;
mod offline;
mod pcap_live;
#[cfg(target_os = "linux")]
mod tap;

#[cfg(test)]
pub(crate) mod mock;

pub use datalink::DatalinkBackend;
pub(crate) use datalink::device_info_from_interface;
pub use divert::DivertBackend;
pub use offline::OfflineBackend;
#[cfg(test)]
pub(crate) use offline::write_test_pcap;
pub use pcap_live::PcapBackend;
#[cfg(target_os = "linux")]
pub use tap::{TapBackend, TapMode};

use std::time::Duration;

use tracing::warn;

use crate::config::DeviceConfig;
use crate::domain::{CaptureStatistics, CapturedPacket, LinkType};
use crate::error::CaptureError;
use crate::send_queue::{QueuedPacket, TransmitMode};

/// Outcome of a single receive attempt.
///
/// Every backend maps its native result onto exactly one of these four
/// outcomes. A fault is reported as `Error` rather than an `Err` so that
/// the capture loop can turn it into a stopped notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveStatus {
    PacketRead(CapturedPacket),
    /// Nothing arrived within the timeout; not an error
    ReadTimeout,
    /// End of stream (end of file, or the peer went away)
    NoRemainingPackets,
    Error(String),
}

/// Capability contract for a native packet-I/O resource.
///
/// A backend starts closed. `open` acquires the native handle and `close`
/// releases it; `close` must be safe to call on a closed backend.
pub trait Backend: Send {
    /// Short name used in logs and `Unsupported` errors.
    fn kind(&self) -> &'static str;

    fn open(&mut self, config: &DeviceConfig) -> Result<(), CaptureError>;

    fn close(&mut self);

    fn is_open(&self) -> bool;

    fn link_type(&self) -> LinkType;

    /// Block for at most `timeout` waiting for one packet.
    ///
    /// Backends whose native API fixes the timeout at open time use the
    /// configured read timeout instead.
    fn receive(&mut self, timeout: Duration) -> ReceiveStatus;

    /// Transmit one frame, returning the number of bytes sent.
    fn send(&mut self, data: &[u8]) -> Result<usize, CaptureError>;

    fn set_filter(&mut self, _expression: &str) -> Result<(), CaptureError> {
        Err(CaptureError::unsupported(self.kind(), "packet filters"))
    }

    /// Accept every packet again. An empty expression compiles to
    /// accept-all in libpcap.
    fn clear_filter(&mut self) -> Result<(), CaptureError> {
        self.set_filter("")
    }

    fn statistics(&mut self) -> Result<CaptureStatistics, CaptureError> {
        Err(CaptureError::unsupported(self.kind(), "statistics"))
    }

    /// Transmit a batch of queued packets, returning the bytes sent.
    ///
    /// Stops at the first failed send, so a result shorter than the batch
    /// means partial transmission. In `Synchronized` mode the gaps between
    /// recorded timestamps are reproduced.
    fn send_batch(&mut self, packets: &[QueuedPacket], mode: TransmitMode) -> usize {
        let mut sent = 0;
        let mut previous = None;

        for packet in packets {
            if mode == TransmitMode::Synchronized {
                if let Some(prev) = previous {
                    let gap = packet.timeval.saturating_since(&prev);
                    if !gap.is_zero() {
                        std::thread::sleep(gap);
                    }
                }
                previous = Some(packet.timeval);
            }

            match self.send(&packet.data) {
                Ok(n) => {
                    sent += n;
                    if n < packet.data.len() {
                        warn!(
                            "{} short send: {} of {} bytes",
                            self.kind(),
                            n,
                            packet.data.len()
                        );
                        break;
                    }
                }
                Err(e) => {
                    warn!("{} batch send stopped: {}", self.kind(), e);
                    break;
                }
            }
        }

        sent
    }
}

/// Build a `FilterSyntax` error, locating the offending token when the
/// native message quotes it.
pub(crate) fn filter_syntax_error(expression: &str, message: &str) -> CaptureError {
    let token = quoted_token(message).or_else(|| {
        message
            .split_once("illegal token: ")
            .map(|(_, rest)| rest.split_whitespace().next().unwrap_or(rest).to_string())
    });
    let position = token
        .as_deref()
        .filter(|t| !t.is_empty())
        .and_then(|t| expression.find(t));

    CaptureError::FilterSyntax {
        expression: expression.to_string(),
        message: message.to_string(),
        position,
        token,
    }
}

fn quoted_token(message: &str) -> Option<String> {
    let start = message.find('\'')?;
    let rest = &message[start + 1..];
    let end = rest.find('\'')?;
    Some(rest[..end].to_string())
}
