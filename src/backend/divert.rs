//! Layer-3 packet diversion backend.
//!
//! Opens an IP-level channel on an interface, so packets arrive without a
//! link-layer header. Each packet's direction is derived from whether its
//! source address belongs to the interface.

use std::net::IpAddr;
use std::time::Duration;

use pnet::datalink::ChannelType;
use pnet::packet::ethernet::EtherTypes;
use pnet::packet::ipv4::Ipv4Packet;
use tracing::{debug, info};

use super::datalink::{reject_monitor_mode, PnetChannel};
use super::{Backend, ReceiveStatus};
use crate::config::DeviceConfig;
use crate::domain::{
    CaptureHeader, CapturedPacket, Direction, DivertHeader, LinkType, PosixTimeval, RawCapture,
    TimestampSource,
};
use crate::error::CaptureError;

pub struct DivertBackend {
    name: String,
    channel: Option<PnetChannel>,
    local_addrs: Vec<IpAddr>,
}

impl DivertBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channel: None,
            local_addrs: Vec::new(),
        }
    }
}

impl Backend for DivertBackend {
    fn kind(&self) -> &'static str {
        "divert"
    }

    fn open(&mut self, config: &DeviceConfig) -> Result<(), CaptureError> {
        if self.channel.is_some() {
            return Ok(());
        }
        reject_monitor_mode(&self.name, config, self.kind())?;

        let channel =
            PnetChannel::open(&self.name, config, ChannelType::Layer3(EtherTypes::Ipv4.0))?;
        self.local_addrs = channel.interface.ips.iter().map(|n| n.ip()).collect();
        self.channel = Some(channel);

        info!("Opened layer-3 channel on {}", self.name);
        Ok(())
    }

    fn close(&mut self) {
        if self.channel.take().is_some() {
            debug!("Closed layer-3 channel on {}", self.name);
        }
    }

    fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    fn link_type(&self) -> LinkType {
        LinkType::Ipv4
    }

    fn receive(&mut self, _timeout: Duration) -> ReceiveStatus {
        let Some(channel) = self.channel.as_mut() else {
            return ReceiveStatus::Error("layer-3 channel is not open".to_string());
        };

        match channel.next_frame() {
            Ok(Some(packet)) => {
                let timeval = PosixTimeval::now();
                let header = DivertHeader {
                    timeval,
                    interface_index: channel.interface.index,
                    direction: direction_of(&packet, &self.local_addrs),
                };
                ReceiveStatus::PacketRead(CapturedPacket::new(
                    RawCapture::new(LinkType::Ipv4, timeval, packet)
                        .with_timestamp_source(TimestampSource::HostClock),
                    CaptureHeader::Divert(header),
                ))
            }
            Ok(None) => ReceiveStatus::ReadTimeout,
            Err(e) => ReceiveStatus::Error(e),
        }
    }

    fn send(&mut self, data: &[u8]) -> Result<usize, CaptureError> {
        self.channel
            .as_mut()
            .ok_or_else(|| CaptureError::not_ready("layer-3 channel is not open"))?
            .send(data)
    }
}

fn direction_of(packet: &[u8], local_addrs: &[IpAddr]) -> Direction {
    match Ipv4Packet::new(packet) {
        Some(ip) if local_addrs.contains(&IpAddr::V4(ip.get_source())) => Direction::Outbound,
        _ => Direction::Inbound,
    }
}
