//! pnet datalink channel backend.
//!
//! Reads whole link-layer frames from a datalink channel, the way a
//! packet-filter driver hands frames to user space. Frames are annotated
//! with their 802.1Q VLAN tag and whether this host sent them.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use macaddr::MacAddr6;
use pnet::datalink::{
    self, Channel, ChannelType, Config, DataLinkReceiver, DataLinkSender, NetworkInterface,
};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::vlan::VlanPacket;
use pnet::packet::Packet;
use tracing::{debug, info};

use super::{Backend, ReceiveStatus};
use crate::config::DeviceConfig;
use crate::domain::{
    CaptureHeader, CaptureStatistics, CapturedPacket, DatalinkHeader, DeviceAddress, DeviceFlags,
    DeviceInfo, LinkType, PacketSource, PosixTimeval, RawCapture, TimestampSource,
};
use crate::error::CaptureError;

/// Large enough for any frame on a jumbo-frame link.
const CHANNEL_BUFFER_SIZE: usize = 65536;

/// An open pnet channel pair.
pub(super) struct PnetChannel {
    pub tx: Box<dyn DataLinkSender>,
    pub rx: Box<dyn DataLinkReceiver>,
    pub interface: NetworkInterface,
}

impl PnetChannel {
    /// Open a channel on the named interface.
    pub fn open(
        name: &str,
        config: &DeviceConfig,
        channel_type: ChannelType,
    ) -> Result<Self, CaptureError> {
        let interface = find_interface(name)?;

        let pnet_config = Config {
            read_timeout: Some(config.read_timeout),
            read_buffer_size: CHANNEL_BUFFER_SIZE,
            write_buffer_size: CHANNEL_BUFFER_SIZE,
            channel_type,
            promiscuous: config.promiscuous,
            ..Config::default()
        };

        match datalink::channel(&interface, pnet_config) {
            Ok(Channel::Ethernet(tx, rx)) => Ok(Self { tx, rx, interface }),
            Ok(_) => Err(CaptureError::DeviceOpen {
                device: name.to_string(),
                reason: "unsupported channel type".to_string(),
            }),
            Err(e) => Err(CaptureError::open_failed(name, e)),
        }
    }

    /// Read one frame, mapping pnet's timeout errors onto `ReadTimeout`.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, String> {
        match self.rx.next() {
            Ok(frame) => Ok(Some(frame.to_vec())),
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(None)
            }
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn send(&mut self, data: &[u8]) -> Result<usize, CaptureError> {
        match self.tx.send_to(data, None) {
            Some(Ok(())) => Ok(data.len()),
            Some(Err(e)) => Err(CaptureError::Send(e.to_string())),
            None => Err(CaptureError::Send("channel buffer unavailable".to_string())),
        }
    }
}

pub(super) fn find_interface(name: &str) -> Result<NetworkInterface, CaptureError> {
    datalink::interfaces()
        .into_iter()
        .find(|iface| iface.name == name)
        .ok_or_else(|| CaptureError::InterfaceNotFound(name.to_string()))
}

pub(super) fn reject_monitor_mode(
    name: &str,
    config: &DeviceConfig,
    backend: &str,
) -> Result<(), CaptureError> {
    if config.monitor_mode {
        return Err(CaptureError::DeviceOpen {
            device: name.to_string(),
            reason: format!("monitor mode is not supported by the {} backend", backend),
        });
    }
    Ok(())
}

/// Describe a pnet interface in backend-neutral terms.
pub(crate) fn device_info_from_interface(iface: &NetworkInterface) -> DeviceInfo {
    let mut flags = DeviceFlags::empty();
    if iface.is_up() {
        flags |= DeviceFlags::UP;
    }
    if iface.is_loopback() {
        flags |= DeviceFlags::LOOPBACK;
    }

    let mut info = DeviceInfo::new(iface.name.as_str())
        .with_flags(flags)
        .with_interface_index(iface.index);
    if !iface.description.is_empty() {
        info = info.with_description(iface.description.clone());
    }
    if let Some(mac) = iface.mac {
        info = info.with_mac_address(MacAddr6::from(mac.octets()));
    }
    for network in &iface.ips {
        let addr = network.ip();
        let netmask = network.mask();
        info = info.with_address(DeviceAddress {
            addr,
            netmask: Some(netmask),
            broadcast: broadcast_address(addr, netmask),
        });
    }
    info
}

fn broadcast_address(addr: IpAddr, netmask: IpAddr) -> Option<IpAddr> {
    match (addr, netmask) {
        (IpAddr::V4(a), IpAddr::V4(m)) => {
            Some(IpAddr::V4(Ipv4Addr::from(u32::from(a) | !u32::from(m))))
        }
        // IPv6 has no broadcast
        _ => None,
    }
}

/// Layer-2 datalink channel backend.
pub struct DatalinkBackend {
    name: String,
    channel: Option<PnetChannel>,
    snapshot_len: usize,
    received: u64,
}

impl DatalinkBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channel: None,
            snapshot_len: usize::MAX,
            received: 0,
        }
    }
}

impl Backend for DatalinkBackend {
    fn kind(&self) -> &'static str {
        "datalink"
    }

    fn open(&mut self, config: &DeviceConfig) -> Result<(), CaptureError> {
        if self.channel.is_some() {
            return Ok(());
        }
        reject_monitor_mode(&self.name, config, self.kind())?;

        let channel = PnetChannel::open(&self.name, config, ChannelType::Layer2)?;
        self.snapshot_len = config.snapshot_len as usize;
        self.received = 0;
        self.channel = Some(channel);

        info!("Opened datalink channel on {}", self.name);
        Ok(())
    }

    fn close(&mut self) {
        if self.channel.take().is_some() {
            debug!("Closed datalink channel on {}", self.name);
        }
    }

    fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    fn link_type(&self) -> LinkType {
        LinkType::Ethernet
    }

    fn receive(&mut self, _timeout: Duration) -> ReceiveStatus {
        let Some(channel) = self.channel.as_mut() else {
            return ReceiveStatus::Error("datalink channel is not open".to_string());
        };

        match channel.next_frame() {
            Ok(Some(mut frame)) => {
                self.received += 1;
                let timeval = PosixTimeval::now();
                let own_mac = channel.interface.mac.map(|m| m.octets());
                let header = DatalinkHeader {
                    timeval,
                    interface_index: channel.interface.index,
                    source: frame_source(&frame, own_mac),
                    vlan: vlan_tag(&frame),
                };
                frame.truncate(self.snapshot_len);
                ReceiveStatus::PacketRead(CapturedPacket::new(
                    RawCapture::new(LinkType::Ethernet, timeval, frame)
                        .with_timestamp_source(TimestampSource::HostClock),
                    CaptureHeader::Datalink(header),
                ))
            }
            Ok(None) => ReceiveStatus::ReadTimeout,
            Err(e) => ReceiveStatus::Error(e),
        }
    }

    fn send(&mut self, data: &[u8]) -> Result<usize, CaptureError> {
        self.channel
            .as_mut()
            .ok_or_else(|| CaptureError::not_ready("datalink channel is not open"))?
            .send(data)
    }

    /// Only frames handed to user space are counted; the channel exposes
    /// no kernel drop counters.
    fn statistics(&mut self) -> Result<CaptureStatistics, CaptureError> {
        if self.channel.is_none() {
            return Err(CaptureError::not_ready("datalink channel is not open"));
        }
        Ok(CaptureStatistics {
            received: self.received,
            ..CaptureStatistics::default()
        })
    }
}

fn frame_source(frame: &[u8], own_mac: Option<[u8; 6]>) -> PacketSource {
    match (EthernetPacket::new(frame), own_mac) {
        (Some(eth), Some(mac)) if eth.get_source().octets() == mac => PacketSource::FromSystem,
        _ => PacketSource::FromNetwork,
    }
}

fn vlan_tag(frame: &[u8]) -> Option<u16> {
    let eth = EthernetPacket::new(frame)?;
    if eth.get_ethertype() != EtherTypes::Vlan {
        return None;
    }
    VlanPacket::new(eth.payload()).map(|vlan| vlan.get_vlan_identifier())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ethernet(src: [u8; 6], ethertype: [u8; 2], payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0xff; 6];
        frame.extend_from_slice(&src);
        frame.extend_from_slice(&ethertype);
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn test_vlan_tag_extracted() {
        // TCI 0x0064 = VLAN 100, inner ethertype IPv4
        let frame = ethernet([1, 2, 3, 4, 5, 6], [0x81, 0x00], &[0x00, 0x64, 0x08, 0x00, 0, 0]);
        assert_eq!(vlan_tag(&frame), Some(100));
    }

    #[test]
    fn test_untagged_frame_has_no_vlan() {
        let frame = ethernet([1, 2, 3, 4, 5, 6], [0x08, 0x00], &[0u8; 20]);
        assert_eq!(vlan_tag(&frame), None);
        assert_eq!(vlan_tag(&[0u8; 4]), None);
    }

    #[test]
    fn test_frame_source() {
        let own = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];
        let ours = ethernet(own, [0x08, 0x00], &[0u8; 20]);
        let theirs = ethernet([1, 2, 3, 4, 5, 6], [0x08, 0x00], &[0u8; 20]);

        assert_eq!(frame_source(&ours, Some(own)), PacketSource::FromSystem);
        assert_eq!(frame_source(&theirs, Some(own)), PacketSource::FromNetwork);
        assert_eq!(frame_source(&ours, None), PacketSource::FromNetwork);
    }

    #[test]
    fn test_broadcast_address() {
        let addr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10));
        let mask = IpAddr::V4(Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(
            broadcast_address(addr, mask),
            Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 255)))
        );
        assert_eq!(
            broadcast_address("fe80::1".parse().unwrap(), "ffff::".parse().unwrap()),
            None
        );
    }

    #[test]
    fn test_monitor_mode_rejected() {
        let mut backend = DatalinkBackend::new("eth0");
        let err = backend
            .open(&DeviceConfig::default().with_monitor_mode(true))
            .unwrap_err();
        assert!(matches!(err, CaptureError::DeviceOpen { .. }));
        assert!(!backend.is_open());
    }

    #[test]
    fn test_unknown_interface() {
        let mut backend = DatalinkBackend::new("definitely-not-an-interface0");
        let err = backend.open(&DeviceConfig::default()).unwrap_err();
        assert!(matches!(err, CaptureError::InterfaceNotFound(_)));
    }
}
