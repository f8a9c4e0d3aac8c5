//! ARP resolution over a capture device.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use macaddr::MacAddr6;
use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, ArpPacket, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::Packet;
use pnet::util::MacAddr;
use tracing::{debug, info, warn};

use crate::backend::ReceiveStatus;
use crate::config::DeviceConfig;
use crate::device::CaptureDevice;
use crate::error::CaptureError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const ETHERNET_HEADER_LEN: usize = 14;
const ARP_PACKET_LEN: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResolveState {
    Idle,
    RequestSent,
    WaitingReply,
    Resolved(MacAddr6),
    TimedOut,
}

/// Resolves IPv4 addresses to hardware addresses on one device.
///
/// The device must not be capturing: the resolver reads replies with
/// `get_next_packet`. If the device is closed the resolver opens it for the
/// duration of the request and closes it again afterwards.
pub struct ArpResolver<'a> {
    device: &'a CaptureDevice,
    timeout: Duration,
}

impl<'a> ArpResolver<'a> {
    pub fn new(device: &'a CaptureDevice) -> Self {
        Self {
            device,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// How long to wait for a reply.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolve `target` using the device's own IPv4 and hardware address.
    pub fn resolve(&self, target: Ipv4Addr) -> Result<Option<MacAddr6>, CaptureError> {
        let info = self.device.info();
        let local_ip = info.ipv4().ok_or_else(|| {
            CaptureError::not_ready(format!("{} has no IPv4 address", info.name()))
        })?;
        let local_mac = info.mac_address.ok_or_else(|| {
            CaptureError::not_ready(format!("{} has no hardware address", info.name()))
        })?;
        self.resolve_from(target, local_ip, local_mac)
    }

    /// Resolve `target`, sending the request from the given addresses.
    ///
    /// Returns `Ok(None)` if no reply arrives before the timeout.
    pub fn resolve_from(
        &self,
        target: Ipv4Addr,
        local_ip: Ipv4Addr,
        local_mac: MacAddr6,
    ) -> Result<Option<MacAddr6>, CaptureError> {
        let opened_here = !self.device.is_open();
        if opened_here {
            self.device
                .open(DeviceConfig::default().with_read_timeout(POLL_INTERVAL))?;
        }
        let previous_filter = self.device.filter();

        let result = self.exchange(target, local_ip, local_mac);

        if opened_here {
            self.device.close();
        } else {
            let restored = match &previous_filter {
                Some(expression) => self.device.set_filter(expression),
                None => self.device.clear_filter(),
            };
            match restored {
                Ok(()) | Err(CaptureError::Unsupported { .. }) => {}
                Err(e) => warn!("Could not restore filter on {}: {}", self.device.name(), e),
            }
        }
        result
    }

    fn exchange(
        &self,
        target: Ipv4Addr,
        local_ip: Ipv4Addr,
        local_mac: MacAddr6,
    ) -> Result<Option<MacAddr6>, CaptureError> {
        let mut state = ResolveState::Idle;
        debug!("ARP {} on {}: {:?}", target, self.device.name(), state);

        // Replies only: the ARP opcode is the 16-bit field at offset 6
        let filter = format!("arp and arp[6:2] = 2 and ether dst {}", to_pnet(local_mac));
        match self.device.set_filter(&filter) {
            Ok(()) | Err(CaptureError::Unsupported { .. }) => {}
            Err(e) => return Err(e),
        }

        let request = build_request(local_mac, local_ip, target);
        self.device.send(&request)?;
        state = ResolveState::RequestSent;
        debug!("ARP {} on {}: {:?}", target, self.device.name(), state);

        let deadline = Instant::now() + self.timeout;
        while let ResolveState::RequestSent | ResolveState::WaitingReply = state {
            let now = Instant::now();
            if now >= deadline {
                state = ResolveState::TimedOut;
                break;
            }
            let wait = (deadline - now).min(POLL_INTERVAL);

            state = match self.device.get_next_packet_timeout(wait)? {
                ReceiveStatus::PacketRead(packet) => match parse_reply(packet.data(), target) {
                    Some(mac) => ResolveState::Resolved(mac),
                    None => ResolveState::WaitingReply,
                },
                ReceiveStatus::ReadTimeout => ResolveState::WaitingReply,
                ReceiveStatus::NoRemainingPackets => ResolveState::TimedOut,
                ReceiveStatus::Error(reason) => {
                    warn!("ARP read on {} failed: {}", self.device.name(), reason);
                    ResolveState::TimedOut
                }
            };
        }

        match state {
            ResolveState::Resolved(mac) => {
                info!("{} is at {}", target, mac);
                Ok(Some(mac))
            }
            _ => {
                debug!("No ARP reply for {} within {:?}", target, self.timeout);
                Ok(None)
            }
        }
    }
}

fn to_pnet(mac: MacAddr6) -> MacAddr {
    let [a, b, c, d, e, f] = mac.into_array();
    MacAddr::new(a, b, c, d, e, f)
}

/// A broadcast who-has request for `target`.
pub(crate) fn build_request(
    local_mac: MacAddr6,
    local_ip: Ipv4Addr,
    target: Ipv4Addr,
) -> Vec<u8> {
    let mut arp_buf = [0u8; ARP_PACKET_LEN];
    if let Some(mut arp) = MutableArpPacket::new(&mut arp_buf) {
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(ArpOperations::Request);
        arp.set_sender_hw_addr(to_pnet(local_mac));
        arp.set_sender_proto_addr(local_ip);
        arp.set_target_hw_addr(MacAddr::zero());
        arp.set_target_proto_addr(target);
    }

    let mut frame = vec![0u8; ETHERNET_HEADER_LEN + ARP_PACKET_LEN];
    if let Some(mut ethernet) = MutableEthernetPacket::new(&mut frame) {
        ethernet.set_destination(MacAddr::broadcast());
        ethernet.set_source(to_pnet(local_mac));
        ethernet.set_ethertype(EtherTypes::Arp);
        ethernet.set_payload(&arp_buf);
    }
    frame
}

/// The sender hardware address of an ARP reply from `target`, if `frame` is one.
pub(crate) fn parse_reply(frame: &[u8], target: Ipv4Addr) -> Option<MacAddr6> {
    let ethernet = EthernetPacket::new(frame)?;
    if ethernet.get_ethertype() != EtherTypes::Arp {
        return None;
    }
    let arp = ArpPacket::new(ethernet.payload())?;
    if arp.get_operation() != ArpOperations::Reply || arp.get_sender_proto_addr() != target {
        return None;
    }
    Some(MacAddr6::from(arp.get_sender_hw_addr().octets()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, MockHandle, WhenExhausted};
    use crate::device::DeviceState;
    use crate::domain::{DeviceAddress, DeviceInfo};
    use std::net::IpAddr;

    const LOCAL_MAC: MacAddr6 = MacAddr6::new(0x02, 0x00, 0x00, 0x00, 0x00, 0x01);
    const PEER_MAC: MacAddr6 = MacAddr6::new(0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee);
    const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const PEER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);

    fn build_reply(request: &[u8]) -> Option<Vec<u8>> {
        let ethernet = EthernetPacket::new(request)?;
        let arp = ArpPacket::new(ethernet.payload())?;
        if arp.get_operation() != ArpOperations::Request || arp.get_target_proto_addr() != PEER_IP {
            return None;
        }

        let mut arp_buf = [0u8; ARP_PACKET_LEN];
        let mut reply = MutableArpPacket::new(&mut arp_buf)?;
        reply.set_hardware_type(ArpHardwareTypes::Ethernet);
        reply.set_protocol_type(EtherTypes::Ipv4);
        reply.set_hw_addr_len(6);
        reply.set_proto_addr_len(4);
        reply.set_operation(ArpOperations::Reply);
        reply.set_sender_hw_addr(to_pnet(PEER_MAC));
        reply.set_sender_proto_addr(PEER_IP);
        reply.set_target_hw_addr(arp.get_sender_hw_addr());
        reply.set_target_proto_addr(arp.get_sender_proto_addr());

        let mut frame = vec![0u8; ETHERNET_HEADER_LEN + ARP_PACKET_LEN];
        let mut out = MutableEthernetPacket::new(&mut frame)?;
        out.set_destination(arp.get_sender_hw_addr());
        out.set_source(to_pnet(PEER_MAC));
        out.set_ethertype(EtherTypes::Arp);
        out.set_payload(&arp_buf);
        Some(frame)
    }

    fn device() -> (CaptureDevice, MockHandle) {
        let (backend, handle) = MockBackend::new(vec![], WhenExhausted::Timeout);
        let info = DeviceInfo::new("mock0")
            .with_mac_address(LOCAL_MAC)
            .with_address(DeviceAddress::new(IpAddr::V4(LOCAL_IP)));
        (CaptureDevice::new(info, Box::new(backend)), handle)
    }

    #[test]
    fn test_request_layout() {
        let frame = build_request(LOCAL_MAC, LOCAL_IP, PEER_IP);
        assert_eq!(frame.len(), 42);

        let ethernet = EthernetPacket::new(&frame).unwrap();
        assert_eq!(ethernet.get_destination(), MacAddr::broadcast());
        assert_eq!(ethernet.get_ethertype(), EtherTypes::Arp);

        let arp = ArpPacket::new(ethernet.payload()).unwrap();
        assert_eq!(arp.get_operation(), ArpOperations::Request);
        assert_eq!(arp.get_sender_proto_addr(), LOCAL_IP);
        assert_eq!(arp.get_target_proto_addr(), PEER_IP);
    }

    #[test]
    fn test_parse_reply_ignores_other_senders() {
        let request = build_request(LOCAL_MAC, LOCAL_IP, PEER_IP);
        let reply = build_reply(&request).unwrap();

        assert_eq!(parse_reply(&reply, PEER_IP), Some(PEER_MAC));
        assert_eq!(parse_reply(&reply, Ipv4Addr::new(10, 0, 0, 9)), None);
        // A request is not a reply
        assert_eq!(parse_reply(&request, LOCAL_IP), None);
    }

    #[test]
    fn test_resolves_from_reply() {
        let (device, handle) = device();
        handle.state().responder = Some(Box::new(build_reply));

        let mac = ArpResolver::new(&device).resolve(PEER_IP).unwrap();

        assert_eq!(mac, Some(PEER_MAC));
        let state = handle.state();
        assert_eq!(state.sent.len(), 1);
        assert_eq!(
            state.filter.as_deref(),
            Some("arp and arp[6:2] = 2 and ether dst 02:00:00:00:00:01")
        );
        // Opened by the resolver, so closed again
        assert!(!state.open);
        drop(state);
        assert_eq!(device.state(), DeviceState::Closed);
    }

    #[test]
    fn test_no_reply_times_out() {
        let (device, handle) = device();

        let started = Instant::now();
        let mac = ArpResolver::new(&device)
            .with_timeout(Duration::from_millis(250))
            .resolve(Ipv4Addr::new(10, 0, 0, 77))
            .unwrap();

        assert_eq!(mac, None);
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert_eq!(handle.state().sent.len(), 1);
    }

    #[test]
    fn test_leaves_caller_opened_device_open() {
        let (device, handle) = device();
        handle.state().responder = Some(Box::new(build_reply));
        device
            .open(DeviceConfig::default().with_read_timeout(Duration::from_millis(50)))
            .unwrap();
        device.set_filter("tcp").unwrap();

        let mac = ArpResolver::new(&device)
            .resolve_from(PEER_IP, LOCAL_IP, LOCAL_MAC)
            .unwrap();

        assert_eq!(mac, Some(PEER_MAC));
        assert_eq!(device.state(), DeviceState::Opened);
        assert_eq!(device.filter().as_deref(), Some("tcp"));
    }

    #[test]
    fn test_clears_its_filter_when_caller_had_none() {
        let (device, handle) = device();
        device
            .open(DeviceConfig::default().with_read_timeout(Duration::from_millis(50)))
            .unwrap();

        let mac = ArpResolver::new(&device)
            .with_timeout(Duration::from_millis(50))
            .resolve_from(PEER_IP, LOCAL_IP, LOCAL_MAC)
            .unwrap();

        assert_eq!(mac, None);
        assert_eq!(device.state(), DeviceState::Opened);
        assert_eq!(device.filter(), None);
        assert_eq!(handle.state().filter, None);
    }

    #[test]
    fn test_requires_local_addresses() {
        let (backend, _handle) = MockBackend::new(vec![], WhenExhausted::Timeout);
        let device = CaptureDevice::new(DeviceInfo::new("bare0"), Box::new(backend));

        let err = ArpResolver::new(&device).resolve(PEER_IP).unwrap_err();
        assert!(matches!(err, CaptureError::DeviceNotReady(_)));
    }
}
