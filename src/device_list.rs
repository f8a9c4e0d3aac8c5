//! Enumeration of capture devices and reconciliation of the known set.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use macaddr::MacAddr6;
use tracing::{debug, info};

use crate::backend::{self, Backend, DatalinkBackend, DivertBackend, PcapBackend};
use crate::device::CaptureDevice;
use crate::domain::{DeviceAddress, DeviceFlags, DeviceIdentity, DeviceInfo};
use crate::error::CaptureError;

/// Source of devices for one backend family.
pub trait DeviceEnumerator: Send + Sync {
    /// Report every device currently present.
    fn enumerate(&self) -> Result<Vec<DeviceInfo>, CaptureError>;

    /// Build a closed backend for a newly discovered device.
    fn create_backend(&self, info: &DeviceInfo) -> Box<dyn Backend>;
}

/// Devices as libpcap sees them.
#[derive(Debug, Default, Clone, Copy)]
pub struct PcapEnumerator;

impl DeviceEnumerator for PcapEnumerator {
    fn enumerate(&self) -> Result<Vec<DeviceInfo>, CaptureError> {
        let devices = pcap::Device::list().map_err(|e| CaptureError::Enumeration(e.to_string()))?;
        let macs = hardware_addresses();
        Ok(devices
            .into_iter()
            .map(|d| {
                let mut info = pcap_device_info(&d);
                if let Some(mac) = macs.get(&d.name) {
                    info = info.with_mac_address(*mac);
                }
                info
            })
            .collect())
    }

    fn create_backend(&self, info: &DeviceInfo) -> Box<dyn Backend> {
        Box::new(PcapBackend::new(info.name()))
    }
}

fn pcap_device_info(device: &pcap::Device) -> DeviceInfo {
    let mut flags = DeviceFlags::empty();
    if device.flags.is_up() {
        flags |= DeviceFlags::UP;
    }
    if device.flags.is_running() {
        flags |= DeviceFlags::RUNNING;
    }
    if device.flags.is_loopback() {
        flags |= DeviceFlags::LOOPBACK;
    }
    if device.flags.is_wireless() {
        flags |= DeviceFlags::WIRELESS;
    }

    let mut info = DeviceInfo::new(device.name.as_str()).with_flags(flags);
    if let Some(desc) = &device.desc {
        info = info.with_description(desc.clone());
    }
    for address in &device.addresses {
        info = info.with_address(DeviceAddress {
            addr: address.addr,
            netmask: address.netmask,
            broadcast: address.broadcast_addr,
        });
    }
    info
}

/// libpcap does not report link-layer addresses; take them from the OS.
fn hardware_addresses() -> HashMap<String, MacAddr6> {
    pnet::datalink::interfaces()
        .into_iter()
        .filter_map(|iface| {
            let mac = iface.mac?;
            Some((iface.name, MacAddr6::from(mac.octets())))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PnetKind {
    Datalink,
    Divert,
}

/// Devices as the OS interface table reports them, opened through pnet.
#[derive(Debug, Clone, Copy)]
pub struct PnetEnumerator {
    kind: PnetKind,
}

impl PnetEnumerator {
    pub fn new(kind: PnetKind) -> Self {
        Self { kind }
    }
}

impl DeviceEnumerator for PnetEnumerator {
    fn enumerate(&self) -> Result<Vec<DeviceInfo>, CaptureError> {
        Ok(pnet::datalink::interfaces()
            .iter()
            .map(backend::device_info_from_interface)
            .collect())
    }

    fn create_backend(&self, info: &DeviceInfo) -> Box<dyn Backend> {
        match self.kind {
            PnetKind::Datalink => Box::new(DatalinkBackend::new(info.name())),
            PnetKind::Divert => Box::new(DivertBackend::new(info.name())),
        }
    }
}

/// The persistent set of devices for one enumerator.
///
/// Devices are handed out as `Arc`s and survive a refresh as long as the
/// interface is still present: a refresh updates their attributes in place
/// rather than replacing them, so a caller holding an open device keeps it.
pub struct DeviceList<E> {
    enumerator: E,
    devices: RwLock<Vec<Arc<CaptureDevice>>>,
}

impl<E: DeviceEnumerator> DeviceList<E> {
    /// An empty list. Call [`refresh`](Self::refresh) to populate it.
    pub fn new(enumerator: E) -> Self {
        Self {
            enumerator,
            devices: RwLock::new(Vec::new()),
        }
    }

    /// Re-enumerate and reconcile the known set with what is present now.
    pub fn refresh(&self) -> Result<(), CaptureError> {
        let fresh = self.enumerator.enumerate()?;
        debug!("Enumerated {} devices", fresh.len());

        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);

        for device in devices.iter() {
            if let Some(info) = fresh.iter().find(|f| &f.identity == device.identity()) {
                device.update_info(info);
            }
        }

        for info in &fresh {
            if !devices.iter().any(|d| d.identity() == &info.identity) {
                info!("Device added: {}", info);
                let backend = self.enumerator.create_backend(info);
                devices.push(Arc::new(CaptureDevice::new(info.clone(), backend)));
            }
        }

        devices.retain(|device| {
            let present = fresh.iter().any(|f| &f.identity == device.identity());
            if !present {
                info!("Device removed: {}", device.name());
            }
            present
        });

        Ok(())
    }

    /// Snapshot of the current devices.
    pub fn devices(&self) -> Vec<Arc<CaptureDevice>> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn find(&self, name: &str) -> Option<Arc<CaptureDevice>> {
        let identity = DeviceIdentity::new(name);
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|d| d.identity() == &identity)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.devices.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
