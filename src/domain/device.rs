//! Device identity and backend-reported device attributes.

use std::fmt;
use std::net::IpAddr;

use bitflags::bitflags;
use macaddr::MacAddr6;

/// Stable key correlating the same device across enumerations.
///
/// This is the interface name for live interfaces and the file or
/// character-device path for offline and TUN/TAP handles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceIdentity {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for DeviceIdentity {
    fn from(name: String) -> Self {
        Self(name)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeviceFlags: u32 {
        const UP = 1;
        const RUNNING = 1 << 1;
        const LOOPBACK = 1 << 2;
        const WIRELESS = 1 << 3;
    }
}

/// One address assigned to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAddress {
    pub addr: IpAddr,
    pub netmask: Option<IpAddr>,
    pub broadcast: Option<IpAddr>,
}

impl DeviceAddress {
    pub fn new(addr: IpAddr) -> Self {
        Self {
            addr,
            netmask: None,
            broadcast: None,
        }
    }
}

/// Everything a backend enumeration reports about a device.
///
/// Only `identity` is fixed. The remaining fields are refreshed in place
/// when the device list is re-enumerated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub identity: DeviceIdentity,
    pub description: Option<String>,
    pub addresses: Vec<DeviceAddress>,
    pub mac_address: Option<MacAddr6>,
    pub flags: DeviceFlags,
    pub interface_index: Option<u32>,
}

impl DeviceInfo {
    pub fn new(identity: impl Into<DeviceIdentity>) -> Self {
        Self {
            identity: identity.into(),
            description: None,
            addresses: Vec::new(),
            mac_address: None,
            flags: DeviceFlags::empty(),
            interface_index: None,
        }
    }

    pub fn name(&self) -> &str {
        self.identity.as_str()
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_address(mut self, address: DeviceAddress) -> Self {
        self.addresses.push(address);
        self
    }

    pub fn with_mac_address(mut self, mac: MacAddr6) -> Self {
        self.mac_address = Some(mac);
        self
    }

    pub fn with_flags(mut self, flags: DeviceFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_interface_index(mut self, index: u32) -> Self {
        self.interface_index = Some(index);
        self
    }

    /// First IPv4 address assigned to the device.
    pub fn ipv4(&self) -> Option<std::net::Ipv4Addr> {
        self.addresses.iter().find_map(|a| match a.addr {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
    }

    pub fn is_up(&self) -> bool {
        self.flags.contains(DeviceFlags::UP)
    }

    pub fn is_loopback(&self) -> bool {
        self.flags.contains(DeviceFlags::LOOPBACK)
    }

    /// Copy the backend-reported mutable fields from a fresh enumeration.
    pub(crate) fn update_from(&mut self, fresh: &DeviceInfo) {
        debug_assert_eq!(self.identity, fresh.identity);
        self.description = fresh.description.clone();
        self.addresses = fresh.addresses.clone();
        self.mac_address = fresh.mac_address;
        self.flags = fresh.flags;
        self.interface_index = fresh.interface_index;
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.is_up() { "UP" } else { "DOWN" };
        let ips: Vec<_> = self.addresses.iter().map(|a| a.addr.to_string()).collect();
        write!(
            f,
            "{}: {} [{}]",
            self.identity,
            status,
            if ips.is_empty() {
                "no IP".to_string()
            } else {
                ips.join(", ")
            }
        )?;
        if let Some(desc) = &self.description {
            write!(f, " {}", desc)?;
        }
        Ok(())
    }
}
