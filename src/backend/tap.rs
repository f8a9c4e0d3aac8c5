//! TUN/TAP character device backend (Linux).
//!
//! The virtual interface is created (or attached to) by opening
//! `/dev/net/tun` and issuing `TUNSETIFF`. Frames written by the kernel to
//! the interface are read from the device file; frames written to the
//! device file are injected into the kernel as if they arrived on the
//! interface.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use tracing::{debug, info};

use super::{Backend, ReceiveStatus};
use crate::config::DeviceConfig;
use crate::domain::{
    CaptureHeader, CapturedPacket, LinkType, PosixTimeval, RawCapture, TapHeader, TimestampSource,
};
use crate::error::CaptureError;

const TUN_DEVICE_PATH: &str = "/dev/net/tun";

/// _IOW('T', 202, int)
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;
const IFNAMSIZ: usize = 16;

/// Largest frame read in one call.
const MAX_FRAME: usize = 65536;

#[repr(C)]
struct IfReq {
    name: [u8; IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapMode {
    /// Ethernet frames
    Tap,
    /// Bare IP packets
    Tun,
}

pub struct TapBackend {
    name: String,
    mode: TapMode,
    file: Option<File>,
    read_timeout: Duration,
    snapshot_len: usize,
}

impl TapBackend {
    pub fn new(name: impl Into<String>, mode: TapMode) -> Self {
        Self {
            name: name.into(),
            mode,
            file: None,
            read_timeout: Duration::from_millis(1000),
            snapshot_len: MAX_FRAME,
        }
    }

    /// Interface name; after open this is the name the kernel assigned.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn attach(&mut self) -> Result<File, CaptureError> {
        if self.name.len() >= IFNAMSIZ {
            return Err(CaptureError::DeviceOpen {
                device: self.name.clone(),
                reason: format!("interface name longer than {} bytes", IFNAMSIZ - 1),
            });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(TUN_DEVICE_PATH)
            .map_err(|e| CaptureError::open_failed(&self.name, e))?;

        let mut req = IfReq {
            name: [0; IFNAMSIZ],
            flags: IFF_NO_PI
                | match self.mode {
                    TapMode::Tap => IFF_TAP,
                    TapMode::Tun => IFF_TUN,
                },
            _pad: [0; 22],
        };
        req.name[..self.name.len()].copy_from_slice(self.name.as_bytes());

        // SAFETY: req is a properly sized, initialized ifreq and the fd is open
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req) };
        if rc < 0 {
            return Err(CaptureError::open_failed(
                &self.name,
                std::io::Error::last_os_error(),
            ));
        }

        let end = req.name.iter().position(|&b| b == 0).unwrap_or(IFNAMSIZ);
        self.name = String::from_utf8_lossy(&req.name[..end]).into_owned();
        Ok(file)
    }

    /// Wait for the device to become readable.
    fn poll_readable(file: &File, timeout: Duration) -> Result<bool, ReceiveStatus> {
        let mut pfd = libc::pollfd {
            fd: file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        // SAFETY: pfd points to one valid pollfd for the duration of the call
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(ReceiveStatus::Error(err.to_string()));
        }
        if rc == 0 {
            return Ok(false);
        }
        if pfd.revents & libc::POLLIN == 0 && pfd.revents & libc::POLLHUP != 0 {
            return Err(ReceiveStatus::NoRemainingPackets);
        }
        if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            return Err(ReceiveStatus::Error("device poll error".to_string()));
        }
        Ok(true)
    }
}

impl Backend for TapBackend {
    fn kind(&self) -> &'static str {
        "tap"
    }

    fn open(&mut self, config: &DeviceConfig) -> Result<(), CaptureError> {
        if self.file.is_some() {
            return Ok(());
        }
        if config.monitor_mode {
            return Err(CaptureError::DeviceOpen {
                device: self.name.clone(),
                reason: "monitor mode is not supported by the tap backend".to_string(),
            });
        }

        let file = self.attach()?;
        self.read_timeout = config.read_timeout;
        self.snapshot_len = (config.snapshot_len as usize).min(MAX_FRAME);
        self.file = Some(file);

        info!("Attached to {:?} device {}", self.mode, self.name);
        Ok(())
    }

    fn close(&mut self) {
        if self.file.take().is_some() {
            debug!("Detached from device {}", self.name);
        }
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn link_type(&self) -> LinkType {
        match self.mode {
            TapMode::Tap => LinkType::Ethernet,
            TapMode::Tun => LinkType::Raw,
        }
    }

    fn receive(&mut self, timeout: Duration) -> ReceiveStatus {
        let link_type = self.link_type();
        let snapshot_len = self.snapshot_len;
        let Some(file) = self.file.as_mut() else {
            return ReceiveStatus::Error("device is not open".to_string());
        };

        match Self::poll_readable(file, timeout.min(self.read_timeout)) {
            Ok(true) => {}
            Ok(false) => return ReceiveStatus::ReadTimeout,
            Err(status) => return status,
        }

        let mut buf = vec![0u8; MAX_FRAME];
        match file.read(&mut buf) {
            Ok(0) => ReceiveStatus::NoRemainingPackets,
            Ok(n) => {
                buf.truncate(n.min(snapshot_len));
                let timeval = PosixTimeval::now();
                ReceiveStatus::PacketRead(CapturedPacket::new(
                    RawCapture::new(link_type, timeval, buf)
                        .with_timestamp_source(TimestampSource::HostClock),
                    CaptureHeader::Tap(TapHeader { timeval }),
                ))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => ReceiveStatus::ReadTimeout,
            Err(e) => ReceiveStatus::Error(e.to_string()),
        }
    }

    fn send(&mut self, data: &[u8]) -> Result<usize, CaptureError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| CaptureError::not_ready("device is not open"))?;
        file.write(data).map_err(|e| CaptureError::Send(e.to_string()))
    }
}
