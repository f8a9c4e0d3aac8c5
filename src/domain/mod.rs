//! Domain models for the capture engine.
//!
//! These types are independent of any particular backend.

mod capture;
mod device;
mod events;
mod header;
mod stats;

pub use capture::{LinkType, PosixTimeval, RawCapture, TimestampSource};
pub use device::{DeviceAddress, DeviceFlags, DeviceIdentity, DeviceInfo};
pub use events::{CaptureStatus, CaptureStopped, CapturedPacket};
pub use header::{
    CaptureHeader, DatalinkHeader, Direction, DivertHeader, PacketSource, PcapHeader, TapHeader,
    Timestamped,
};
pub use stats::CaptureStatistics;
