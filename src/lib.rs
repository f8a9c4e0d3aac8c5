//! livecap - unified live packet capture.
//!
//! One device abstraction over several native packet-I/O mechanisms:
//! libpcap (live and offline), pnet datalink channels, layer-3 divert
//! channels and Linux TUN/TAP devices.
//!
//! # Architecture
//!
//! - `backend`: the `Backend` trait and one implementation per mechanism
//! - `device`: `CaptureDevice`, the lifecycle state machine over a backend
//! - `capture`: the capture loop, observer dispatch and the swap queue
//! - `device_list`: enumeration and in-place reconciliation of devices
//! - `send_queue`: batched transmission with a byte budget
//! - `arp`: IPv4 to hardware address resolution on a device
//!
//! ```no_run
//! use livecap::{CaptureDevice, DeviceConfig, DeviceList, PcapEnumerator};
//!
//! let list = DeviceList::new(PcapEnumerator);
//! list.refresh()?;
//! let eth0 = list.find("eth0").expect("eth0 present");
//!
//! eth0.open(DeviceConfig::default().with_promiscuous(true))?;
//! eth0.set_filter("udp port 53")?;
//! eth0.on_packet_arrival(|packet| println!("{} bytes", packet.data().len()));
//! eth0.start_capture()?;
//! # Ok::<(), livecap::CaptureError>(())
//! ```

pub mod arp;
pub mod backend;
pub mod capture;
pub mod config;
pub mod device;
pub mod device_list;
pub mod domain;
pub mod error;
pub mod send_queue;

pub use arp::ArpResolver;
pub use backend::{Backend, ReceiveStatus};
pub use capture::{DrainWorker, ObserverId, SwapQueue};
pub use config::DeviceConfig;
pub use device::{CaptureDevice, DeviceState};
pub use device_list::{DeviceEnumerator, DeviceList, PcapEnumerator, PnetEnumerator, PnetKind};
pub use domain::*;
pub use error::{CaptureError, ConfigError};
pub use send_queue::{SendQueue, TransmitMode};
