use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use livecap::{
    ArpResolver, CaptureDevice, CaptureError, CaptureHeader, CapturedPacket, DeviceConfig,
    DeviceEnumerator, DeviceList, PcapEnumerator, PnetEnumerator, PnetKind, ReceiveStatus,
    SendQueue, Timestamped, TransmitMode,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "livecap")]
#[command(about = "Capture, resolve and replay packets on network devices")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendKind {
    /// libpcap
    Pcap,
    /// Layer-2 datalink channel
    Datalink,
    /// Layer-3 IPv4 channel
    Divert,
}

#[derive(Subcommand)]
enum Commands {
    /// List capture devices
    List {
        #[arg(short, long, value_enum, default_value = "pcap")]
        backend: BackendKind,
    },
    /// Capture packets and print a line for each
    Capture {
        /// Network interface to capture on (default: first interface that is up)
        #[arg(short, long)]
        interface: Option<String>,

        #[arg(short, long, value_enum, default_value = "pcap")]
        backend: BackendKind,

        /// Read from a pcap/pcapng file instead of an interface
        #[arg(long, conflicts_with_all = ["interface", "tap"])]
        file: Option<PathBuf>,

        /// Create or attach to a TAP device with this name (Linux only)
        #[arg(long, conflicts_with = "interface")]
        tap: Option<String>,

        /// Use TUN (layer 3) instead of TAP with --tap
        #[arg(long, requires = "tap")]
        tun: bool,

        /// Filter expression, e.g. "udp port 53"
        #[arg(short, long)]
        filter: Option<String>,

        /// Stop after this many packets
        #[arg(short, long)]
        count: Option<u64>,

        #[arg(short, long)]
        promiscuous: bool,
    },
    /// Resolve an IPv4 address to a hardware address with ARP
    Arp {
        /// Network interface to send the request on
        #[arg(short, long)]
        interface: String,

        target: Ipv4Addr,

        #[arg(long, default_value = "1000")]
        timeout_ms: u64,
    },
    /// Retransmit the frames of a capture file on an interface
    Replay {
        file: PathBuf,

        #[arg(short, long)]
        interface: String,

        /// Reproduce the recorded gaps between frames
        #[arg(short, long)]
        synchronized: bool,

        /// Send queue budget in bytes
        #[arg(long, default_value = "16777216")]
        budget: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::List { backend } => list(backend),
        Commands::Capture {
            interface,
            backend,
            file,
            tap,
            tun,
            filter,
            count,
            promiscuous,
        } => {
            let device = match (file, tap) {
                (Some(path), _) => Arc::new(CaptureDevice::from_file(path)),
                (None, Some(name)) => Arc::new(tap_device(&name, tun)?),
                (None, None) => live_device(backend, interface.as_deref())?,
            };
            capture(device, filter.as_deref(), count, promiscuous)
        }
        Commands::Arp {
            interface,
            target,
            timeout_ms,
        } => arp(&interface, target, Duration::from_millis(timeout_ms)),
        Commands::Replay {
            file,
            interface,
            synchronized,
            budget,
        } => replay(file, &interface, synchronized, budget),
    }
}

fn list(backend: BackendKind) -> Result<()> {
    let devices = match backend {
        BackendKind::Pcap => PcapEnumerator.enumerate(),
        BackendKind::Datalink => PnetEnumerator::new(PnetKind::Datalink).enumerate(),
        BackendKind::Divert => PnetEnumerator::new(PnetKind::Divert).enumerate(),
    }
    .context("Failed to enumerate devices")?;

    if devices.is_empty() {
        println!("No capture devices found");
    }
    for info in devices {
        match info.mac_address {
            Some(mac) => println!("{} ({})", info, mac),
            None => println!("{}", info),
        }
    }
    Ok(())
}

fn find_device<E: DeviceEnumerator>(
    enumerator: E,
    name: Option<&str>,
) -> Result<Arc<CaptureDevice>> {
    let list = DeviceList::new(enumerator);
    list.refresh().context("Failed to enumerate devices")?;

    match name {
        Some(name) => list
            .find(name)
            .ok_or_else(|| CaptureError::InterfaceNotFound(name.to_string()).into()),
        None => list
            .devices()
            .into_iter()
            .find(|d| {
                let info = d.info();
                info.is_up() && !info.is_loopback()
            })
            .ok_or_else(|| anyhow!("No suitable network interface found")),
    }
}

fn live_device(backend: BackendKind, name: Option<&str>) -> Result<Arc<CaptureDevice>> {
    match backend {
        BackendKind::Pcap => find_device(PcapEnumerator, name),
        BackendKind::Datalink => find_device(PnetEnumerator::new(PnetKind::Datalink), name),
        BackendKind::Divert => find_device(PnetEnumerator::new(PnetKind::Divert), name),
    }
}

#[cfg(target_os = "linux")]
fn tap_device(name: &str, tun: bool) -> Result<CaptureDevice> {
    use livecap::backend::{TapBackend, TapMode};
    use livecap::DeviceInfo;

    let mode = if tun { TapMode::Tun } else { TapMode::Tap };
    Ok(CaptureDevice::new(
        DeviceInfo::new(name),
        Box::new(TapBackend::new(name, mode)),
    ))
}

#[cfg(not(target_os = "linux"))]
fn tap_device(_name: &str, _tun: bool) -> Result<CaptureDevice> {
    bail!("TUN/TAP capture is only available on Linux")
}

fn describe(packet: &CapturedPacket) -> String {
    let time = packet.timeval().to_datetime().format("%H:%M:%S%.6f");
    let len = packet.raw.len();
    let link = packet.raw.link_type();
    match &packet.header {
        CaptureHeader::Pcap(h) if h.caplen < h.len => {
            format!("{} {} {} bytes (of {})", time, link, len, h.len)
        }
        CaptureHeader::Datalink(h) => match h.vlan {
            Some(vlan) => format!(
                "{} {} {} bytes {:?} vlan {}",
                time, link, len, h.source, vlan
            ),
            None => format!("{} {} {} bytes {:?}", time, link, len, h.source),
        },
        CaptureHeader::Divert(h) => format!("{} {} {} bytes {:?}", time, link, len, h.direction),
        _ => format!("{} {} {} bytes", time, link, len),
    }
}

fn capture(
    device: Arc<CaptureDevice>,
    filter: Option<&str>,
    count: Option<u64>,
    promiscuous: bool,
) -> Result<()> {
    let config = DeviceConfig::load()
        .context("Failed to load configuration")?
        .with_promiscuous(promiscuous);

    device
        .open(config)
        .with_context(|| format!("Failed to open {}", device.name()))?;
    if let Some(expression) = filter {
        device.set_filter(expression)?;
    }
    info!("Capturing on {} ({})", device.name(), device.link_type());

    device.on_packet_arrival(|packet| println!("{}", describe(packet)));

    let stopper = device.clone();
    ctrlc::set_handler(move || {
        if let Err(e) = stopper.stop_capture() {
            warn!("{}", e);
        }
    })
    .context("Failed to set Ctrl+C handler")?;

    let stopped = match count {
        Some(n) => device.capture_count(n)?,
        None => device.capture()?,
    };

    match device.statistics() {
        Ok(stats) => println!("{}", stats),
        Err(CaptureError::Unsupported { .. }) => {}
        Err(e) => warn!("Could not read statistics: {}", e),
    }
    device.close();

    if stopped.is_error() {
        bail!("{}", stopped);
    }
    println!("{}", stopped);
    Ok(())
}

fn arp(interface: &str, target: Ipv4Addr, timeout: Duration) -> Result<()> {
    let device = find_device(PcapEnumerator, Some(interface))?;
    let resolver = ArpResolver::new(&device).with_timeout(timeout);

    match resolver.resolve(target)? {
        Some(mac) => println!("{} is at {}", target, mac),
        None => println!("No reply from {} within {:?}", target, timeout),
    }
    Ok(())
}

fn replay(file: PathBuf, interface: &str, synchronized: bool, budget: usize) -> Result<()> {
    let source = CaptureDevice::from_file(&file);
    source
        .open(DeviceConfig::default())
        .with_context(|| format!("Failed to open {}", file.display()))?;

    let mut queue = SendQueue::new(budget);
    loop {
        match source.get_next_packet()? {
            ReceiveStatus::PacketRead(packet) => {
                if !queue.add_with_time(packet.data(), packet.timeval())? {
                    warn!("Send queue full after {} frames; replaying those", queue.len());
                    break;
                }
            }
            ReceiveStatus::ReadTimeout => continue,
            ReceiveStatus::NoRemainingPackets => break,
            ReceiveStatus::Error(reason) => bail!("Failed to read {}: {}", file.display(), reason),
        }
    }
    source.close();

    let device = find_device(PcapEnumerator, Some(interface))?;
    device
        .open(DeviceConfig::load().context("Failed to load configuration")?)
        .with_context(|| format!("Failed to open {}", interface))?;

    let mode = if synchronized {
        TransmitMode::Synchronized
    } else {
        TransmitMode::AsFastAsPossible
    };
    let total = queue.current_length();
    let frames = queue.len();
    let sent = queue.transmit(&device, mode)?;
    queue.dispose();
    device.close();

    println!("Sent {} of {} bytes ({} frames queued)", sent, total, frames);
    if sent < total {
        bail!("Transmission stopped early");
    }
    Ok(())
}
