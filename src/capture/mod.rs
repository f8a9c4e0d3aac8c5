//! Capture loop, packet dispatch and the producer/consumer hand-off.

mod dispatcher;
pub(crate) mod driver;
mod queue;

pub use dispatcher::{Dispatcher, ObserverId, PacketCallback, StoppedCallback};
pub use queue::{DrainWorker, SwapQueue};
