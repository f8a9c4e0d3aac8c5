//! Packet arrival dispatch.

use tracing::trace;

use crate::domain::{CaptureStopped, CapturedPacket};

pub type PacketCallback = Box<dyn FnMut(&CapturedPacket) + Send>;
pub type StoppedCallback = Box<dyn FnMut(&CaptureStopped) + Send>;

/// Handle returned by observer registration, used to remove the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Delivers packets to registered observers.
///
/// Delivery is synchronous and in registration order: every observer sees
/// a packet before the capture loop asks the backend for the next one.
/// There is no internal buffering, so a slow observer slows the capture
/// loop down. Consumers that need to decouple the two can push into a
/// [`SwapQueue`](super::SwapQueue) from their callback.
#[derive(Default)]
pub struct Dispatcher {
    next_id: u64,
    packet_observers: Vec<(ObserverId, PacketCallback)>,
    stopped_observers: Vec<(ObserverId, StoppedCallback)>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_packet(&mut self, callback: PacketCallback) -> ObserverId {
        let id = self.allocate_id();
        self.packet_observers.push((id, callback));
        id
    }

    pub fn on_stopped(&mut self, callback: StoppedCallback) -> ObserverId {
        let id = self.allocate_id();
        self.stopped_observers.push((id, callback));
        id
    }

    /// Remove an observer of either kind. Returns false if it was not registered.
    pub fn remove(&mut self, id: ObserverId) -> bool {
        let before = self.packet_observers.len() + self.stopped_observers.len();
        self.packet_observers.retain(|(oid, _)| *oid != id);
        self.stopped_observers.retain(|(oid, _)| *oid != id);
        before != self.packet_observers.len() + self.stopped_observers.len()
    }

    pub fn has_packet_observers(&self) -> bool {
        !self.packet_observers.is_empty()
    }

    pub fn dispatch(&mut self, packet: &CapturedPacket) {
        trace!(
            "Dispatching {} byte packet to {} observers",
            packet.raw.len(),
            self.packet_observers.len()
        );
        for (_, observer) in self.packet_observers.iter_mut() {
            observer(packet);
        }
    }

    pub fn notify_stopped(&mut self, event: &CaptureStopped) {
        for (_, observer) in self.stopped_observers.iter_mut() {
            observer(event);
        }
    }

    /// Detach every observer.
    pub fn clear(&mut self) {
        self.packet_observers.clear();
        self.stopped_observers.clear();
    }

    fn allocate_id(&mut self) -> ObserverId {
        self.next_id += 1;
        ObserverId(self.next_id)
    }
}
