use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// No backend handle held
    Closed,
    /// Handle held, no capture loop running
    Opened,
    /// A capture loop owns the receive path
    Capturing,
}

impl DeviceState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => DeviceState::Opened,
            2 => DeviceState::Capturing,
            _ => DeviceState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            DeviceState::Closed => 0,
            DeviceState::Opened => 1,
            DeviceState::Capturing => 2,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Closed => "closed",
            DeviceState::Opened => "opened",
            DeviceState::Capturing => "capturing",
        };
        f.write_str(s)
    }
}

/// Device state readable from any thread without taking a lock.
pub(super) struct StateCell(AtomicU8);

impl StateCell {
    pub(super) fn new(state: DeviceState) -> Self {
        Self(AtomicU8::new(state.as_u8()))
    }

    pub(super) fn get(&self) -> DeviceState {
        DeviceState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub(super) fn set(&self, state: DeviceState) {
        self.0.store(state.as_u8(), Ordering::SeqCst);
    }
}
