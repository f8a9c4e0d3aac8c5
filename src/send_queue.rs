//! Batched packet transmission.
//!
//! A `SendQueue` collects many outbound frames with their timestamps and
//! hands them to a device in one call, so the per-call cost of a send is
//! paid once per batch rather than once per frame.

use tracing::debug;

use crate::device::CaptureDevice;
use crate::domain::PosixTimeval;
use crate::error::CaptureError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitMode {
    /// Send back to back, ignoring timestamps
    AsFastAsPossible,
    /// Reproduce the gaps between recorded timestamps
    Synchronized,
}

/// One frame waiting in a send queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedPacket {
    pub data: Vec<u8>,
    pub timeval: PosixTimeval,
}

/// Append-only buffer of frames bounded by a byte budget.
#[derive(Debug)]
pub struct SendQueue {
    budget: usize,
    used: usize,
    packets: Vec<QueuedPacket>,
    disposed: bool,
}

impl SendQueue {
    /// Create a queue holding at most `budget` bytes of frame data.
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            used: 0,
            packets: Vec::new(),
            disposed: false,
        }
    }

    /// Append a frame stamped with the current time.
    pub fn add(&mut self, data: &[u8]) -> Result<bool, CaptureError> {
        self.add_with_time(data, PosixTimeval::now())
    }

    /// Append a frame with an explicit timestamp.
    ///
    /// Returns `Ok(false)`, leaving the queue untouched, when the frame
    /// would push the queue past its budget.
    pub fn add_with_time(
        &mut self,
        data: &[u8],
        timeval: PosixTimeval,
    ) -> Result<bool, CaptureError> {
        self.ensure_live()?;
        if self.used + data.len() > self.budget {
            return Ok(false);
        }
        self.used += data.len();
        self.packets.push(QueuedPacket {
            data: data.to_vec(),
            timeval,
        });
        Ok(true)
    }

    /// Hand every queued frame to `device` in one batch.
    ///
    /// Returns the bytes actually sent. A count below
    /// [`current_length`](Self::current_length) means only part of the
    /// batch went out.
    pub fn transmit(
        &self,
        device: &CaptureDevice,
        mode: TransmitMode,
    ) -> Result<usize, CaptureError> {
        self.ensure_live()?;
        let sent = device.send_batch(&self.packets, mode)?;
        if sent < self.used {
            debug!(
                "Partial transmit on {}: {} of {} bytes",
                device.name(),
                sent,
                self.used
            );
        }
        Ok(sent)
    }

    /// Release the buffer. Any later use fails with `QueueDisposed`.
    pub fn dispose(&mut self) {
        self.packets = Vec::new();
        self.used = 0;
        self.disposed = true;
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Bytes of frame data currently queued.
    pub fn current_length(&self) -> usize {
        self.used
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    fn ensure_live(&self) -> Result<(), CaptureError> {
        if self.disposed {
            return Err(CaptureError::QueueDisposed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, WhenExhausted};
    use crate::config::DeviceConfig;
    use crate::domain::DeviceInfo;

    #[test]
    fn test_add_respects_budget() {
        let mut queue = SendQueue::new(100);

        assert!(queue.add(&[0u8; 60]).unwrap());
        assert!(queue.add(&[0u8; 40]).unwrap());
        assert_eq!(queue.current_length(), 100);

        // One more byte would exceed the budget
        assert!(!queue.add(&[0u8; 1]).unwrap());
        assert_eq!(queue.current_length(), 100);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_rejected_add_does_not_mutate() {
        let mut queue = SendQueue::new(50);
        assert!(queue.add(&[1u8; 30]).unwrap());
        assert!(!queue.add(&[2u8; 21]).unwrap());
        assert!(queue.add(&[3u8; 20]).unwrap());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.current_length(), 50);
    }

    #[test]
    fn test_oversized_frame_rejected_on_empty_queue() {
        let mut queue = SendQueue::new(10);
        assert!(!queue.add(&[0u8; 11]).unwrap());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_disposed_queue_fails() {
        let mut queue = SendQueue::new(100);
        queue.add(&[0u8; 10]).unwrap();
        queue.dispose();

        assert!(queue.is_disposed());
        assert_eq!(queue.current_length(), 0);
        assert!(matches!(queue.add(&[0u8; 1]), Err(CaptureError::QueueDisposed)));

        let (backend, _handle) = MockBackend::new(vec![], WhenExhausted::Timeout);
        let device = CaptureDevice::new(DeviceInfo::new("mock0"), Box::new(backend));
        assert!(matches!(
            queue.transmit(&device, TransmitMode::AsFastAsPossible),
            Err(CaptureError::QueueDisposed)
        ));
    }

    #[test]
    fn test_transmit_sends_all_frames_in_order() {
        let (backend, handle) = MockBackend::new(vec![], WhenExhausted::Timeout);
        let device = CaptureDevice::new(DeviceInfo::new("mock0"), Box::new(backend));
        device.open(DeviceConfig::default()).unwrap();

        let mut queue = SendQueue::new(1000);
        queue.add(&[1u8; 10]).unwrap();
        queue.add(&[2u8; 20]).unwrap();
        queue.add(&[3u8; 30]).unwrap();

        let sent = queue.transmit(&device, TransmitMode::AsFastAsPossible).unwrap();
        assert_eq!(sent, 60);

        let state = handle.state();
        assert_eq!(state.sent.len(), 3);
        assert_eq!(state.sent[0], vec![1u8; 10]);
        assert_eq!(state.sent[2], vec![3u8; 30]);
    }

    #[test]
    fn test_short_transmit_reported_as_count() {
        let (backend, handle) = MockBackend::new(vec![], WhenExhausted::Timeout);
        handle.state().send_limit = Some(15);
        let device = CaptureDevice::new(DeviceInfo::new("mock0"), Box::new(backend));
        device.open(DeviceConfig::default()).unwrap();

        let mut queue = SendQueue::new(1000);
        queue.add(&[1u8; 10]).unwrap();
        queue.add(&[2u8; 20]).unwrap();
        queue.add(&[3u8; 30]).unwrap();

        let sent = queue.transmit(&device, TransmitMode::AsFastAsPossible).unwrap();
        assert_eq!(sent, 25);
        assert!(sent < queue.current_length());
        assert_eq!(handle.state().sent.len(), 2);
    }

    #[test]
    fn test_transmit_requires_open_device() {
        let (backend, _handle) = MockBackend::new(vec![], WhenExhausted::Timeout);
        let device = CaptureDevice::new(DeviceInfo::new("mock0"), Box::new(backend));

        let mut queue = SendQueue::new(100);
        queue.add(&[0u8; 10]).unwrap();
        assert!(matches!(
            queue.transmit(&device, TransmitMode::AsFastAsPossible),
            Err(CaptureError::DeviceNotReady(_))
        ));
    }
}
