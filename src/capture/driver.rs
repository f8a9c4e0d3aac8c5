//! The acquire-and-dispatch loop shared by synchronous and background capture.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use crate::backend::ReceiveStatus;
use crate::domain::{CaptureStopped, CapturedPacket};

/// Run the capture loop until cancelled, `limit` packets have been
/// delivered, the stream ends, or the backend faults.
///
/// `receive` must return within a bounded time (the read timeout); the
/// cancel flag is checked once per call, which is what bounds how long a
/// stop request can take.
pub fn run<R, D>(
    mut receive: R,
    mut dispatch: D,
    cancel: &AtomicBool,
    limit: Option<u64>,
) -> CaptureStopped
where
    R: FnMut() -> ReceiveStatus,
    D: FnMut(&CapturedPacket),
{
    let mut delivered = 0u64;

    while !cancel.load(Ordering::SeqCst) {
        if limit.is_some_and(|max| delivered >= max) {
            debug!("Packet limit of {} reached", delivered);
            return CaptureStopped::clean("packet limit reached", delivered);
        }

        match receive() {
            ReceiveStatus::PacketRead(packet) => {
                dispatch(&packet);
                delivered += 1;
            }
            ReceiveStatus::ReadTimeout => continue,
            ReceiveStatus::NoRemainingPackets => {
                debug!("No remaining packets after {}", delivered);
                return CaptureStopped::clean("no remaining packets", delivered);
            }
            ReceiveStatus::Error(reason) => {
                warn!("Capture error after {} packets: {}", delivered, reason);
                return CaptureStopped::error(reason, delivered);
            }
        }
    }

    CaptureStopped::clean("capture cancelled", delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{packet, sequence_of};
    use crate::domain::CaptureStatus;
    use std::collections::VecDeque;

    fn scripted(statuses: Vec<ReceiveStatus>) -> impl FnMut() -> ReceiveStatus {
        let mut script: VecDeque<_> = statuses.into();
        move || script.pop_front().unwrap_or(ReceiveStatus::NoRemainingPackets)
    }

    #[test]
    fn test_end_of_stream_is_clean() {
        let mut seen = Vec::new();
        let cancel = AtomicBool::new(false);
        let stopped = run(
            scripted(vec![packet(0), ReceiveStatus::ReadTimeout, packet(1), packet(2)]),
            |p| seen.push(sequence_of(p)),
            &cancel,
            None,
        );

        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(stopped.status, CaptureStatus::Clean);
        assert_eq!(stopped.packets, 3);
    }

    #[test]
    fn test_backend_error_stops_with_error() {
        let mut seen = 0;
        let cancel = AtomicBool::new(false);
        let stopped = run(
            scripted(vec![
                packet(0),
                ReceiveStatus::Error("interface went down".to_string()),
                packet(1),
            ]),
            |_| seen += 1,
            &cancel,
            None,
        );

        assert_eq!(seen, 1);
        assert!(stopped.is_error());
        assert_eq!(stopped.diagnostic, "interface went down");
    }

    #[test]
    fn test_limit_stops_after_count() {
        let mut seen = 0;
        let cancel = AtomicBool::new(false);
        let stopped = run(
            scripted((0..10).map(packet).collect()),
            |_| seen += 1,
            &cancel,
            Some(4),
        );

        assert_eq!(seen, 4);
        assert_eq!(stopped.packets, 4);
        assert_eq!(stopped.status, CaptureStatus::Clean);
    }

    #[test]
    fn test_cancel_checked_every_iteration() {
        let cancel = AtomicBool::new(false);
        let mut calls = 0;
        let stopped = run(
            || {
                calls += 1;
                if calls == 3 {
                    cancel.store(true, Ordering::SeqCst);
                }
                ReceiveStatus::ReadTimeout
            },
            |_| {},
            &cancel,
            None,
        );

        assert_eq!(calls, 3);
        assert_eq!(stopped.diagnostic, "capture cancelled");
    }

    #[test]
    fn test_ten_thousand_packets_delivered_in_order() {
        let mut next = 0u32;
        let cancel = AtomicBool::new(false);
        let stopped = run(
            scripted((0..10_000).map(packet).collect()),
            |p| {
                assert_eq!(sequence_of(p), next);
                next += 1;
            },
            &cancel,
            None,
        );

        assert_eq!(next, 10_000);
        assert_eq!(stopped.packets, 10_000);
        assert!(!stopped.is_error());
    }
}
