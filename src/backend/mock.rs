//! Scripted backend for exercising the engine without a network.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Backend, ReceiveStatus};
use crate::config::DeviceConfig;
use crate::domain::{
    CaptureHeader, CaptureStatistics, CapturedPacket, LinkType, PcapHeader, PosixTimeval,
    RawCapture,
};
use crate::error::CaptureError;

type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

/// What `receive` does once the script has run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhenExhausted {
    Timeout,
    EndOfStream,
}

pub struct MockState {
    pub script: VecDeque<ReceiveStatus>,
    pub when_exhausted: WhenExhausted,
    /// Extra time every receive blocks for, ignoring its timeout
    pub stall: Duration,
    pub sent: Vec<Vec<u8>>,
    pub open: bool,
    pub open_calls: usize,
    pub close_calls: usize,
    pub fail_open: Option<String>,
    pub filter: Option<String>,
    pub statistics: Option<CaptureStatistics>,
    /// Produces a frame to receive in answer to each sent frame
    pub responder: Option<Responder>,
    /// Frames longer than this are truncated on send
    pub send_limit: Option<usize>,
}

#[derive(Clone)]
pub struct MockHandle(Arc<Mutex<MockState>>);

impl MockHandle {
    pub fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.0.lock().unwrap()
    }
}

pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new(script: Vec<ReceiveStatus>, when_exhausted: WhenExhausted) -> (Self, MockHandle) {
        let state = Arc::new(Mutex::new(MockState {
            script: script.into(),
            when_exhausted,
            stall: Duration::ZERO,
            sent: Vec::new(),
            open: false,
            open_calls: 0,
            close_calls: 0,
            fail_open: None,
            filter: None,
            statistics: None,
            responder: None,
            send_limit: None,
        }));
        (
            Self {
                state: state.clone(),
            },
            MockHandle(state),
        )
    }

    /// Backend that yields `count` numbered packets and then ends.
    pub fn with_packets(count: u32) -> (Self, MockHandle) {
        Self::new((0..count).map(packet).collect(), WhenExhausted::EndOfStream)
    }
}

/// A packet whose payload is its sequence number.
pub fn packet(seq: u32) -> ReceiveStatus {
    ReceiveStatus::PacketRead(frame(seq.to_be_bytes().to_vec()))
}

pub fn frame(data: Vec<u8>) -> CapturedPacket {
    let timeval = PosixTimeval::new(1_700_000_000, 0);
    let len = data.len() as u32;
    CapturedPacket::new(
        RawCapture::new(LinkType::Ethernet, timeval, data),
        CaptureHeader::Pcap(PcapHeader {
            timeval,
            caplen: len,
            len,
        }),
    )
}

pub fn sequence_of(packet: &CapturedPacket) -> u32 {
    let d = packet.data();
    u32::from_be_bytes([d[0], d[1], d[2], d[3]])
}

impl Backend for MockBackend {
    fn kind(&self) -> &'static str {
        "mock"
    }

    fn open(&mut self, _config: &DeviceConfig) -> Result<(), CaptureError> {
        let mut state = self.state.lock().unwrap();
        state.open_calls += 1;
        if let Some(reason) = state.fail_open.clone() {
            return Err(CaptureError::DeviceOpen {
                device: "mock0".to_string(),
                reason,
            });
        }
        state.open = true;
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.close_calls += 1;
        state.open = false;
    }

    fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    fn link_type(&self) -> LinkType {
        LinkType::Ethernet
    }

    fn receive(&mut self, timeout: Duration) -> ReceiveStatus {
        let (next, stall, when_exhausted) = {
            let mut state = self.state.lock().unwrap();
            (state.script.pop_front(), state.stall, state.when_exhausted)
        };
        if !stall.is_zero() {
            std::thread::sleep(stall);
        }
        match next {
            Some(status) => status,
            None => match when_exhausted {
                WhenExhausted::EndOfStream => ReceiveStatus::NoRemainingPackets,
                WhenExhausted::Timeout => {
                    std::thread::sleep(timeout);
                    ReceiveStatus::ReadTimeout
                }
            },
        }
    }

    fn send(&mut self, data: &[u8]) -> Result<usize, CaptureError> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(CaptureError::not_ready("mock is not open"));
        }
        let n = state.send_limit.map_or(data.len(), |limit| data.len().min(limit));
        state.sent.push(data[..n].to_vec());
        if let Some(responder) = state.responder.as_mut() {
            if let Some(reply) = responder(data) {
                state.script.push_back(ReceiveStatus::PacketRead(frame(reply)));
            }
        }
        Ok(n)
    }

    fn set_filter(&mut self, expression: &str) -> Result<(), CaptureError> {
        if expression.contains("$$") {
            return Err(super::filter_syntax_error(expression, "illegal token: $$"));
        }
        self.state.lock().unwrap().filter = Some(expression.to_string());
        Ok(())
    }

    fn clear_filter(&mut self) -> Result<(), CaptureError> {
        self.state.lock().unwrap().filter = None;
        Ok(())
    }

    fn statistics(&mut self) -> Result<CaptureStatistics, CaptureError> {
        self.state
            .lock()
            .unwrap()
            .statistics
            .ok_or_else(|| CaptureError::unsupported("mock", "statistics"))
    }
}
