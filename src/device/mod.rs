//! The capture device: one backend behind a uniform lifecycle.
//!
//! A `CaptureDevice` owns exactly one [`Backend`] and moves through
//! `Closed → Opened → Capturing → Opened → Closed`. Every operation takes
//! `&self` and control operations are serialized internally, so a device
//! can be shared through an `Arc` (as the device list does) and stopped
//! from a thread other than the one that started it.

mod state;

pub use state::DeviceState;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use macaddr::MacAddr6;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, OfflineBackend, ReceiveStatus};
use crate::capture::{driver, Dispatcher, ObserverId};
use crate::config::DeviceConfig;
use crate::domain::{
    CaptureStatistics, CaptureStopped, CapturedPacket, DeviceIdentity, DeviceInfo, LinkType,
};
use crate::error::CaptureError;
use crate::send_queue::{QueuedPacket, TransmitMode};
use state::StateCell;

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the backend; closes it if the last reference goes away while open.
struct HandleSlot {
    backend: Box<dyn Backend>,
}

impl Drop for HandleSlot {
    fn drop(&mut self) {
        if self.backend.is_open() {
            self.backend.close();
        }
    }
}

/// State shared between the device and its capture thread.
struct Shared {
    name: String,
    handle: Mutex<HandleSlot>,
    dispatcher: Mutex<Dispatcher>,
    state: StateCell,
    cancel: AtomicBool,
    /// Set when the device was closed while a capture thread could not be
    /// stopped; that thread releases the handle when it finally exits.
    close_on_exit: AtomicBool,
    /// Set when an observer closed the device; observers are detached once
    /// the loop has exited.
    detach_on_exit: AtomicBool,
    capture_thread: Mutex<Option<ThreadId>>,
}

/// Forgets the capture thread however the loop ends.
struct CaptureThreadGuard<'a>(&'a Mutex<Option<ThreadId>>);

impl Drop for CaptureThreadGuard<'_> {
    fn drop(&mut self) {
        *lock(self.0) = None;
    }
}

impl Shared {
    /// Run the loop on the current thread, settle the device state and
    /// notify stopped observers.
    ///
    /// A panicking observer ends the capture with an error status and
    /// leaves the handle open.
    fn run_capture(&self, read_timeout: Duration, limit: Option<u64>) -> CaptureStopped {
        *lock(&self.capture_thread) = Some(std::thread::current().id());
        let _guard = CaptureThreadGuard(&self.capture_thread);

        let mut delivered = 0u64;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            driver::run(
                || lock(&self.handle).backend.receive(read_timeout),
                |packet| {
                    lock(&self.dispatcher).dispatch(packet);
                    delivered += 1;
                },
                &self.cancel,
                limit,
            )
        }));

        let (stopped, backend_failed) = match outcome {
            Ok(stopped) => {
                let failed = stopped.is_error();
                (stopped, failed)
            }
            Err(payload) => {
                let reason = format!("capture loop panicked: {}", panic_message(&*payload));
                (CaptureStopped::error(reason, delivered), false)
            }
        };
        self.finish(&stopped, backend_failed);
        stopped
    }

    fn finish(&self, stopped: &CaptureStopped, backend_failed: bool) {
        if stopped.is_error() {
            error!("Capture on {} failed: {}", self.name, stopped.diagnostic);
        }
        if backend_failed || self.close_on_exit.swap(false, Ordering::SeqCst) {
            self.release();
        } else {
            self.state.set(DeviceState::Opened);
        }
        info!("{} {}", self.name, stopped);

        lock(&self.dispatcher).notify_stopped(stopped);

        // A stopped observer may have closed the device too
        if self.close_on_exit.swap(false, Ordering::SeqCst) {
            self.release();
        }
        if self.detach_on_exit.swap(false, Ordering::SeqCst) {
            lock(&self.dispatcher).clear();
        }
    }

    fn release(&self) {
        lock(&self.handle).backend.close();
        self.state.set(DeviceState::Closed);
    }

    fn on_capture_thread(&self) -> bool {
        *lock(&self.capture_thread) == Some(std::thread::current().id())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause")
}

/// A running or finished capture loop.
struct Worker {
    /// None when the loop runs on a caller's thread
    thread: Option<JoinHandle<()>>,
    done: Receiver<()>,
}

impl Worker {
    /// Wait for the loop to signal completion. True if it has finished.
    fn wait(&self, timeout: Duration) -> bool {
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }

    fn join(self) {
        if let Some(thread) = self.thread {
            if thread.join().is_err() {
                warn!("Capture thread panicked");
            }
        }
    }
}

struct Control {
    config: DeviceConfig,
    filter: Option<String>,
    worker: Option<Worker>,
}

pub struct CaptureDevice {
    identity: DeviceIdentity,
    info: RwLock<DeviceInfo>,
    shared: Arc<Shared>,
    control: Mutex<Control>,
}

impl CaptureDevice {
    /// Wrap a backend. The device starts `Closed`.
    pub fn new(info: DeviceInfo, backend: Box<dyn Backend>) -> Self {
        let shared = Shared {
            name: info.name().to_string(),
            handle: Mutex::new(HandleSlot { backend }),
            dispatcher: Mutex::new(Dispatcher::new()),
            state: StateCell::new(DeviceState::Closed),
            cancel: AtomicBool::new(false),
            close_on_exit: AtomicBool::new(false),
            detach_on_exit: AtomicBool::new(false),
            capture_thread: Mutex::new(None),
        };
        Self {
            identity: info.identity.clone(),
            info: RwLock::new(info),
            shared: Arc::new(shared),
            control: Mutex::new(Control {
                config: DeviceConfig::default(),
                filter: None,
                worker: None,
            }),
        }
    }

    /// A device replaying a pcap/pcapng capture file.
    pub fn from_file(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let info = DeviceInfo::new(path.display().to_string()).with_description("capture file");
        Self::new(info, Box::new(OfflineBackend::new(path)))
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        self.identity.as_str()
    }

    /// Snapshot of the backend-reported attributes.
    pub fn info(&self) -> DeviceInfo {
        self.info
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn description(&self) -> Option<String> {
        self.info().description
    }

    pub fn mac_address(&self) -> Option<MacAddr6> {
        self.info().mac_address
    }

    pub(crate) fn update_info(&self, fresh: &DeviceInfo) {
        self.info
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .update_from(fresh);
    }

    pub fn state(&self) -> DeviceState {
        self.shared.state.get()
    }

    pub fn is_open(&self) -> bool {
        self.state() != DeviceState::Closed
    }

    /// Configuration the device was last opened with.
    pub fn config(&self) -> DeviceConfig {
        lock(&self.control).config.clone()
    }

    /// The installed filter expression, if any.
    pub fn filter(&self) -> Option<String> {
        let control = lock(&self.control);
        match self.state() {
            DeviceState::Closed => None,
            _ => control.filter.clone(),
        }
    }

    pub fn link_type(&self) -> LinkType {
        lock(&self.shared.handle).backend.link_type()
    }

    /// Acquire the backend handle. Opening an open device does nothing.
    pub fn open(&self, config: DeviceConfig) -> Result<(), CaptureError> {
        let mut control = lock(&self.control);
        if self.state() != DeviceState::Closed {
            debug!("{} is already open", self.name());
            return Ok(());
        }
        self.reap(&mut control)?;

        lock(&self.shared.handle).backend.open(&config)?;

        self.shared.close_on_exit.store(false, Ordering::SeqCst);
        self.shared.state.set(DeviceState::Opened);
        info!(
            "Opened {} (promiscuous: {}, read timeout: {:?})",
            self.name(),
            config.promiscuous,
            config.read_timeout
        );
        control.config = config;
        control.filter = None;
        Ok(())
    }

    /// Compile and install a filter expression.
    ///
    /// While a capture is running the filter is installed as soon as the
    /// in-flight receive returns, and applies to every later packet.
    pub fn set_filter(&self, expression: &str) -> Result<(), CaptureError> {
        let mut control = lock(&self.control);
        if self.state() == DeviceState::Closed {
            return Err(CaptureError::not_ready(format!(
                "{} must be opened before setting a filter",
                self.name()
            )));
        }

        lock(&self.shared.handle).backend.set_filter(expression)?;
        debug!("Installed filter on {}: {}", self.name(), expression);
        control.filter = Some(expression.to_string());
        Ok(())
    }

    /// Remove the installed filter so every packet is delivered again.
    pub fn clear_filter(&self) -> Result<(), CaptureError> {
        let mut control = lock(&self.control);
        if self.state() == DeviceState::Closed {
            return Err(CaptureError::not_ready(format!(
                "{} must be opened before clearing a filter",
                self.name()
            )));
        }

        lock(&self.shared.handle).backend.clear_filter()?;
        debug!("Cleared filter on {}", self.name());
        control.filter = None;
        Ok(())
    }

    /// Try once to read a packet, waiting at most the configured read timeout.
    pub fn get_next_packet(&self) -> Result<ReceiveStatus, CaptureError> {
        let timeout = lock(&self.control).config.read_timeout;
        self.get_next_packet_timeout(timeout)
    }

    /// Try once to read a packet, waiting at most `timeout`.
    ///
    /// Backend faults come back as `Ok(ReceiveStatus::Error(_))`; `Err` is
    /// reserved for calling this on a device that is closed or capturing.
    pub fn get_next_packet_timeout(
        &self,
        timeout: Duration,
    ) -> Result<ReceiveStatus, CaptureError> {
        let _control = lock(&self.control);
        match self.state() {
            DeviceState::Opened => Ok(lock(&self.shared.handle).backend.receive(timeout)),
            DeviceState::Closed => Err(CaptureError::not_ready(format!(
                "{} is not open",
                self.name()
            ))),
            DeviceState::Capturing => Err(CaptureError::not_ready(format!(
                "{} is capturing; packets go to observers",
                self.name()
            ))),
        }
    }

    /// Register a packet arrival observer.
    ///
    /// Observers run on the capture thread, one packet at a time, in
    /// capture order. They must not register or remove observers on the
    /// same device from inside the callback. Calling `stop_capture` or
    /// `close` from inside one is allowed: the loop exits once the
    /// callback returns.
    pub fn on_packet_arrival<F>(&self, observer: F) -> ObserverId
    where
        F: FnMut(&CapturedPacket) + Send + 'static,
    {
        lock(&self.shared.dispatcher).on_packet(Box::new(observer))
    }

    /// Register an observer for the end of each capture.
    pub fn on_capture_stopped<F>(&self, observer: F) -> ObserverId
    where
        F: FnMut(&CaptureStopped) + Send + 'static,
    {
        lock(&self.shared.dispatcher).on_stopped(Box::new(observer))
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        lock(&self.shared.dispatcher).remove(id)
    }

    /// Start capturing on a background thread and return immediately.
    pub fn start_capture(&self) -> Result<(), CaptureError> {
        let mut control = lock(&self.control);
        self.check_can_capture()?;
        self.reap(&mut control)?;

        self.shared.cancel.store(false, Ordering::SeqCst);
        self.shared.state.set(DeviceState::Capturing);

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let shared = self.shared.clone();
        let read_timeout = control.config.read_timeout;

        let spawned = std::thread::Builder::new()
            .name(format!("livecap-{}", self.name()))
            .spawn(move || {
                shared.run_capture(read_timeout, None);
                let _ = done_tx.send(());
            });

        match spawned {
            Ok(thread) => {
                control.worker = Some(Worker {
                    thread: Some(thread),
                    done: done_rx,
                });
                info!("Started capture on {}", self.name());
                Ok(())
            }
            Err(e) => {
                self.shared.state.set(DeviceState::Opened);
                Err(CaptureError::Io(e))
            }
        }
    }

    /// Capture on the calling thread until stopped or the stream ends.
    pub fn capture(&self) -> Result<CaptureStopped, CaptureError> {
        self.capture_inline(None)
    }

    /// Capture on the calling thread until `count` packets have been
    /// delivered, the capture is stopped, or the stream ends.
    pub fn capture_count(&self, count: u64) -> Result<CaptureStopped, CaptureError> {
        self.capture_inline(Some(count))
    }

    fn capture_inline(&self, limit: Option<u64>) -> Result<CaptureStopped, CaptureError> {
        let (done_tx, read_timeout) = {
            let mut control = lock(&self.control);
            self.check_can_capture()?;
            self.reap(&mut control)?;

            self.shared.cancel.store(false, Ordering::SeqCst);
            self.shared.state.set(DeviceState::Capturing);

            let (done_tx, done_rx) = crossbeam_channel::bounded(1);
            control.worker = Some(Worker {
                thread: None,
                done: done_rx,
            });
            (done_tx, control.config.read_timeout)
        };

        let stopped = self.shared.run_capture(read_timeout, limit);
        let _ = done_tx.send(());
        Ok(stopped)
    }

    /// Ask a running capture to stop and wait for it.
    ///
    /// Cancellation is cooperative: the loop notices the request after its
    /// current receive returns, so this normally takes up to one read
    /// timeout. If the loop has not exited within the stop timeout (a
    /// backend stuck in a native call), the thread is left to finish on its
    /// own, `StopTimeout` is returned, and the device becomes `Opened` when
    /// the thread eventually exits. Does nothing if no capture is running.
    ///
    /// Called from an observer, this only requests the stop.
    pub fn stop_capture(&self) -> Result<(), CaptureError> {
        if self.shared.on_capture_thread() {
            self.shared.cancel.store(true, Ordering::SeqCst);
            return Ok(());
        }
        let mut control = lock(&self.control);
        if self.state() != DeviceState::Capturing {
            return Ok(());
        }

        self.shared.cancel.store(true, Ordering::SeqCst);
        let timeout = control.config.stop_timeout;

        let Some(worker) = control.worker.take() else {
            return Ok(());
        };
        if worker.wait(timeout) {
            worker.join();
            info!("Stopped capture on {}", self.name());
            Ok(())
        } else {
            warn!(
                "Capture on {} did not stop within {:?}; leaving it to exit on its own",
                self.name(),
                timeout
            );
            control.worker = Some(worker);
            Err(CaptureError::StopTimeout(timeout))
        }
    }

    /// Latest counters from the backend.
    pub fn statistics(&self) -> Result<CaptureStatistics, CaptureError> {
        self.ensure_open()?;
        lock(&self.shared.handle).backend.statistics()
    }

    /// Transmit one frame, returning the bytes sent.
    pub fn send(&self, data: &[u8]) -> Result<usize, CaptureError> {
        self.ensure_open()?;
        lock(&self.shared.handle).backend.send(data)
    }

    pub(crate) fn send_batch(
        &self,
        packets: &[QueuedPacket],
        mode: TransmitMode,
    ) -> Result<usize, CaptureError> {
        self.ensure_open()?;
        Ok(lock(&self.shared.handle).backend.send_batch(packets, mode))
    }

    /// Release the backend handle and detach every observer.
    ///
    /// Stops a running capture first. Closing a closed device does nothing.
    /// Called from an observer, the handle is released and the observers
    /// detached once the loop exits.
    pub fn close(&self) {
        if self.shared.on_capture_thread() {
            debug!("{} closed from its capture thread", self.name());
            self.shared.cancel.store(true, Ordering::SeqCst);
            self.shared.close_on_exit.store(true, Ordering::SeqCst);
            self.shared.detach_on_exit.store(true, Ordering::SeqCst);
            self.shared.state.set(DeviceState::Closed);
            return;
        }
        let mut control = lock(&self.control);

        if self.state() == DeviceState::Capturing {
            self.shared.cancel.store(true, Ordering::SeqCst);
        }
        if let Some(worker) = control.worker.take() {
            if worker.wait(control.config.stop_timeout) {
                worker.join();
            } else {
                warn!(
                    "Capture on {} is still running; its handle will be released when it exits",
                    self.name()
                );
                self.shared.close_on_exit.store(true, Ordering::SeqCst);
                self.shared.state.set(DeviceState::Closed);
                lock(&self.shared.dispatcher).clear();
                control.worker = Some(worker);
                control.filter = None;
                return;
            }
        }

        let was_open = {
            let mut handle = lock(&self.shared.handle);
            let was_open = handle.backend.is_open();
            handle.backend.close();
            was_open
        };
        self.shared.state.set(DeviceState::Closed);
        lock(&self.shared.dispatcher).clear();
        control.filter = None;

        if was_open {
            info!("Closed {}", self.name());
        }
    }

    fn ensure_open(&self) -> Result<(), CaptureError> {
        if self.state() == DeviceState::Closed {
            return Err(CaptureError::not_ready(format!(
                "{} is not open",
                self.name()
            )));
        }
        Ok(())
    }

    fn check_can_capture(&self) -> Result<(), CaptureError> {
        match self.state() {
            DeviceState::Opened => {}
            DeviceState::Closed => {
                return Err(CaptureError::not_ready(format!(
                    "{} must be opened before capturing",
                    self.name()
                )))
            }
            DeviceState::Capturing => {
                return Err(CaptureError::not_ready(format!(
                    "{} is already capturing",
                    self.name()
                )))
            }
        }
        if !lock(&self.shared.dispatcher).has_packet_observers() {
            return Err(CaptureError::not_ready(format!(
                "no packet arrival observer registered on {}",
                self.name()
            )));
        }
        Ok(())
    }

    /// Collect a finished capture loop before starting another one.
    fn reap(&self, control: &mut Control) -> Result<(), CaptureError> {
        let Some(worker) = control.worker.take() else {
            return Ok(());
        };
        if worker.wait(control.config.stop_timeout) {
            worker.join();
            Ok(())
        } else {
            control.worker = Some(worker);
            Err(CaptureError::not_ready(format!(
                "previous capture on {} has not exited",
                self.name()
            )))
        }
    }
}

impl Drop for CaptureDevice {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for CaptureDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureDevice")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}
