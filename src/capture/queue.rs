//! Producer/consumer hand-off between a capture callback and a drain thread.
//!
//! The capture side pushes into a bounded buffer and never waits on the
//! consumer. The drain side swaps the whole buffer for an empty one under
//! the lock and processes the batch with the lock released, so the
//! critical section is one `Vec` swap regardless of how slow processing is.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

pub struct SwapQueue<T> {
    items: Mutex<Vec<T>>,
    ready: Condvar,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T> SwapQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(Vec::with_capacity(capacity.min(4096))),
            ready: Condvar::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue an item without blocking. Returns false and counts a drop
    /// when the queue is full.
    pub fn push(&self, item: T) -> bool {
        let mut items = self.lock();
        if items.len() >= self.capacity {
            drop(items);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        items.push(item);
        drop(items);
        self.ready.notify_one();
        true
    }

    /// Exchange the queued items with `spare`, which should be empty.
    pub fn swap(&self, spare: &mut Vec<T>) {
        std::mem::swap(&mut *self.lock(), spare);
    }

    /// Like [`swap`](Self::swap), but first wait up to `timeout` for an item.
    pub fn wait_swap(&self, spare: &mut Vec<T>, timeout: Duration) {
        let items = self.lock();
        let (mut items, _) = self
            .ready
            .wait_timeout_while(items, timeout, |items| items.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::swap(&mut *items, spare);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Items rejected because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A thread draining a [`SwapQueue`] into a handler.
pub struct DrainWorker {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<u64>>,
}

impl DrainWorker {
    /// Spawn a drain thread calling `handler` for every queued item.
    ///
    /// `poll` bounds how long the thread sleeps while the queue is empty,
    /// and therefore how long [`stop`](Self::stop) takes.
    pub fn spawn<T, F>(
        name: &str,
        queue: Arc<SwapQueue<T>>,
        poll: Duration,
        mut handler: F,
    ) -> std::io::Result<Self>
    where
        T: Send + 'static,
        F: FnMut(T) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut batch = Vec::new();
                let mut handled = 0u64;
                loop {
                    let stopping = stop_flag.load(Ordering::SeqCst);
                    queue.wait_swap(&mut batch, poll);
                    handled += batch.len() as u64;
                    batch.drain(..).for_each(&mut handler);
                    // One final swap after the stop request picks up stragglers
                    if stopping {
                        break;
                    }
                }
                debug!("Drain thread handled {} items", handled);
                handled
            })?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Drain what is left, stop the thread and return how many items it handled.
    pub fn stop(mut self) -> u64 {
        self.shutdown()
    }

    fn shutdown(&mut self) -> u64 {
        self.stop.store(true, Ordering::SeqCst);
        match self.thread.take().map(JoinHandle::join) {
            Some(Ok(handled)) => handled,
            Some(Err(_)) => {
                warn!("Drain thread panicked");
                0
            }
            None => 0,
        }
    }
}

impl Drop for DrainWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_bounded_counts_drops() {
        let queue = SwapQueue::new(2);
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert!(!queue.push(3));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn test_swap_takes_everything() {
        let queue = SwapQueue::new(10);
        queue.push("a");
        queue.push("b");

        let mut batch = Vec::new();
        queue.swap(&mut batch);

        assert_eq!(batch, vec!["a", "b"]);
        assert!(queue.is_empty());
        // Space is available again after a swap
        assert!(queue.push("c"));
    }

    #[test]
    fn test_wait_swap_times_out_empty() {
        let queue: SwapQueue<u8> = SwapQueue::new(10);
        let mut batch = Vec::new();
        queue.wait_swap(&mut batch, Duration::from_millis(10));
        assert!(batch.is_empty());
    }

    #[test]
    fn test_drain_worker_handles_all_items_in_order() {
        let queue = Arc::new(SwapQueue::new(10_000));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let worker = DrainWorker::spawn(
            "drain-test",
            queue.clone(),
            Duration::from_millis(5),
            move |n: u32| sink.lock().unwrap().push(n),
        )
        .unwrap();

        for n in 0..1000u32 {
            assert!(queue.push(n));
        }
        let handled = worker.stop();

        assert_eq!(handled, 1000);
        assert_eq!(*seen.lock().unwrap(), (0..1000).collect::<Vec<_>>());
    }
}
