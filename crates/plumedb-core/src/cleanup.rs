//! Delay queue driving deferred eviction of finished requests.
//!
//! A single worker thread sleeps until the earliest deadline, then fires
//! the expiry callback. Expiring an id that was already evicted must be a
//! no-op in the callback; the queue itself never looks inside.

use crate::types::RequestId;
use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Deadline {
    due: Instant,
    request_id: RequestId,
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due
            .cmp(&other.due)
            .then(self.request_id.cmp(&other.request_id))
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct QueueState {
    heap: Mutex<BinaryHeap<Reverse<Deadline>>>,
    signal: Condvar,
    shutdown: AtomicBool,
}

/// Scheduled-eviction queue with a dedicated worker thread.
pub struct CleanupQueue {
    state: Arc<QueueState>,
    worker: Option<JoinHandle<()>>,
}

impl CleanupQueue {
    pub fn new<F>(on_expire: F) -> Self
    where
        F: Fn(RequestId) + Send + Sync + 'static,
    {
        let state = Arc::new(QueueState {
            heap: Mutex::new(BinaryHeap::new()),
            signal: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let worker_state = state.clone();
        let worker = std::thread::spawn(move || {
            loop {
                let mut heap = worker_state.heap.lock();
                if worker_state.shutdown.load(Ordering::Acquire) {
                    break;
                }
                match heap.peek().copied() {
                    None => {
                        worker_state.signal.wait(&mut heap);
                    }
                    Some(Reverse(next)) if next.due <= Instant::now() => {
                        heap.pop();
                        drop(heap);
                        on_expire(next.request_id);
                    }
                    Some(Reverse(next)) => {
                        let _ = worker_state.signal.wait_until(&mut heap, next.due);
                    }
                }
            }
        });

        Self {
            state,
            worker: Some(worker),
        }
    }

    /// Arrange for `on_expire(request_id)` to fire after `delay`.
    pub fn schedule(&self, request_id: RequestId, delay: Duration) {
        let deadline = Deadline {
            due: Instant::now() + delay,
            request_id,
        };
        self.state.heap.lock().push(Reverse(deadline));
        self.state.signal.notify_one();
    }
}

impl Drop for CleanupQueue {
    fn drop(&mut self) {
        self.state.shutdown.store(true, Ordering::Release);
        self.state.signal.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn expiry_fires_after_delay() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        let queue = CleanupQueue::new(move |id| sink.lock().push(id));

        queue.schedule(42, Duration::from_millis(20));
        queue.schedule(7, Duration::from_millis(5));

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(*fired.lock(), vec![7, 42]);
    }

    #[test]
    fn drop_stops_worker_without_firing_pending() {
        let count = Arc::new(AtomicUsize::new(0));
        let sink = count.clone();
        {
            let queue = CleanupQueue::new(move |_| {
                sink.fetch_add(1, Ordering::SeqCst);
            });
            queue.schedule(1, Duration::from_secs(60));
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
