//! Internally synchronized FIFO shared between engine threads.
//!
//! Producers that must never block use [`ThreadSafeQueue::push_bounded`],
//! whose three outcomes (`Pushed`, `QueueFull`, `QueueStopped`) let the
//! caller trim-and-retry without holding any external lock. Consumers block
//! in [`ThreadSafeQueue::pop`] until an item arrives or the queue is
//! stopped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

/// Outcome of a bounded push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    /// The item was enqueued.
    Pushed,
    /// The queue was at capacity and `evict_oldest` was false.
    QueueFull,
    /// The queue has been stopped; the item was dropped.
    QueueStopped,
}

/// Multi-producer multi-consumer FIFO with stop semantics.
pub struct ThreadSafeQueue<T> {
    inner: Mutex<VecDeque<T>>,
    cond: Condvar,
    stopped: AtomicBool,
}

impl<T> Default for ThreadSafeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ThreadSafeQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        ThreadSafeQueue {
            inner: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Pushes without a bound. Silently dropped after `stop`.
    pub fn push(&self, item: T) {
        {
            let mut queue = self.inner.lock();
            if self.stopped.load(Ordering::Acquire) {
                return;
            }
            queue.push_back(item);
        }
        self.cond.notify_one();
    }

    /// Pushes with a capacity bound.
    ///
    /// `max_size == 0` means unbounded. When full and `evict_oldest` is set,
    /// the front item is dropped to make room; otherwise `QueueFull` is
    /// returned and the item is discarded.
    pub fn push_bounded(&self, item: T, max_size: usize, evict_oldest: bool) -> PushResult {
        let result = {
            let mut queue = self.inner.lock();
            if self.stopped.load(Ordering::Acquire) {
                return PushResult::QueueStopped;
            }
            if max_size > 0 && queue.len() >= max_size {
                if evict_oldest {
                    queue.pop_front();
                    queue.push_back(item);
                    PushResult::Pushed
                } else {
                    PushResult::QueueFull
                }
            } else {
                queue.push_back(item);
                PushResult::Pushed
            }
        };
        if result == PushResult::Pushed {
            self.cond.notify_one();
        }
        result
    }

    /// Blocks until an item is available or the queue is stopped.
    ///
    /// Returns `None` only when the queue was stopped and drained.
    pub fn pop(&self) -> Option<T> {
        let mut queue = self.inner.lock();
        loop {
            if let Some(item) = queue.pop_front() {
                return Some(item);
            }
            if self.stopped.load(Ordering::Acquire) {
                return None;
            }
            self.cond.wait(&mut queue);
        }
    }

    /// Blocks for at most `timeout`; `None` on timeout or stop-and-drained.
    pub fn pop_timeout(&self, timeout: std::time::Duration) -> Option<T> {
        let deadline = std::time::Instant::now() + timeout;
        let mut queue = self.inner.lock();
        loop {
            if let Some(item) = queue.pop_front() {
                return Some(item);
            }
            if self.stopped.load(Ordering::Acquire) {
                return None;
            }
            if self.cond.wait_until(&mut queue, deadline).timed_out() {
                return queue.pop_front();
            }
        }
    }

    /// Non-blocking pop. Stopped queues still drain.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().pop_front()
    }

    /// Signals every blocked consumer to give up once drained, and makes
    /// future pushes no-ops.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    /// Whether `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Current queue depth.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Drops every queued item, returning how many were removed.
    pub fn drain(&self) -> usize {
        let mut queue = self.inner.lock();
        let count = queue.len();
        queue.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn push_pop_roundtrip() {
        let queue = ThreadSafeQueue::new();
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn bounded_push_reports_full() {
        let queue = ThreadSafeQueue::new();
        assert_eq!(queue.push_bounded(1, 2, false), PushResult::Pushed);
        assert_eq!(queue.push_bounded(2, 2, false), PushResult::Pushed);
        assert_eq!(queue.push_bounded(3, 2, false), PushResult::QueueFull);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn bounded_push_can_evict() {
        let queue = ThreadSafeQueue::new();
        queue.push_bounded(1, 2, false);
        queue.push_bounded(2, 2, false);
        assert_eq!(queue.push_bounded(3, 2, true), PushResult::Pushed);
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
    }

    #[test]
    fn stop_wakes_blocked_consumer() {
        let queue: Arc<ThreadSafeQueue<i32>> = Arc::new(ThreadSafeQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.pop())
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.stop();
        assert_eq!(consumer.join().unwrap(), None);
        assert_eq!(queue.push_bounded(9, 0, false), PushResult::QueueStopped);
    }

    #[test]
    fn stopped_queue_still_drains() {
        let queue = ThreadSafeQueue::new();
        queue.push(7);
        queue.stop();
        assert_eq!(queue.pop(), Some(7));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn pop_timeout_expires() {
        let queue: ThreadSafeQueue<i32> = ThreadSafeQueue::new();
        let start = std::time::Instant::now();
        assert_eq!(queue.pop_timeout(Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }
}
