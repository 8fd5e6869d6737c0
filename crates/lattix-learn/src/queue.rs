//! Blocking bounded MPMC queue used between the orchestrator and workers.
//!
//! `push` blocks while the queue is full (backpressure), `pop` blocks while it
//! is empty. After [`close`](BoundedQueue::close), `push` hands the item back
//! and `pop` drains what is left, then returns `None`. A `None` from `pop` is
//! therefore always the shutdown signal, never a timeout; waiting with a
//! deadline goes through [`pop_timeout`](BoundedQueue::pop_timeout) and
//! [`push_timeout`](BoundedQueue::push_timeout), which report the two cases
//! separately.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Outcome of [`BoundedQueue::pop_timeout`].
#[derive(Debug, PartialEq, Eq)]
pub enum Popped<T> {
    Item(T),
    /// The queue is closed and drained.
    Closed,
    /// Nothing arrived before the deadline. The queue is still open.
    TimedOut,
}

/// Outcome of [`BoundedQueue::push_timeout`]. The item comes back unless queued.
#[derive(Debug, PartialEq, Eq)]
pub enum Pushed<T> {
    Queued,
    Closed(T),
    /// Still full at the deadline. The queue is still open.
    TimedOut(T),
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

pub struct BoundedQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// A queue holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue, waiting for room. Returns the item back if the queue is closed.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        while state.items.len() >= self.capacity && !state.closed {
            self.not_full.wait(&mut state);
        }
        if state.closed {
            return Err(item);
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Enqueue, waiting at most `timeout` for room.
    pub fn push_timeout(&self, item: T, timeout: Duration) -> Pushed<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.items.len() >= self.capacity && !state.closed {
            if self.not_full.wait_until(&mut state, deadline).timed_out()
                && state.items.len() >= self.capacity
                && !state.closed
            {
                return Pushed::TimedOut(item);
            }
        }
        if state.closed {
            return Pushed::Closed(item);
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Pushed::Queued
    }

    /// Dequeue, waiting for an item. `None` once closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Dequeue, waiting at most `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Popped<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Popped::Item(item);
            }
            if state.closed {
                return Popped::Closed;
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                return match state.items.pop_front() {
                    Some(item) => {
                        drop(state);
                        self.not_full.notify_one();
                        Popped::Item(item)
                    }
                    None if state.closed => Popped::Closed,
                    None => Popped::TimedOut,
                };
            }
        }
    }

    /// Dequeue without waiting.
    pub fn try_pop(&self) -> Option<T> {
        let item = self.state.lock().items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Refuse further pushes and wake every waiter.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fifo() {
        let q = BoundedQueue::new(4);
        for i in 0..3 {
            q.push(i).unwrap();
        }
        assert_eq!(q.pop(), Some(0));
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_close_drains_then_none() {
        let q = BoundedQueue::new(2);
        q.push(1).unwrap();
        q.close();
        assert_eq!(q.push(2), Err(2));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_pop_timeout_distinguishes_closure() {
        let q: BoundedQueue<u8> = BoundedQueue::new(1);
        assert_eq!(q.pop_timeout(Duration::from_millis(5)), Popped::TimedOut);
        q.push(7).unwrap();
        assert_eq!(q.pop_timeout(Duration::from_millis(5)), Popped::Item(7));
        q.close();
        assert_eq!(q.pop_timeout(Duration::from_millis(5)), Popped::Closed);
    }

    #[test]
    fn test_push_timeout_on_full_queue() {
        let q = BoundedQueue::new(1);
        assert_eq!(q.push_timeout(1, Duration::from_millis(5)), Pushed::Queued);
        assert_eq!(q.push_timeout(2, Duration::from_millis(5)), Pushed::TimedOut(2));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.push_timeout(3, Duration::from_millis(5)), Pushed::Queued);
        q.close();
        assert_eq!(q.push_timeout(4, Duration::from_millis(5)), Pushed::Closed(4));
    }

    #[test]
    fn test_backpressure_and_consumers() {
        let q = BoundedQueue::new(1);
        let seen = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..3 {
                s.spawn(|| {
                    while let Some(v) = q.pop() {
                        seen.fetch_add(v, Ordering::Relaxed);
                    }
                });
            }
            for v in 1..=100 {
                q.push(v).unwrap();
                assert!(q.len() <= 1);
            }
            q.close();
        });
        assert_eq!(seen.load(Ordering::Relaxed), 5050);
    }
}
