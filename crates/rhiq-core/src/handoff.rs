//! Blocking single-consumer handoff queue.
//!
//! An unbounded FIFO guarded by a mutex plus condition variable. The closing
//! flag lives under the same lock as the items, so a consumer can never miss
//! the wake-up that tells it to drain and exit.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

struct HandoffState<T> {
    items: VecDeque<T>,
    closing: bool,
}

pub struct HandoffQueue<T> {
    state: Mutex<HandoffState<T>>,
    wake: Condvar,
}

impl<T> HandoffQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HandoffState {
                items: VecDeque::new(),
                closing: false,
            }),
            wake: Condvar::new(),
        }
    }

    pub fn push(&self, item: T) {
        self.state.lock().items.push_back(item);
        self.wake.notify_one();
    }

    /// Build and push an item while holding the queue lock, so that whatever
    /// `build` assigns is ordered exactly like the queue itself.
    pub fn try_push_with<R, E>(&self, build: impl FnOnce() -> Result<(T, R), E>) -> Result<R, E> {
        let out = {
            let mut state = self.state.lock();
            let (item, out) = build()?;
            state.items.push_back(item);
            out
        };
        self.wake.notify_one();
        Ok(out)
    }

    /// Block until an item is available and pop it together with up to
    /// `max - 1` directly following items accepted by `same_batch`.
    ///
    /// Returns an empty vector once the queue is closing and fully drained.
    pub fn wait_pop_batch(&self, max: usize, same_batch: impl Fn(&T, &T) -> bool) -> Vec<T> {
        let mut state = self.state.lock();
        while state.items.is_empty() && !state.closing {
            self.wake.wait(&mut state);
        }

        let mut batch = Vec::new();
        let Some(first) = state.items.pop_front() else {
            return batch;
        };
        batch.push(first);
        while batch.len() < max.max(1) {
            let joins = state
                .items
                .front()
                .is_some_and(|next| same_batch(&batch[0], next));
            if !joins {
                break;
            }
            if let Some(item) = state.items.pop_front() {
                batch.push(item);
            }
        }
        batch
    }

    /// Block until an item is available. `None` once closing and drained.
    pub fn wait_pop(&self) -> Option<T> {
        self.wait_pop_batch(1, |_, _| false).pop()
    }

    /// Pop the head without blocking.
    pub fn try_pop(&self) -> Option<T> {
        self.state.lock().items.pop_front()
    }

    /// Wake the consumer and let it exit once the queue is empty.
    pub fn close(&self) {
        self.state.lock().closing = true;
        self.wake.notify_all();
    }

    /// Clear the closing flag before the consumer is started again.
    pub fn reopen(&self) {
        self.state.lock().closing = false;
    }

    pub fn is_closing(&self) -> bool {
        self.state.lock().closing
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Remove every queued item.
    pub fn drain(&self) -> Vec<T> {
        self.state.lock().items.drain(..).collect()
    }
}

impl<T> Default for HandoffQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let q = HandoffQueue::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.wait_pop(), Some(1));
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_batch_stops_at_different_key() {
        let q = HandoffQueue::new();
        for item in [(0, 'a'), (0, 'b'), (1, 'c'), (0, 'd')] {
            q.push(item);
        }
        let batch = q.wait_pop_batch(8, |a, b| a.0 == b.0);
        assert_eq!(batch, vec![(0, 'a'), (0, 'b')]);
        let batch = q.wait_pop_batch(8, |a, b| a.0 == b.0);
        assert_eq!(batch, vec![(1, 'c')]);
    }

    #[test]
    fn test_batch_respects_max() {
        let q = HandoffQueue::new();
        for i in 0..5 {
            q.push(i);
        }
        assert_eq!(q.wait_pop_batch(2, |_, _| true), vec![0, 1]);
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_close_wakes_blocked_consumer() {
        let q = Arc::new(HandoffQueue::<u32>::new());
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.wait_pop())
        };
        thread::sleep(Duration::from_millis(20));
        q.close();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn test_close_still_drains() {
        let q = HandoffQueue::new();
        q.push(7);
        q.close();
        assert_eq!(q.wait_pop(), Some(7));
        assert_eq!(q.wait_pop(), None);
        q.reopen();
        assert!(!q.is_closing());
    }

    #[test]
    fn test_push_with_runs_under_lock() {
        let q = HandoffQueue::new();
        let mut counter = 0u64;
        for _ in 0..3 {
            let assigned: Result<u64, ()> = q.try_push_with(|| {
                counter += 1;
                Ok((counter, counter))
            });
            assert!(assigned.is_ok());
        }
        assert_eq!(q.drain(), vec![1, 2, 3]);
    }
}
