//! Single-consumer completion queue
//!
//! Workers push their output tokens here; the driver is the only consumer.
//! `put` never blocks the caller; `get` parks the consumer until a token
//! arrives. FIFO among observed `put` calls; no ordering across producers.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

/// Unbounded FIFO with a blocking consumer side.
pub struct ResponseQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T> ResponseQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    /// Enqueue an item. Never blocks.
    pub fn put(&self, item: T) {
        self.items.lock().push_back(item);
        self.available.notify_one();
    }

    /// Dequeue the oldest item, blocking until one is available.
    pub fn get(&self) -> T {
        let mut items = self.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return item;
            }
            self.available.wait(&mut items);
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl<T> Default for ResponseQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn fifo_order() {
        let queue = ResponseQueue::new();
        queue.put(1);
        queue.put(2);
        queue.put(3);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.get(), 1);
        assert_eq!(queue.get(), 2);
        assert_eq!(queue.get(), 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn get_blocks_until_put() {
        let queue = Arc::new(ResponseQueue::new());
        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                queue.put(42u32);
            })
        };
        assert_eq!(queue.get(), 42);
        producer.join().unwrap();
    }

    #[test]
    fn many_producers_one_consumer() {
        let queue = Arc::new(ResponseQueue::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let queue = Arc::clone(&queue);
            handles.push(std::thread::spawn(move || {
                for j in 0..50 {
                    queue.put(i * 100 + j);
                }
            }));
        }
        let mut seen = Vec::new();
        for _ in 0..400 {
            seen.push(queue.get());
        }
        for h in handles {
            h.join().unwrap();
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 400);
    }
}
