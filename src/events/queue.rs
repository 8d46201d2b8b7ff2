use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, PoisonError,
    },
};

use crate::events::LogEvent;

pub const MIN_BATCH_SIZE: usize = 10;
pub const MAX_BATCH_SIZE: usize = 10_000;

/// Bounded FIFO of events waiting for delivery. When full, the oldest event is dropped.
#[derive(Debug)]
pub struct EventQueue {
    batch_size: usize,
    capacity: usize,
    events: Mutex<VecDeque<LogEvent>>,
    dropped: AtomicU64,
}

impl EventQueue {
    pub fn new(batch_size: usize, capacity: usize) -> EventQueue {
        // clamp batch size between min and max
        let batch_size = batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE);
        EventQueue {
            batch_size,
            capacity: capacity.max(batch_size),
            events: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Queue `event`. Returns `true` when a full batch is ready.
    pub fn push(&self, event: LogEvent) -> bool {
        let mut events = self.lock();
        if events.len() >= self.capacity {
            events.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        events.push_back(event);
        events.len() >= self.batch_size
    }

    pub fn next_batch(&self) -> Vec<LogEvent> {
        let mut events = self.lock();
        let n = events.len().min(self.batch_size);
        events.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Events dropped because the queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<LogEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::User;

    fn event(name: &str) -> LogEvent {
        LogEvent::custom(&User::with_user_id("u"), name, None, BTreeMap::new())
    }

    #[test]
    fn batch_size_is_clamped() {
        assert_eq!(EventQueue::new(1, 100).batch_size(), MIN_BATCH_SIZE);
        assert_eq!(EventQueue::new(1_000_000, 100).batch_size(), MAX_BATCH_SIZE);
    }

    #[test]
    fn batches_in_fifo_order() {
        let queue = EventQueue::new(10, 100);
        for i in 0..25 {
            queue.push(event(&i.to_string()));
        }
        let batch = queue.next_batch();
        assert_eq!(batch.len(), 10);
        assert_eq!(batch[0].event_name, "0");
        assert_eq!(queue.next_batch().len(), 10);
        assert_eq!(queue.next_batch().len(), 5);
        assert!(queue.is_empty());
    }

    #[test]
    fn overflow_drops_oldest() {
        let queue = EventQueue::new(10, 10);
        for i in 0..12 {
            queue.push(event(&i.to_string()));
        }
        assert_eq!(queue.len(), 10);
        assert_eq!(queue.dropped_count(), 2);
        assert_eq!(queue.next_batch()[0].event_name, "2");
    }

    #[test]
    fn push_signals_full_batch() {
        let queue = EventQueue::new(10, 100);
        for i in 0..9 {
            assert!(!queue.push(event(&i.to_string())));
        }
        assert!(queue.push(event("9")));
    }
}
