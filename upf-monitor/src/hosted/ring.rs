use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;

use upf_monitor_common::ring_capacity;

/// Bounded lock-free event channel with the capacity a kernel ring buffer of
/// the same byte size would have.
#[derive(Debug)]
pub struct EventRing<T> {
    queue: ArrayQueue<T>,
    dropped: AtomicU64,
}

impl<T> EventRing<T> {
    pub fn with_byte_size(byte_size: u32) -> Self {
        Self::with_capacity(ring_capacity(byte_size, mem::size_of::<T>()))
    }

    pub fn with_capacity(records: usize) -> Self {
        Self {
            queue: ArrayQueue::new(records.max(1)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Never blocks; a full ring leaves committed records untouched.
    pub fn try_publish(&self, record: T) -> bool {
        match self.queue.push(record) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Builds the record only when the ring has room. Every rejection counts
    /// towards [`dropped`](Self::dropped), whether it is seen before or after
    /// building.
    pub fn publish_with<F: FnOnce() -> T>(&self, build: F) -> bool {
        if self.queue.is_full() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.try_publish(build())
    }

    pub fn has_room(&self) -> bool {
        !self.queue.is_full()
    }

    pub fn pop(&self) -> Option<T> {
        self.queue.pop()
    }

    pub fn drain(&self) -> Vec<T> {
        let mut records = Vec::with_capacity(self.queue.len());
        while let Some(record) = self.queue.pop() {
            records.push(record);
        }
        records
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Publishes rejected because the ring was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
