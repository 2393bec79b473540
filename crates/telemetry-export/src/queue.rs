// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded queue sharded into independently locked partitions.
//!
//! Producers never block: [`PartitionedQueue::try_add`] either admits the item
//! into the first partition with room (starting from a round-robin position)
//! or rejects it and counts the drop. Consumers wait asynchronously for items
//! with [`PartitionedQueue::take`], starting from their home partition and
//! falling back to the others so that every partition drains even when there
//! are fewer consumers than partitions.
//!
//! Every entry carries a sequence number. Items handed back with
//! [`PartitionedQueue::requeue_front`] get numbers below every live entry, so
//! [`PartitionedQueue::drain`] always returns items in insertion order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct Entry<T> {
    seq: i64,
    item: T,
}

struct Partition<T> {
    items: Mutex<VecDeque<Entry<T>>>,
    capacity: usize,
}

impl<T> Partition<T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Entry<T>>> {
        #[allow(clippy::expect_used)]
        let items = self.items.lock().expect("lock poisoned");
        items
    }
}

/// Multi-producer, multi-consumer bounded queue.
pub struct PartitionedQueue<T> {
    partitions: Vec<Partition<T>>,
    capacity: usize,
    next_partition: AtomicUsize,
    back_sequence: AtomicI64,
    front_sequence: AtomicI64,
    len: AtomicUsize,
    admitted: AtomicU64,
    dropped: AtomicU64,
    available: Notify,
}

impl<T> std::fmt::Debug for PartitionedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionedQueue")
            .field("capacity", &self.capacity)
            .field("partitions", &self.partitions.len())
            .field("len", &self.len())
            .field("dropped", &self.dropped_count())
            .finish()
    }
}

impl<T> PartitionedQueue<T> {
    /// Creates a queue holding at most `capacity` items. The partition count is
    /// clamped to `[1, capacity]`. Returns `None` for a zero capacity.
    pub fn new(capacity: usize, partition_count: usize) -> Option<Self> {
        if capacity == 0 {
            return None;
        }
        let count = partition_count.clamp(1, capacity);
        let base = capacity / count;
        let remainder = capacity % count;
        let partitions = (0..count)
            .map(|index| Partition {
                items: Mutex::new(VecDeque::new()),
                capacity: base + usize::from(index < remainder),
            })
            .collect();

        Some(Self {
            partitions,
            capacity,
            next_partition: AtomicUsize::new(0),
            back_sequence: AtomicI64::new(0),
            front_sequence: AtomicI64::new(-1),
            len: AtomicUsize::new(0),
            admitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            available: Notify::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items admitted through `try_add` since construction.
    pub fn admitted_count(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    /// Items rejected or lost since construction.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Admits `item` if any partition has room. Never blocks.
    pub fn try_add(&self, item: T) -> bool {
        if self.push(item) {
            self.admitted.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Admits as many of `items` as fit and returns how many were admitted.
    pub fn try_add_all(&self, items: impl IntoIterator<Item = T>) -> usize {
        items
            .into_iter()
            .map(|item| self.try_add(item))
            .filter(|admitted| *admitted)
            .count()
    }

    fn push(&self, item: T) -> bool {
        let count = self.partitions.len();
        let start = self.next_partition.fetch_add(1, Ordering::Relaxed) % count;
        for offset in 0..count {
            let partition = &self.partitions[(start + offset) % count];
            let mut items = partition.lock();
            if items.len() < partition.capacity {
                let seq = self.back_sequence.fetch_add(1, Ordering::Relaxed);
                items.push_back(Entry { seq, item });
                self.len.fetch_add(1, Ordering::AcqRel);
                drop(items);
                self.available.notify_waiters();
                return true;
            }
        }
        false
    }

    /// Removes the oldest item of the first non-empty partition, starting at
    /// `home`.
    pub fn try_take(&self, home: usize) -> Option<T> {
        let count = self.partitions.len();
        for offset in 0..count {
            let partition = &self.partitions[(home + offset) % count];
            if let Some(entry) = partition.lock().pop_front() {
                self.len.fetch_sub(1, Ordering::AcqRel);
                return Some(entry.item);
            }
        }
        None
    }

    /// Waits for an item. Returns `None` once `cancel` fires.
    pub async fn take(&self, home: usize, cancel: &CancellationToken) -> Option<T> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_take(home) {
                return Some(item);
            }
            tokio::select! {
                () = cancel.cancelled() => return None,
                () = &mut notified => {}
            }
        }
    }

    /// Waits for the first item, then takes whatever else is immediately
    /// available up to `max` items in total. Empty only when cancelled.
    pub async fn take_batch(&self, home: usize, max: usize, cancel: &CancellationToken) -> Vec<T> {
        let Some(first) = self.take(home, cancel).await else {
            return Vec::new();
        };
        let mut batch = Vec::with_capacity(max.min(self.capacity));
        batch.push(first);
        while batch.len() < max {
            match self.try_take(home) {
                Some(item) => batch.push(item),
                None => break,
            }
        }
        batch
    }

    /// Returns unsent items to the head of `home`, oldest first. Items that no
    /// longer fit are dropped and counted; the dropped count is returned.
    pub fn requeue_front(&self, home: usize, mut items: Vec<T>) -> usize {
        let partition = &self.partitions[home % self.partitions.len()];
        let mut queued = partition.lock();
        let room = partition.capacity.saturating_sub(queued.len());
        let dropped = items.len().saturating_sub(room);
        items.truncate(room);
        let restored = items.len();
        for item in items.into_iter().rev() {
            let seq = self.front_sequence.fetch_sub(1, Ordering::Relaxed);
            queued.push_front(Entry { seq, item });
        }
        drop(queued);

        if restored > 0 {
            self.len.fetch_add(restored, Ordering::AcqRel);
            self.available.notify_waiters();
        }
        if dropped > 0 {
            self.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
        }
        dropped
    }

    /// Removes every item, returned in insertion order.
    pub fn drain(&self) -> Vec<T> {
        let mut entries = Vec::with_capacity(self.len());
        for partition in &self.partitions {
            let mut items = partition.lock();
            let taken = items.len();
            entries.extend(items.drain(..));
            self.len.fetch_sub(taken, Ordering::AcqRel);
        }
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| entry.item).collect()
    }

    /// Moves the contents into a queue of `new_capacity`, keeping the oldest
    /// `min(len, new_capacity)` items in order. Returns the new queue (`None`
    /// for a zero capacity) and the number of items dropped.
    pub fn resize(&self, new_capacity: usize, partition_count: usize) -> (Option<Self>, usize) {
        let mut items = self.drain();
        let Some(queue) = Self::new(new_capacity, partition_count) else {
            return (None, items.len());
        };
        let dropped = items.len().saturating_sub(new_capacity);
        items.truncate(new_capacity);
        for item in items {
            queue.push(item);
        }
        (Some(queue), dropped)
    }
}
