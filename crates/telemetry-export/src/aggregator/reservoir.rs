// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::item::TelemetryItem;

/// What happens to an item offered to a full reservoir.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the lowest-priority item when the newcomer ranks higher.
    #[default]
    PrioritySampling,
    /// Keep what is buffered and reject the newcomer.
    DropNewest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Added,
    /// Added in place of a lower-priority item.
    Replaced,
    Rejected,
}

impl Admission {
    /// Whether an item was lost, either the offered one or the evicted one.
    pub fn dropped(self) -> bool {
        !matches!(self, Admission::Added)
    }
}

/// Bounded buffer for one harvest window.
///
/// Items sit in a min-heap keyed by priority and arrival sequence, so the
/// eviction candidate is always at the top. Arrival order is restored when
/// the items are taken out.
#[derive(Debug)]
pub struct Reservoir<T> {
    slots: BinaryHeap<Reverse<Slot<T>>>,
    capacity: usize,
    policy: OverflowPolicy,
    seen: u64,
    // Sequence numbers handed out at the head and at the tail.
    first_seq: i64,
    next_seq: i64,
}

#[derive(Debug)]
struct Slot<T> {
    seq: i64,
    item: T,
}

impl<T: TelemetryItem> PartialEq for Slot<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: TelemetryItem> Eq for Slot<T> {}

impl<T: TelemetryItem> PartialOrd for Slot<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Lowest priority first; ties go to the oldest item.
impl<T: TelemetryItem> Ord for Slot<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.item
            .priority()
            .total_cmp(&other.item.priority())
            .then(self.seq.cmp(&other.seq))
    }
}

impl<T: TelemetryItem> Reservoir<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            slots: BinaryHeap::new(),
            capacity,
            policy,
            seen: 0,
            first_seq: 0,
            next_seq: 0,
        }
    }

    pub fn add(&mut self, item: T) -> Admission {
        self.seen = self.seen.saturating_add(1);
        if self.slots.len() < self.capacity {
            self.push_back(item);
            return Admission::Added;
        }

        match self.policy {
            OverflowPolicy::DropNewest => Admission::Rejected,
            OverflowPolicy::PrioritySampling => match self.slots.peek() {
                Some(Reverse(lowest)) if item.priority() > lowest.item.priority() => {
                    self.slots.pop();
                    self.push_back(item);
                    Admission::Replaced
                }
                _ => Admission::Rejected,
            },
        }
    }

    /// Puts `items`, older than anything buffered, back at the head. When the
    /// result does not fit, the oldest items go first. Returns how many were
    /// dropped.
    pub fn retain_front(&mut self, items: Vec<T>) -> usize {
        let excess = (items.len() + self.slots.len()).saturating_sub(self.capacity);
        self.first_seq -= items.len() as i64;
        let base = self.first_seq;
        for (offset, item) in items.into_iter().enumerate().skip(excess) {
            self.slots.push(Reverse(Slot {
                seq: base + offset as i64,
                item,
            }));
        }
        excess
    }

    /// Changes the capacity, dropping as few items as possible. Returns how
    /// many were dropped.
    pub fn set_capacity(&mut self, capacity: usize) -> usize {
        self.capacity = capacity;
        let excess = self.slots.len().saturating_sub(capacity);
        if excess == 0 {
            return 0;
        }

        match self.policy {
            OverflowPolicy::DropNewest => {
                let mut slots = self.take_ordered();
                slots.truncate(capacity);
                self.slots = slots.into_iter().map(Reverse).collect();
            }
            OverflowPolicy::PrioritySampling => {
                for _ in 0..excess {
                    self.slots.pop();
                }
            }
        }
        excess
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Items offered since the reservoir was created.
    pub fn seen(&self) -> u64 {
        self.seen
    }

    /// Buffered items in arrival order.
    pub fn into_items(mut self) -> Vec<T> {
        self.take_ordered()
            .into_iter()
            .map(|slot| slot.item)
            .collect()
    }

    fn push_back(&mut self, item: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.slots.push(Reverse(Slot { seq, item }));
    }

    fn take_ordered(&mut self) -> Vec<Slot<T>> {
        let mut slots: Vec<Slot<T>> = std::mem::take(&mut self.slots)
            .into_iter()
            .map(|Reverse(slot)| slot)
            .collect();
        slots.sort_unstable_by_key(|slot| slot.seq);
        slots
    }
}

/// Keeps the `count` highest-priority items, in their original order.
pub(crate) fn keep_highest<T: TelemetryItem>(items: Vec<T>, count: usize) -> Vec<T> {
    let mut reservoir = Reservoir::new(items.len(), OverflowPolicy::PrioritySampling);
    for item in items {
        reservoir.push_back(item);
    }
    reservoir.set_capacity(count.min(reservoir.len()));
    reservoir.into_items()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::test_support::{ids, TestItem};

    fn item(id: u32, priority: f32) -> TestItem {
        TestItem::with_priority(id, priority)
    }

    #[test]
    fn test_add_until_full() {
        let mut reservoir = Reservoir::new(2, OverflowPolicy::PrioritySampling);
        assert_eq!(reservoir.add(item(1, 0.2)), Admission::Added);
        assert_eq!(reservoir.add(item(2, 0.4)), Admission::Added);
        assert_eq!(reservoir.add(item(3, 0.1)), Admission::Rejected);
        assert_eq!(reservoir.add(item(4, 0.9)), Admission::Replaced);
        assert_eq!(reservoir.seen(), 4);
        assert_eq!(ids(&reservoir.into_items()), vec![2, 4]);
    }

    #[test]
    fn test_equal_priority_is_not_replaced() {
        let mut reservoir = Reservoir::new(1, OverflowPolicy::PrioritySampling);
        reservoir.add(item(1, 0.5));
        assert_eq!(reservoir.add(item(2, 0.5)), Admission::Rejected);
        assert_eq!(ids(&reservoir.into_items()), vec![1]);
    }

    #[test]
    fn test_drop_newest() {
        let mut reservoir = Reservoir::new(1, OverflowPolicy::DropNewest);
        reservoir.add(item(1, 0.1));
        assert_eq!(reservoir.add(item(2, 0.9)), Admission::Rejected);
        assert_eq!(ids(&reservoir.into_items()), vec![1]);
    }

    #[test]
    fn test_zero_capacity_rejects_everything() {
        let mut reservoir = Reservoir::new(0, OverflowPolicy::PrioritySampling);
        assert_eq!(reservoir.add(item(1, 1.0)), Admission::Rejected);
        assert!(reservoir.is_empty());
        assert_eq!(reservoir.seen(), 1);
    }

    #[test]
    fn test_retain_front_drops_oldest() {
        let mut reservoir = Reservoir::new(3, OverflowPolicy::PrioritySampling);
        reservoir.add(TestItem::new(4));
        reservoir.add(TestItem::new(5));

        let dropped = reservoir.retain_front(vec![TestItem::new(1), TestItem::new(2), TestItem::new(3)]);

        assert_eq!(dropped, 2);
        assert_eq!(ids(&reservoir.into_items()), vec![3, 4, 5]);
    }

    #[test]
    fn test_retain_front_into_full_reservoir() {
        let mut reservoir = Reservoir::new(2, OverflowPolicy::DropNewest);
        reservoir.add(TestItem::new(3));
        reservoir.add(TestItem::new(4));

        assert_eq!(
            reservoir.retain_front(vec![TestItem::new(1), TestItem::new(2)]),
            2
        );
        assert_eq!(ids(&reservoir.into_items()), vec![3, 4]);
    }

    #[test]
    fn test_replacements_keep_arrival_order() {
        let mut reservoir = Reservoir::new(3, OverflowPolicy::PrioritySampling);
        for (id, priority) in [(1, 0.5), (2, 0.1), (3, 0.7), (4, 0.9), (5, 0.2), (6, 0.6)] {
            reservoir.add(item(id, priority));
        }
        reservoir.retain_front(vec![item(0, 0.0)]);

        assert_eq!(ids(&reservoir.into_items()), vec![3, 4, 6]);
    }

    #[test]
    fn test_sustained_overflow_keeps_top_priorities() {
        let mut reservoir = Reservoir::new(100, OverflowPolicy::PrioritySampling);
        for id in 0..10_000u32 {
            reservoir.add(item(id, (id % 1_000) as f32 / 1_000.0));
        }

        let kept = reservoir.into_items();
        assert_eq!(kept.len(), 100);
        assert!(kept.iter().all(|item| item.priority() >= 0.9));
        assert!(kept.windows(2).all(|pair| pair[0].id < pair[1].id));
    }

    #[test]
    fn test_retain_front_with_room() {
        let mut reservoir = Reservoir::new(10, OverflowPolicy::DropNewest);
        reservoir.add(TestItem::new(3));
        assert_eq!(
            reservoir.retain_front(vec![TestItem::new(1), TestItem::new(2)]),
            0
        );
        assert_eq!(ids(&reservoir.into_items()), vec![1, 2, 3]);
    }

    #[test]
    fn test_shrink_with_priority_keeps_best() {
        let mut reservoir = Reservoir::new(5, OverflowPolicy::PrioritySampling);
        for (id, priority) in [(1, 0.9), (2, 0.1), (3, 0.5), (4, 0.1), (5, 0.7)] {
            reservoir.add(item(id, priority));
        }

        assert_eq!(reservoir.set_capacity(3), 2);
        assert_eq!(reservoir.capacity(), 3);
        assert_eq!(ids(&reservoir.into_items()), vec![1, 3, 5]);
    }

    #[test]
    fn test_shrink_drop_newest_keeps_oldest() {
        let mut reservoir = Reservoir::new(5, OverflowPolicy::DropNewest);
        for id in 1..=5 {
            reservoir.add(TestItem::new(id));
        }
        assert_eq!(reservoir.set_capacity(3), 2);
        assert_eq!(ids(&reservoir.into_items()), vec![1, 2, 3]);
    }

    #[test]
    fn test_grow_keeps_everything() {
        let mut reservoir = Reservoir::new(2, OverflowPolicy::PrioritySampling);
        reservoir.add(TestItem::new(1));
        reservoir.add(TestItem::new(2));
        assert_eq!(reservoir.set_capacity(10), 0);
        assert_eq!(reservoir.add(TestItem::new(3)), Admission::Added);
        assert_eq!(reservoir.len(), 3);
    }

    #[test]
    fn test_keep_highest() {
        let items = vec![item(1, 0.3), item(2, 0.8), item(3, 0.5), item(4, 0.1)];
        assert_eq!(ids(&keep_highest(items.clone(), 2)), vec![2, 3]);
        assert_eq!(ids(&keep_highest(items.clone(), 0)), Vec::<u32>::new());
        assert_eq!(ids(&keep_highest(items, 10)), vec![1, 2, 3, 4]);
    }
}
