//! Open queues of the A* decoder.
//!
//! Both implementations order hypothesis handles by weight, support
//! decrease-key through [`OpenQueue::update`] and make room for new entries
//! when bounded.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use crate::constants::astar::{PRUNE_COUNT_FRACTION, PRUNE_WEIGHT_FRACTION};
use crate::memory::PoolIdx;

/// Answer of [`OpenQueue::make_room`].
#[derive(Debug, Clone, PartialEq)]
pub enum MakeRoom {
    /// The incoming entry is not worth a slot.
    Rejected,
    /// These entries were removed; the caller discards them.
    Evicted(Vec<PoolIdx>),
}

/// Priority queue with decrease-key and prune-worst.
pub trait OpenQueue: Send {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn capacity(&self) -> usize;
    fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }
    fn contains(&self, idx: PoolIdx) -> bool;
    fn push(&mut self, idx: PoolIdx, weight: f64);
    /// Re-position an entry whose weight changed.
    fn update(&mut self, idx: PoolIdx, weight: f64);
    fn remove(&mut self, idx: PoolIdx) -> bool;
    /// Entry with the lowest weight.
    fn pop(&mut self) -> Option<(PoolIdx, f64)>;
    /// Free at least one slot for an entry of weight `incoming`.
    fn make_room(&mut self, incoming: f64) -> MakeRoom;
    /// Raise the capacity when the queue is not pruned.
    fn grow(&mut self);
    /// Largest length reached.
    fn peak(&self) -> usize;
    fn memory_bytes(&self) -> usize;
}

/// Binary min-heap with an embedded position index for O(log n)
/// decrease-key. Positions are 1-based; 0 marks "not queued".
#[derive(Debug)]
pub struct HeapQueue {
    heap: Vec<(PoolIdx, f64)>,
    positions: Vec<u32>,
    capacity: usize,
    wmax: f64,
    peak: usize,
}

impl HeapQueue {
    /// Capacity is rounded to `2^k - 1`, so leaves fill the last level.
    pub fn new(size: usize) -> Self {
        let capacity = (size.max(1) + 1).next_power_of_two() - 1;
        Self {
            heap: vec![(PoolIdx::from(0), 0.0)],
            positions: Vec::new(),
            capacity,
            wmax: f64::NEG_INFINITY,
            peak: 0,
        }
    }

    fn set_position(&mut self, idx: PoolIdx, pos: usize) {
        let slot = idx.as_usize();
        if slot >= self.positions.len() {
            self.positions.resize(slot + 1, 0);
        }
        self.positions[slot] = pos as u32;
    }

    fn position(&self, idx: PoolIdx) -> usize {
        self.positions.get(idx.as_usize()).copied().unwrap_or(0) as usize
    }

    fn place(&mut self, pos: usize, entry: (PoolIdx, f64)) {
        self.heap[pos] = entry;
        self.set_position(entry.0, pos);
    }

    fn sift_up(&mut self, mut pos: usize) {
        let entry = self.heap[pos];
        while pos > 1 && self.heap[pos / 2].1 > entry.1 {
            let parent = self.heap[pos / 2];
            self.place(pos, parent);
            pos /= 2;
        }
        self.place(pos, entry);
    }

    fn sift_down(&mut self, mut pos: usize) {
        let entry = self.heap[pos];
        let len = self.len();
        loop {
            let mut child = pos * 2;
            if child > len {
                break;
            }
            if child < len && self.heap[child + 1].1 < self.heap[child].1 {
                child += 1;
            }
            if self.heap[child].1 >= entry.1 {
                break;
            }
            let moved = self.heap[child];
            self.place(pos, moved);
            pos = child;
        }
        self.place(pos, entry);
    }

    fn remove_at(&mut self, pos: usize) -> (PoolIdx, f64) {
        let removed = self.heap[pos];
        self.set_position(removed.0, 0);
        let last = self.heap.len() - 1;
        let tail = self.heap.swap_remove(last);
        if pos < last {
            self.place(pos, tail);
            self.sift_up(pos);
            let pos = self.position(tail.0);
            self.sift_down(pos);
        }
        removed
    }

    /// Remove up to `max` leaves with weight at or above `threshold`,
    /// scanning from the end.
    fn evict_leaves(&mut self, threshold: f64, max: usize, evicted: &mut Vec<PoolIdx>) -> usize {
        let first_leaf = (self.capacity + 1) / 2;
        let mut count = 0;
        let mut pos = self.len();
        while pos >= first_leaf.max(1) && count < max {
            if pos <= self.len() && self.heap[pos].1 >= threshold {
                evicted.push(self.remove_at(pos).0);
                count += 1;
            }
            pos -= 1;
        }
        count
    }
}

impl OpenQueue for HeapQueue {
    fn len(&self) -> usize {
        self.heap.len() - 1
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn contains(&self, idx: PoolIdx) -> bool {
        self.position(idx) != 0
    }

    fn push(&mut self, idx: PoolIdx, weight: f64) {
        self.heap.push((idx, weight));
        let pos = self.len();
        self.set_position(idx, pos);
        self.sift_up(pos);
        self.wmax = self.wmax.max(weight);
        self.peak = self.peak.max(self.len());
    }

    fn update(&mut self, idx: PoolIdx, weight: f64) {
        let pos = self.position(idx);
        if pos == 0 {
            return;
        }
        self.heap[pos].1 = weight;
        self.sift_up(pos);
        let pos = self.position(idx);
        self.sift_down(pos);
        self.wmax = self.wmax.max(weight);
    }

    fn remove(&mut self, idx: PoolIdx) -> bool {
        let pos = self.position(idx);
        if pos == 0 {
            return false;
        }
        self.remove_at(pos);
        true
    }

    fn pop(&mut self) -> Option<(PoolIdx, f64)> {
        if self.is_empty() {
            return None;
        }
        Some(self.remove_at(1))
    }

    fn make_room(&mut self, _incoming: f64) -> MakeRoom {
        let max = ((self.capacity as f64 * PRUNE_COUNT_FRACTION) as usize).max(1);
        let mut evicted = Vec::new();
        while self.is_full() {
            let top = self.heap[1].1;
            let threshold = self.wmax - (self.wmax - top) * PRUNE_WEIGHT_FRACTION;
            if self.evict_leaves(threshold, max, &mut evicted) == 0 && threshold >= self.wmax {
                // no leaf reaches the threshold and it cannot move any more
                let worst = (1..=self.len()).max_by(|&a, &b| self.heap[a].1.total_cmp(&self.heap[b].1));
                if let Some(pos) = worst {
                    evicted.push(self.remove_at(pos).0);
                }
            }
            self.wmax = threshold;
        }
        tracing::trace!(evicted = evicted.len(), "Open queue pruned");
        MakeRoom::Evicted(evicted)
    }

    fn grow(&mut self) {
        self.capacity = self.capacity * 2 + 1;
    }

    fn peak(&self) -> usize {
        self.peak
    }

    fn memory_bytes(&self) -> usize {
        (self.capacity + 1) * std::mem::size_of::<(PoolIdx, f64)>() + self.positions.len() * 4
    }
}

/// Total order over weights.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Weight(f64);

impl Eq for Weight {}

impl PartialOrd for Weight {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Weight {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

type TreeKey = (Weight, Reverse<u64>);

/// Balanced-tree queue. Equal weights pop newest first.
#[derive(Debug)]
pub struct TreeQueue {
    tree: BTreeMap<TreeKey, PoolIdx>,
    keys: HashMap<PoolIdx, TreeKey>,
    capacity: usize,
    seq: u64,
    peak: usize,
}

impl TreeQueue {
    pub fn new(size: usize) -> Self {
        Self {
            tree: BTreeMap::new(),
            keys: HashMap::new(),
            capacity: size.max(1),
            seq: 0,
            peak: 0,
        }
    }
}

impl OpenQueue for TreeQueue {
    fn len(&self) -> usize {
        self.tree.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn contains(&self, idx: PoolIdx) -> bool {
        self.keys.contains_key(&idx)
    }

    fn push(&mut self, idx: PoolIdx, weight: f64) {
        self.seq += 1;
        let key = (Weight(weight), Reverse(self.seq));
        if let Some(old) = self.keys.insert(idx, key) {
            self.tree.remove(&old);
        }
        self.tree.insert(key, idx);
        self.peak = self.peak.max(self.tree.len());
    }

    fn update(&mut self, idx: PoolIdx, weight: f64) {
        if self.contains(idx) {
            self.push(idx, weight);
        }
    }

    fn remove(&mut self, idx: PoolIdx) -> bool {
        match self.keys.remove(&idx) {
            Some(key) => {
                self.tree.remove(&key);
                true
            }
            None => false,
        }
    }

    fn pop(&mut self) -> Option<(PoolIdx, f64)> {
        let ((weight, _), idx) = self.tree.pop_first()?;
        self.keys.remove(&idx);
        Some((idx, weight.0))
    }

    fn make_room(&mut self, incoming: f64) -> MakeRoom {
        let mut evicted = Vec::new();
        while self.is_full() {
            let Some(((worst, _), _)) = self.tree.last_key_value() else {
                break;
            };
            if incoming >= worst.0 && evicted.is_empty() {
                return MakeRoom::Rejected;
            }
            if let Some((_, idx)) = self.tree.pop_last() {
                self.keys.remove(&idx);
                evicted.push(idx);
            }
        }
        MakeRoom::Evicted(evicted)
    }

    fn grow(&mut self) {
        self.capacity = self.capacity * 2 + 1;
    }

    fn peak(&self) -> usize {
        self.peak
    }

    fn memory_bytes(&self) -> usize {
        self.tree.len() * (std::mem::size_of::<TreeKey>() + std::mem::size_of::<PoolIdx>()) * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx(raw: u32) -> PoolIdx {
        PoolIdx::from(raw)
    }

    fn drain(queue: &mut dyn OpenQueue) -> Vec<f64> {
        std::iter::from_fn(|| queue.pop().map(|(_, w)| w)).collect()
    }

    #[test]
    fn test_heap_order_and_update() {
        let mut queue = HeapQueue::new(15);
        for (i, w) in [5.0, 3.0, 8.0, 1.0, 9.0, 2.0].into_iter().enumerate() {
            queue.push(idx(i as u32), w);
        }
        queue.update(idx(4), 0.5);
        assert!(queue.remove(idx(2)));
        assert!(!queue.contains(idx(2)));
        assert_eq!(drain(&mut queue), vec![0.5, 1.0, 2.0, 3.0, 5.0]);
        assert_eq!(queue.peak(), 6);
    }

    #[test]
    fn test_heap_capacity_rounding() {
        assert_eq!(HeapQueue::new(10).capacity(), 15);
        assert_eq!(HeapQueue::new(32_767).capacity(), 32_767);
        let mut queue = HeapQueue::new(3);
        queue.grow();
        assert_eq!(queue.capacity(), 7);
    }

    #[test]
    fn test_heap_make_room_evicts_worst() {
        let mut queue = HeapQueue::new(7);
        for i in 0..7 {
            queue.push(idx(i), i as f64);
        }
        assert!(queue.is_full());
        let MakeRoom::Evicted(evicted) = queue.make_room(0.5) else {
            panic!("heap never rejects")
        };
        assert!(!evicted.is_empty());
        assert!(!queue.is_full());
        assert!(evicted.contains(&idx(6)));
        assert!(!evicted.contains(&idx(0)));
        for e in &evicted {
            assert!(!queue.contains(*e));
        }
    }

    #[test]
    fn test_heap_make_room_with_equal_weights() {
        let mut queue = HeapQueue::new(3);
        for i in 0..3 {
            queue.push(idx(i), 1.0);
        }
        assert!(matches!(queue.make_room(1.0), MakeRoom::Evicted(e) if !e.is_empty()));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_tree_order_and_rejection() {
        let mut queue = TreeQueue::new(3);
        queue.push(idx(0), 2.0);
        queue.push(idx(1), 1.0);
        queue.push(idx(2), 3.0);
        assert_eq!(queue.make_room(4.0), MakeRoom::Rejected);
        assert_eq!(queue.make_room(0.5), MakeRoom::Evicted(vec![idx(2)]));
        queue.update(idx(0), 0.1);
        assert_eq!(queue.pop(), Some((idx(0), 0.1)));
        assert_eq!(drain(&mut queue), vec![1.0]);
    }
}
