//! Growable slab pool with handle addressing and delayed release.

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::ops::{Index, IndexMut};

use crate::error::{Result, SearchError};

/// Handle of a record inside a [`Pool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolIdx(u32);

impl PoolIdx {
    /// Raw slot number.
    pub fn get(self) -> u32 {
        self.0
    }

    /// Slot number usable as a vector index.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for PoolIdx {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub used: usize,
    pub used_max: usize,
    pub capacity: usize,
    pub delayed: usize,
    pub memory_bytes: usize,
}

/// A typed slab allocator.
///
/// The pool starts with room for `initial` records. When it runs full it grows
/// by its current growth step; after the fourth growth the step doubles, so
/// growth is amortized exponential. Growing past `limit` records fails with
/// [`SearchError::OutOfMemory`].
///
/// Released slots are reused LIFO. With `delay` enabled, [`Pool::release`]
/// parks the slot until [`Pool::flush_delayed`] so a slot freed during a frame
/// is not handed out again before the frame ends.
#[derive(Debug)]
pub struct Pool<T> {
    name: String,
    slots: Vec<Option<T>>,
    free: Vec<u32>,
    delayed: Vec<u32>,
    capacity: usize,
    grow_by: usize,
    growths: u32,
    limit: usize,
    used: usize,
    used_max: usize,
    delay: bool,
}

impl<T> Pool<T> {
    /// Create a pool.
    ///
    /// # Arguments
    /// * `name` - Label used in error messages and statistics.
    /// * `initial` - Number of records the pool may hold before growing.
    /// * `limit` - Hard record limit.
    pub fn new(name: impl Into<String>, initial: usize, limit: usize) -> Self {
        let initial = initial.clamp(1, limit.max(1));
        Self {
            name: name.into(),
            slots: Vec::new(),
            free: Vec::new(),
            delayed: Vec::new(),
            capacity: initial,
            grow_by: initial,
            growths: 0,
            limit: limit.max(1),
            used: 0,
            used_max: 0,
            delay: false,
        }
    }

    /// Enable or disable delayed release.
    pub fn with_delay(mut self, delay: bool) -> Self {
        self.delay = delay;
        self
    }

    /// Pool label.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.used
    }

    /// Whether no record is live.
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Highest number of simultaneously live records.
    pub fn used_max(&self) -> usize {
        self.used_max
    }

    fn grow(&mut self) -> Result<()> {
        if self.capacity >= self.limit {
            return Err(SearchError::OutOfMemory(format!("{}: out of memory", self.name)));
        }
        self.growths += 1;
        if self.growths > 4 {
            self.grow_by *= 2;
        }
        self.capacity = (self.capacity + self.grow_by).min(self.limit);
        self.slots.reserve(self.capacity - self.slots.len());
        Ok(())
    }

    /// Store a record and return its handle.
    pub fn insert(&mut self, value: T) -> Result<PoolIdx> {
        let idx = match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize] = Some(value);
                slot
            }
            None => {
                if self.slots.len() >= self.capacity {
                    self.grow()?;
                }
                self.slots.push(Some(value));
                (self.slots.len() - 1) as u32
            }
        };
        self.used += 1;
        self.used_max = self.used_max.max(self.used);
        Ok(PoolIdx(idx))
    }

    /// Look up a live record.
    pub fn get(&self, idx: PoolIdx) -> Option<&T> {
        self.slots.get(idx.as_usize()).and_then(Option::as_ref)
    }

    /// Look up a live record mutably.
    pub fn get_mut(&mut self, idx: PoolIdx) -> Option<&mut T> {
        self.slots.get_mut(idx.as_usize()).and_then(Option::as_mut)
    }

    fn take(&mut self, idx: PoolIdx) -> Option<T> {
        let value = self.slots.get_mut(idx.as_usize()).and_then(Option::take)?;
        self.used -= 1;
        Some(value)
    }

    /// Remove a record and make its slot reusable at once.
    pub fn put(&mut self, idx: PoolIdx) -> Option<T> {
        let value = self.take(idx)?;
        self.free.push(idx.0);
        Some(value)
    }

    /// Remove a record but keep its slot parked until the next flush.
    pub fn put_delayed(&mut self, idx: PoolIdx) -> Option<T> {
        let value = self.take(idx)?;
        self.delayed.push(idx.0);
        Some(value)
    }

    /// Remove a record, honouring the pool's delay setting.
    pub fn release(&mut self, idx: PoolIdx) -> Option<T> {
        if self.delay {
            self.put_delayed(idx)
        } else {
            self.put(idx)
        }
    }

    /// Return all parked slots to the free list.
    pub fn flush_delayed(&mut self) {
        self.free.append(&mut self.delayed);
    }

    /// Drop every record. Capacity is kept.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.delayed.clear();
        self.used = 0;
    }

    /// Iterate over live records.
    pub fn iter(&self) -> impl Iterator<Item = (PoolIdx, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|v| (PoolIdx(i as u32), v)))
    }

    /// Handles of all live records.
    pub fn handles(&self) -> Vec<PoolIdx> {
        self.iter().map(|(idx, _)| idx).collect()
    }

    /// Bytes reserved for records.
    pub fn memory_bytes(&self) -> usize {
        self.capacity * std::mem::size_of::<Option<T>>()
    }

    /// Current statistics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            name: self.name.clone(),
            used: self.used,
            used_max: self.used_max,
            capacity: self.capacity,
            delayed: self.delayed.len(),
            memory_bytes: self.memory_bytes(),
        }
    }
}

#[cold]
fn stale(name: &str, idx: PoolIdx) -> ! {
    panic!("{}: stale handle {}", name, idx.0)
}

impl<T> Index<PoolIdx> for Pool<T> {
    type Output = T;

    fn index(&self, idx: PoolIdx) -> &T {
        match self.get(idx) {
            Some(value) => value,
            None => stale(&self.name, idx),
        }
    }
}

impl<T> IndexMut<PoolIdx> for Pool<T> {
    fn index_mut(&mut self, idx: PoolIdx) -> &mut T {
        let Self { slots, name, .. } = self;
        match slots.get_mut(idx.as_usize()).and_then(Option::as_mut) {
            Some(value) => value,
            None => stale(name, idx),
        }
    }
}

/// A [`Pool`] behind a mutex, for pools written from several worker threads.
#[derive(Debug)]
pub struct SharedPool<T> {
    inner: Mutex<Pool<T>>,
}

impl<T> SharedPool<T> {
    /// Wrap a pool.
    pub fn new(pool: Pool<T>) -> Self {
        Self {
            inner: Mutex::new(pool),
        }
    }

    /// Lock the pool for a short critical section.
    pub fn lock(&self) -> MutexGuard<'_, Pool<T>> {
        self.inner.lock()
    }

    /// Current statistics.
    pub fn stats(&self) -> PoolStats {
        self.inner.lock().stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_put() {
        let mut pool = Pool::new("test", 4, 100);
        let a = pool.insert(1u32).unwrap();
        let b = pool.insert(2u32).unwrap();
        assert_eq!(pool[a], 1);
        assert_eq!(pool[b], 2);
        assert_eq!(pool.put(a), Some(1));
        assert_eq!(pool.len(), 1);
        // freed slot is reused
        let c = pool.insert(3u32).unwrap();
        assert_eq!(c, a);
        assert!(pool.put(PoolIdx(99)).is_none());
    }

    #[test]
    fn test_index_mut_updates_in_place() {
        let mut pool = Pool::new("test", 4, 100);
        let a = pool.insert(String::from("a")).unwrap();
        pool[a].push('b');
        assert_eq!(pool[a], "ab");
    }

    #[test]
    #[should_panic(expected = "test: stale handle")]
    fn test_index_mut_stale_handle_panics() {
        let mut pool = Pool::new("test", 4, 100);
        let a = pool.insert(1u32).unwrap();
        pool.put(a);
        pool[a] = 2;
    }

    #[test]
    fn test_used_max_tracks_high_water_mark() {
        let mut pool = Pool::new("churn", 2, 1000);
        for _ in 0..50 {
            let held: Vec<_> = (0..3).map(|i| pool.insert(i).unwrap()).collect();
            for idx in held {
                pool.put(idx);
            }
        }
        assert_eq!(pool.len(), 0);
        assert_eq!(pool.used_max(), 3);
    }

    #[test]
    fn test_growth_limit() {
        let mut pool = Pool::new("small", 2, 5);
        for i in 0..5 {
            pool.insert(i).unwrap();
        }
        let err = pool.insert(5).unwrap_err();
        assert!(matches!(err, SearchError::OutOfMemory(_)));
        assert!(err.to_string().contains("small: out of memory"));
    }

    #[test]
    fn test_growth_doubles_after_fourth_step() {
        let mut pool = Pool::new("grow", 1, usize::MAX);
        for i in 0..6 {
            pool.insert(i).unwrap();
        }
        // 1 -> 2 -> 3 -> 4 -> 5 -> 7
        assert_eq!(pool.stats().capacity, 7);
    }

    #[test]
    fn test_delayed_release() {
        let mut pool = Pool::new("delay", 4, 100).with_delay(true);
        let a = pool.insert("a").unwrap();
        pool.release(a);
        let b = pool.insert("b").unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.stats().delayed, 1);
        pool.flush_delayed();
        pool.release(b);
        pool.flush_delayed();
        let c = pool.insert("c").unwrap();
        assert!(c == a || c == b);
    }

    #[test]
    fn test_shared_pool() {
        let shared = SharedPool::new(Pool::new("shared", 4, 16));
        let idx = shared.lock().insert(7u64).unwrap();
        assert_eq!(shared.lock()[idx], 7);
        assert_eq!(shared.stats().used, 1);
    }
}
