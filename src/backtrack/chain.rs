//! Reference-counted history chains.
//!
//! A chain node records one step of a path (a transition id or an output
//! symbol) and points at its predecessor. Hypotheses share common prefixes;
//! each [`BtRef`] holds one reference and dropping the last reference to a
//! node releases it and, transitively, every ancestor left unreferenced.

use std::sync::Arc;

use crate::constants::backtrack::CHAIN_HASH_ROTATION;
use crate::error::Result;
use crate::memory::{Pool, PoolIdx, PoolStats, SharedPool};

#[derive(Debug, Clone)]
struct BtNode {
    parent: Option<PoolIdx>,
    refs: u32,
    payload: i32,
    /// Rolling hash over the payloads from the root.
    hash: u32,
    /// Path weight before the step.
    weight: f64,
}

/// Node storage shared by all hypotheses of a search.
#[derive(Debug)]
pub struct BtArena {
    pool: SharedPool<BtNode>,
}

impl BtArena {
    pub fn new(name: &str, initial: usize, limit: usize, delay: bool) -> Arc<Self> {
        Arc::new(Self {
            pool: SharedPool::new(Pool::new(name, initial, limit).with_delay(delay)),
        })
    }

    /// Start a chain.
    pub fn root(self: &Arc<Self>, weight: f64) -> Result<BtRef> {
        let idx = self.pool.lock().insert(BtNode {
            parent: None,
            refs: 1,
            payload: -1,
            hash: 0,
            weight,
        })?;
        Ok(BtRef {
            arena: Arc::clone(self),
            idx,
        })
    }

    /// Number of live nodes.
    pub fn live_nodes(&self) -> usize {
        self.pool.lock().len()
    }

    /// Make slots released during the last frame reusable.
    pub fn flush_delayed(&self) {
        self.pool.lock().flush_delayed();
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

/// One counted reference to a chain node.
#[derive(Debug)]
pub struct BtRef {
    arena: Arc<BtArena>,
    idx: PoolIdx,
}

impl BtRef {
    /// Append a step. `weight` is the path weight before the step.
    pub fn extend(&self, payload: i32, weight: f64) -> Result<BtRef> {
        let mut pool = self.arena.pool.lock();
        let parent_hash = {
            let parent = &mut pool[self.idx];
            parent.refs += 1;
            parent.hash
        };
        let inserted = pool.insert(BtNode {
            parent: Some(self.idx),
            refs: 1,
            payload,
            hash: parent_hash.rotate_left(CHAIN_HASH_ROTATION) ^ payload as u32,
            weight,
        });
        match inserted {
            Ok(idx) => Ok(BtRef {
                arena: Arc::clone(&self.arena),
                idx,
            }),
            Err(e) => {
                pool[self.idx].refs -= 1;
                Err(e)
            }
        }
    }

    /// Whether both chains hold the same payload sequence.
    pub fn same_history(&self, other: &BtRef) -> bool {
        if !Arc::ptr_eq(&self.arena, &other.arena) {
            return false;
        }
        let pool = self.arena.pool.lock();
        let (mut a, mut b) = (Some(self.idx), Some(other.idx));
        loop {
            match (a, b) {
                (None, None) => return true,
                (Some(x), Some(y)) => {
                    if x == y {
                        return true;
                    }
                    let (nx, ny) = (&pool[x], &pool[y]);
                    if nx.hash != ny.hash || nx.payload != ny.payload {
                        return false;
                    }
                    a = nx.parent;
                    b = ny.parent;
                }
                _ => return false,
            }
        }
    }

    /// Steps from the newest to the oldest as `(payload, weight before the
    /// step)`. The root is not included.
    pub fn path(&self) -> Vec<(i32, f64)> {
        let pool = self.arena.pool.lock();
        let mut steps = Vec::new();
        let mut cursor = self.idx;
        while let Some(parent) = pool[cursor].parent {
            let node = &pool[cursor];
            steps.push((node.payload, node.weight));
            cursor = parent;
        }
        steps
    }

    /// Payload of the newest step, `None` at the root.
    pub fn payload(&self) -> Option<i32> {
        let pool = self.arena.pool.lock();
        let node = &pool[self.idx];
        node.parent.map(|_| node.payload)
    }
}

impl Clone for BtRef {
    fn clone(&self) -> Self {
        self.arena.pool.lock()[self.idx].refs += 1;
        Self {
            arena: Arc::clone(&self.arena),
            idx: self.idx,
        }
    }
}

impl Drop for BtRef {
    fn drop(&mut self) {
        let mut pool = self.arena.pool.lock();
        let mut cursor = Some(self.idx);
        while let Some(idx) = cursor {
            let node = &mut pool[idx];
            node.refs -= 1;
            if node.refs > 0 {
                break;
            }
            cursor = node.parent;
            pool.release(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> Arc<BtArena> {
        BtArena::new("bt", 16, 1 << 20, false)
    }

    #[test]
    fn test_release_on_drop() {
        let arena = arena();
        {
            let root = arena.root(0.0).unwrap();
            let a = root.extend(1, 0.0).unwrap();
            let b = a.extend(2, 1.0).unwrap();
            drop(root);
            drop(a);
            assert_eq!(arena.live_nodes(), 3);
            let c = b.clone();
            drop(b);
            assert_eq!(c.path(), vec![(2, 1.0), (1, 0.0)]);
        }
        assert_eq!(arena.live_nodes(), 0);
    }

    #[test]
    fn test_shared_prefix_survives() {
        let arena = arena();
        let root = arena.root(0.0).unwrap();
        let a = root.extend(1, 0.0).unwrap();
        let left = a.extend(2, 1.0).unwrap();
        let right = a.extend(3, 1.0).unwrap();
        drop(a);
        drop(root);
        drop(left);
        assert_eq!(arena.live_nodes(), 3);
        assert_eq!(right.path(), vec![(3, 1.0), (1, 0.0)]);
        drop(right);
        assert_eq!(arena.live_nodes(), 0);
    }

    #[test]
    fn test_same_history() {
        let arena = arena();
        let r1 = arena.root(0.0).unwrap();
        let r2 = arena.root(0.0).unwrap();
        let a = r1.extend(5, 0.0).unwrap().extend(6, 1.0).unwrap();
        let b = r2.extend(5, 0.3).unwrap().extend(6, 2.0).unwrap();
        let c = r2.extend(6, 0.3).unwrap().extend(5, 2.0).unwrap();
        assert!(a.same_history(&b));
        assert!(!a.same_history(&c));
        assert!(r1.same_history(&r2));
        assert!(!r1.same_history(&a));
    }
}
