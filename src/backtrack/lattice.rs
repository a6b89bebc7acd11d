//! Recombination lattice and its determinization.
//!
//! During search every output symbol creates a node pointing at the
//! predecessor node. When two hypotheses recombine, the winner continues from
//! a join node that keeps both the winner's node (weight 0) and the loser's
//! node (weight = the loser's excess). Backtracking determinizes the reversed
//! lattice from the final hypotheses towards the head, so every path within
//! the pruning threshold survives exactly once.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::constants::memory::LATTICE_INITIAL;
use crate::error::Result;
use crate::fst::{Transition, Unit};
use crate::memory::{Pool, PoolIdx, PoolStats};

#[derive(Debug, Clone)]
struct LatNode {
    parent: Option<PoolIdx>,
    join: Option<PoolIdx>,
    output: i32,
    weight: f64,
}

/// Lattice of one search.
#[derive(Debug)]
pub struct Lattice {
    pool: Mutex<Pool<LatNode>>,
    head: PoolIdx,
    prune: f64,
}

type Residual = Vec<(PoolIdx, f64)>;

fn residual_key(residual: &Residual) -> Vec<(u32, u64)> {
    residual.iter().map(|(n, w)| (n.get(), w.to_bits())).collect()
}

impl Lattice {
    /// `prune` drops recombined paths whose excess weight is above it; zero
    /// keeps every path.
    pub fn new(limit: usize, prune: f64) -> Result<Self> {
        let mut pool = Pool::new("lattice", LATTICE_INITIAL, limit);
        let head = pool.insert(LatNode {
            parent: None,
            join: None,
            output: -1,
            weight: 0.0,
        })?;
        Ok(Self {
            pool: Mutex::new(pool),
            head,
            prune,
        })
    }

    pub fn head(&self) -> PoolIdx {
        self.head
    }

    /// Node after emitting `output` from `from`. Epsilon outputs stay on `from`.
    pub fn gen(&self, from: PoolIdx, output: i32) -> Result<PoolIdx> {
        if output < 0 {
            return Ok(from);
        }
        self.pool.lock().insert(LatNode {
            parent: Some(from),
            join: None,
            output,
            weight: 0.0,
        })
    }

    /// Node the winner of a recombination continues from.
    pub fn join(&self, loser: PoolIdx, winner: PoolIdx, excess: f64) -> Result<PoolIdx> {
        if loser == winner || (self.prune > 0.0 && excess > self.prune) {
            return Ok(winner);
        }
        self.pool.lock().insert(LatNode {
            parent: Some(winner),
            join: Some(loser),
            output: -1,
            weight: excess,
        })
    }

    pub fn len(&self) -> usize {
        self.pool.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.lock().stats()
    }

    /// Determinize the lattice below the given end nodes into one unit.
    ///
    /// State 0 is the head, state 1 the single final state.
    pub fn determinize(&self, ends: &[(PoolIdx, f64)], name: &str) -> Result<Unit> {
        let pool = self.pool.lock();
        let mut unit = Unit::new(name, 2);
        unit.finals = vec![1];
        unit.weight = ends.iter().map(|e| e.1).reduce(f64::min);
        if ends.is_empty() {
            return Ok(unit);
        }

        let mut states: HashMap<Vec<(u32, u64)>, u32> = HashMap::new();
        states.insert(residual_key(&vec![(self.head, 0.0)]), 0);
        let mut stack: Vec<(u32, Residual)> = vec![(1, ends.to_vec())];

        while let Some((state, residual)) = stack.pop() {
            let mut best: HashMap<PoolIdx, f64> = HashMap::new();
            let mut groups: BTreeMap<i32, BTreeMap<PoolIdx, f64>> = BTreeMap::new();
            let mut work = residual;
            while let Some((n, w)) = work.pop() {
                if best.get(&n).is_some_and(|&seen| seen <= w) {
                    continue;
                }
                best.insert(n, w);
                let node = &pool[n];
                let (output, next) = match (node.parent, node.join) {
                    (Some(parent), Some(join)) => {
                        work.push((parent, w));
                        work.push((join, w + node.weight));
                        continue;
                    }
                    (Some(parent), None) => (node.output, parent),
                    (None, _) => (-1, n),
                };
                let slot = groups.entry(output).or_default().entry(next).or_insert(f64::INFINITY);
                *slot = slot.min(w);
            }

            for (output, members) in groups {
                let min = members.values().copied().fold(f64::INFINITY, f64::min);
                let normalized: Residual = members.into_iter().map(|(n, w)| (n, w - min)).collect();
                let key = residual_key(&normalized);
                let target = match states.get(&key) {
                    Some(&s) => s,
                    None => {
                        let s = unit.states;
                        unit.states += 1;
                        states.insert(key, s);
                        stack.push((s, normalized));
                        s
                    }
                };
                unit.transitions.push(Transition::new(target, state, -1, output, min));
            }
        }
        debug!(states = unit.states, transitions = unit.transitions.len(), "Lattice determinized");
        Ok(unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Cheapest weight from state 0 to a final state of an acyclic unit.
    fn shortest(unit: &Unit) -> f64 {
        let mut dist = vec![f64::INFINITY; unit.states as usize];
        dist[0] = 0.0;
        for _ in 0..unit.states {
            for t in &unit.transitions {
                let w = dist[t.ini as usize] + t.weight;
                if w < dist[t.ter as usize] {
                    dist[t.ter as usize] = w;
                }
            }
        }
        unit.finals.iter().map(|&f| dist[f as usize]).fold(f64::INFINITY, f64::min)
    }

    #[test]
    fn test_single_path() {
        let lat = Lattice::new(1 << 20, 0.0).unwrap();
        let a = lat.gen(lat.head(), 7).unwrap();
        let b = lat.gen(a, 8).unwrap();
        let unit = lat.determinize(&[(b, 3.0)], "lattice").unwrap();
        assert_eq!(unit.states, 3);
        assert!((shortest(&unit) - 3.0).abs() < 1e-12);
        let mut outputs: Vec<i32> = unit.transitions.iter().map(|t| t.output).filter(|&o| o >= 0).collect();
        outputs.sort();
        assert_eq!(outputs, vec![7, 8]);
    }

    #[test]
    fn test_join_keeps_both_paths() {
        let lat = Lattice::new(1 << 20, 0.0).unwrap();
        let a = lat.gen(lat.head(), 1).unwrap();
        let b = lat.gen(lat.head(), 2).unwrap();
        let joined = lat.join(b, a, 0.5).unwrap();
        let end = lat.gen(joined, 3).unwrap();
        let unit = lat.determinize(&[(end, 2.0)], "lattice").unwrap();
        assert!((shortest(&unit) - 2.0).abs() < 1e-12);
        // two branches for symbols 1 and 2 before the shared 3
        let first: Vec<&Transition> = unit.transitions.iter().filter(|t| t.output == 1 || t.output == 2).collect();
        assert_eq!(first.len(), 2);
        let excess: f64 = first.iter().map(|t| t.weight).fold(0.0, f64::max)
            - first.iter().map(|t| t.weight).fold(f64::INFINITY, f64::min);
        assert!((excess - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_prune_drops_join() {
        let lat = Lattice::new(1 << 20, 0.1).unwrap();
        let a = lat.gen(lat.head(), 1).unwrap();
        let b = lat.gen(lat.head(), 2).unwrap();
        assert_eq!(lat.join(b, a, 0.5).unwrap(), a);
        assert_ne!(lat.join(b, a, 0.05).unwrap(), a);
    }
}
