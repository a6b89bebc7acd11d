//! Path histories of search hypotheses.
//!
//! One of three representations is active per search:
//! * transition chains record every transition id (needs the source
//!   transducer when emitting),
//! * output chains record output symbols only,
//! * the lattice records outputs plus every recombination.
//!
//! Output chains are also kept whenever more than one path is searched, since
//! N-best recombination compares output histories.

mod chain;
mod emit;
mod lattice;

use std::sync::Arc;

pub use chain::{BtArena, BtRef};
pub use emit::{PathStep, PathWriter};
pub use lattice::Lattice;

use crate::config::BacktrackMode;
use crate::constants::memory::BACKTRACK_INITIAL;
use crate::error::Result;
use crate::fst::FstTransition;
use crate::memory::{PoolIdx, PoolStats};

/// History handles of one hypothesis.
#[derive(Debug, Clone, Default)]
pub struct History {
    pub transitions: Option<BtRef>,
    pub outputs: Option<BtRef>,
    pub lattice: Option<PoolIdx>,
}

impl History {
    /// Release the transition chain, keeping what recombination still needs.
    pub fn trim(&mut self, keep_outputs: bool) {
        self.transitions = None;
        if !keep_outputs {
            self.outputs = None;
        }
    }
}

/// Backtrack storage of one search.
#[derive(Debug)]
pub struct BacktrackMemory {
    mode: BacktrackMode,
    transitions: Option<Arc<BtArena>>,
    outputs: Option<Arc<BtArena>>,
    lattice: Option<Lattice>,
}

impl BacktrackMemory {
    /// # Arguments
    /// * `delay` - Park released output nodes until the end of the frame.
    /// * `limit` - Node limit per pool.
    pub fn new(mode: BacktrackMode, numpaths: u32, delay: bool, limit: usize, lattice_prune: f64) -> Result<Self> {
        let transitions = (mode == BacktrackMode::Transitions)
            .then(|| BtArena::new("bt.transitions", BACKTRACK_INITIAL, limit, false));
        let outputs = (mode == BacktrackMode::Outputs || numpaths > 1)
            .then(|| BtArena::new("bt.outputs", BACKTRACK_INITIAL, limit, delay));
        let lattice = match mode {
            BacktrackMode::Lattice => Some(Lattice::new(limit, lattice_prune)?),
            _ => None,
        };
        Ok(Self {
            mode,
            transitions,
            outputs,
            lattice,
        })
    }

    pub fn mode(&self) -> BacktrackMode {
        self.mode
    }

    pub fn lattice(&self) -> Option<&Lattice> {
        self.lattice.as_ref()
    }

    /// History of an initial hypothesis with path weight `weight`.
    pub fn root(&self, weight: f64) -> Result<History> {
        Ok(History {
            transitions: self.transitions.as_ref().map(|a| a.root(weight)).transpose()?,
            outputs: self.outputs.as_ref().map(|a| a.root(weight)).transpose()?,
            lattice: self.lattice.as_ref().map(Lattice::head),
        })
    }

    /// History after taking `t` from a hypothesis of weight `weight`.
    ///
    /// `None` continues without a transition (leaving a sub-unit). Outputs
    /// only count when `top` is set, i.e. for transitions of the top unit.
    pub fn extend(&self, from: &History, t: Option<&FstTransition>, top: bool, weight: f64) -> Result<History> {
        let output = match t {
            Some(t) if top && t.output >= 0 => Some(t.output),
            _ => None,
        };
        let transitions = match (&from.transitions, t) {
            (Some(parent), Some(t)) => Some(parent.extend(t.id as i32, weight)?),
            (parent, _) => parent.clone(),
        };
        let outputs = match (&from.outputs, output) {
            (Some(parent), Some(o)) => Some(parent.extend(o, weight)?),
            (parent, _) => parent.clone(),
        };
        let lattice = match (&self.lattice, from.lattice, output) {
            (Some(lat), Some(node), Some(o)) => Some(lat.gen(node, o)?),
            (_, node, _) => node,
        };
        Ok(History {
            transitions,
            outputs,
            lattice,
        })
    }

    /// Record that `loser` recombined into `winner` with `excess` extra
    /// weight. Only the lattice keeps the loser; chains are released when the
    /// loser is dropped.
    pub fn recombine(&self, loser: &History, winner: &mut History, excess: f64) -> Result<()> {
        if let (Some(lat), Some(l), Some(w)) = (&self.lattice, loser.lattice, winner.lattice) {
            winner.lattice = Some(lat.join(l, w, excess)?);
        }
        Ok(())
    }

    /// Whether both histories emitted the same outputs.
    pub fn same_outputs(&self, a: &History, b: &History) -> bool {
        match (&a.outputs, &b.outputs) {
            (Some(x), Some(y)) => x.same_history(y),
            _ => true,
        }
    }

    /// End of frame: make delayed node slots reusable.
    pub fn flush_delayed(&self) {
        if let Some(outputs) = &self.outputs {
            outputs.flush_delayed();
        }
    }

    /// Live chain nodes over both arenas.
    pub fn live_nodes(&self) -> usize {
        self.transitions.as_ref().map_or(0, |a| a.live_nodes())
            + self.outputs.as_ref().map_or(0, |a| a.live_nodes())
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats = Vec::new();
        if let Some(a) = &self.transitions {
            stats.push(a.stats());
        }
        if let Some(a) = &self.outputs {
            stats.push(a.stats());
        }
        if let Some(l) = &self.lattice {
            stats.push(l.stats());
        }
        stats
    }

    pub fn memory_bytes(&self) -> usize {
        self.stats().iter().map(|s| s.memory_bytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transition(id: u32, output: i32) -> FstTransition {
        FstTransition {
            id,
            ini: 0,
            ter: 1,
            input: 0,
            output,
            stack: 0,
            weight: 1.0,
        }
    }

    #[test]
    fn test_extend_outputs_only_on_top() {
        let memory = BacktrackMemory::new(BacktrackMode::Outputs, 1, false, 1 << 20, 0.0).unwrap();
        let root = memory.root(0.0).unwrap();
        assert!(root.transitions.is_none());
        let a = memory.extend(&root, Some(&transition(0, 5)), true, 0.0).unwrap();
        let b = memory.extend(&a, Some(&transition(1, 6)), false, 1.0).unwrap();
        let c = memory.extend(&b, Some(&transition(2, -1)), true, 2.0).unwrap();
        assert_eq!(c.outputs.as_ref().unwrap().path(), vec![(5, 0.0)]);
        drop((root, a, b, c));
        assert_eq!(memory.live_nodes(), 0);
    }

    #[test]
    fn test_transition_mode_records_ids() {
        let memory = BacktrackMemory::new(BacktrackMode::Transitions, 1, false, 1 << 20, 0.0).unwrap();
        let root = memory.root(0.0).unwrap();
        let a = memory.extend(&root, Some(&transition(3, -1)), true, 0.0).unwrap();
        let b = memory.extend(&a, None, true, 1.0).unwrap();
        assert_eq!(b.transitions.as_ref().unwrap().path(), vec![(3, 0.0)]);
        assert!(b.outputs.is_none());
    }

    #[test]
    fn test_same_outputs_for_nbest() {
        let memory = BacktrackMemory::new(BacktrackMode::Transitions, 2, false, 1 << 20, 0.0).unwrap();
        let root = memory.root(0.0).unwrap();
        let a = memory.extend(&root, Some(&transition(0, 5)), true, 0.0).unwrap();
        let b = memory.extend(&root, Some(&transition(1, 5)), true, 0.0).unwrap();
        let c = memory.extend(&root, Some(&transition(2, 6)), true, 0.0).unwrap();
        assert!(memory.same_outputs(&a, &b));
        assert!(!memory.same_outputs(&a, &c));
    }

    #[test]
    fn test_recombine_joins_lattice() {
        let memory = BacktrackMemory::new(BacktrackMode::Lattice, 1, false, 1 << 20, 0.0).unwrap();
        let root = memory.root(0.0).unwrap();
        let a = memory.extend(&root, Some(&transition(0, 1)), true, 0.0).unwrap();
        let mut b = memory.extend(&root, Some(&transition(1, 2)), true, 0.0).unwrap();
        let before = b.lattice;
        memory.recombine(&a, &mut b, 0.5).unwrap();
        assert_ne!(b.lattice, before);
        assert_eq!(memory.lattice().unwrap().len(), 4);
    }
}
