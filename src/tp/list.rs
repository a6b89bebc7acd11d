use std::collections::{HashMap, VecDeque};

use super::histogram::Histogram;
use super::state::TpState;
use crate::backtrack::BacktrackMemory;
use crate::error::Result;
use crate::memory::{PoolIdx, PoolStats};
use crate::recombine::{HypothesisStore, Outcome};
use crate::types::PushdownStack;

/// Where an expanded hypothesis goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Same frame: epsilon transitions, descending into or leaving a unit.
    Current,
    /// Consumed a frame.
    Next,
    /// Reached a final state of unit 0 with an empty stack.
    Final,
}

/// Active hypotheses of one frame with the queue of those still to expand.
#[derive(Debug)]
pub struct StateList {
    store: HypothesisStore<TpState>,
    pending: VecDeque<PoolIdx>,
    /// Slots waiting in `pending`; survives in-place replacement.
    queued: Vec<bool>,
    wmin: f64,
    pub(crate) histogram: Histogram,
}

impl StateList {
    pub fn new(name: &str, initial: usize, numpaths: u32, stack_sensitive: bool, limit: usize) -> Self {
        Self {
            store: HypothesisStore::new(name, initial, numpaths, stack_sensitive, limit),
            pending: VecDeque::new(),
            queued: Vec::new(),
            wmin: f64::INFINITY,
            histogram: Histogram::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Smallest normalized weight seen since the last clear.
    pub fn wmin(&self) -> f64 {
        self.wmin
    }

    pub fn add(&mut self, s: TpState, backtrack: &BacktrackMemory) -> Result<()> {
        let wn = s.wn;
        let idx = match self.store.add(s, backtrack)? {
            Outcome::Inserted(idx) | Outcome::Improved(idx) => idx,
            Outcome::Discarded => return Ok(()),
        };
        self.wmin = self.wmin.min(wn);
        self.histogram.add(wn);
        let slot = idx.as_usize();
        if slot >= self.queued.len() {
            self.queued.resize(slot + 1, false);
        }
        if !self.queued[slot] {
            self.queued[slot] = true;
            self.pending.push_back(idx);
        }
        Ok(())
    }

    /// Next hypothesis to expand.
    pub fn pop(&mut self) -> Option<PoolIdx> {
        let idx = self.pending.pop_front()?;
        self.queued[idx.as_usize()] = false;
        Some(idx)
    }

    pub fn get(&self, idx: PoolIdx) -> Option<&TpState> {
        self.store.get(idx)
    }

    pub fn get_mut(&mut self, idx: PoolIdx) -> Option<&mut TpState> {
        self.store.get_mut(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TpState> {
        self.store.iter().map(|(_, s)| s)
    }

    /// Drop the pending queue, e.g. after an aborted frame.
    pub fn abandon(&mut self) {
        self.pending.clear();
        self.queued.fill(false);
    }

    pub fn clear(&mut self) {
        self.store.clear();
        self.pending.clear();
        self.queued.fill(false);
        self.wmin = f64::INFINITY;
    }

    pub fn memory_bytes(&self) -> usize {
        self.store.memory_bytes()
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        self.store.stats()
    }
}

/// Private lists of one job.
#[derive(Debug)]
pub struct JobLists {
    pub current: StateList,
    pub next: StateList,
    pub finals: HypothesisStore<TpState>,
    /// Time-invariant search only: best weights per (state, stack) already
    /// expanded, at most `numpaths` each.
    settled: HashMap<(u64, PushdownStack), Vec<f64>>,
    /// Pruning threshold of the running frame on normalized weights;
    /// hypotheses at or above it are dropped.
    pub threshold: f64,
    pub expanded: u64,
}

impl JobLists {
    pub fn new(job: usize, initial: usize, numpaths: u32, stack_sensitive: bool, limit: usize) -> Self {
        Self {
            current: StateList::new(&format!("tp{}.a", job), initial, numpaths, stack_sensitive, limit),
            next: StateList::new(&format!("tp{}.b", job), initial, numpaths, stack_sensitive, limit),
            finals: HypothesisStore::new(&format!("tp{}.final", job), 64, numpaths, stack_sensitive, limit),
            settled: HashMap::new(),
            threshold: f64::INFINITY,
            expanded: 0,
        }
    }

    pub fn deliver(&mut self, s: TpState, target: Target, backtrack: &BacktrackMemory) -> Result<()> {
        match target {
            Target::Current => self.current.add(s, backtrack),
            Target::Next => self.next.add(s, backtrack),
            Target::Final => self.finals.add(s, backtrack).map(|_| ()),
        }
    }

    /// Record an expansion in time-invariant search. Returns false when
    /// `numpaths` hypotheses of the same state and stack at least as good
    /// were already expanded.
    pub fn settle(&mut self, id: u64, stack: PushdownStack, wc: f64, numpaths: u32) -> bool {
        let seen = self.settled.entry((id, stack)).or_default();
        if seen.len() < numpaths as usize {
            seen.push(wc);
            return true;
        }
        match seen.iter_mut().max_by(|a, b| a.total_cmp(b)) {
            Some(worst) if wc < *worst => {
                *worst = wc;
                true
            }
            _ => false,
        }
    }

    /// Current becomes next; the old current is released.
    pub fn swap(&mut self) {
        std::mem::swap(&mut self.current, &mut self.next);
        self.next.clear();
    }

    pub fn clear(&mut self) {
        self.current.clear();
        self.next.clear();
        self.finals.clear();
        self.settled.clear();
        self.threshold = f64::INFINITY;
        self.expanded = 0;
    }

    pub fn memory_bytes(&self) -> usize {
        self.current.memory_bytes() + self.next.memory_bytes() + self.finals.memory_bytes()
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats = self.current.stats();
        stats.extend(self.next.stats());
        stats.extend(self.finals.stats());
        stats
    }
}
