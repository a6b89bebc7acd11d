//! Hypothesis storage with recombination.
//!
//! Both decoders keep their hypotheses in a [`HypothesisStore`]: a pool of
//! hypotheses indexed by a [`VisitedHash`]. Adding a hypothesis whose state id
//! (and stack) is already present recombines: with one path only the better
//! hypothesis survives; with N paths, hypotheses with different output
//! histories coexist up to N per state and a hypothesis with an already
//! present history replaces it only when better.

use crate::backtrack::{BacktrackMemory, History};
use crate::error::Result;
use crate::hash::VisitedHash;
use crate::memory::{Pool, PoolIdx, PoolStats};
use crate::types::PushdownStack;

/// A search hypothesis as seen by the store.
pub trait Hypothesis: Send {
    /// Packed state id.
    fn key(&self) -> u64;
    /// Path weight used for recombination, lower is better.
    fn score(&self) -> f64;
    fn stack(&self) -> &PushdownStack;
    fn history(&self) -> &History;
    fn history_mut(&mut self) -> &mut History;
    fn element(&self) -> Option<PoolIdx>;
    fn set_element(&mut self, element: Option<PoolIdx>);
    /// Already expanded; such hypotheses are never replaced.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Result of [`HypothesisStore::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Stored in a new slot.
    Inserted(PoolIdx),
    /// Replaced a worse hypothesis in place.
    Improved(PoolIdx),
    /// Worse than what is stored; dropped.
    Discarded,
}

/// See the module documentation.
#[derive(Debug)]
pub struct HypothesisStore<S> {
    states: Pool<S>,
    hash: VisitedHash,
    numpaths: u32,
}

impl<S: Hypothesis> HypothesisStore<S> {
    /// # Arguments
    /// * `numpaths` - Hypotheses kept per state id.
    /// * `stack_sensitive` - Keep hypotheses with different stacks apart.
    /// * `limit` - Record limit of the pools.
    pub fn new(name: &str, initial: usize, numpaths: u32, stack_sensitive: bool, limit: usize) -> Self {
        Self {
            states: Pool::new(name, initial, limit),
            hash: VisitedHash::new(name, numpaths, stack_sensitive, limit),
            numpaths: numpaths.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn get(&self, idx: PoolIdx) -> Option<&S> {
        self.states.get(idx)
    }

    pub fn get_mut(&mut self, idx: PoolIdx) -> Option<&mut S> {
        self.states.get_mut(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = (PoolIdx, &S)> {
        self.states.iter()
    }

    pub fn hash(&self) -> &VisitedHash {
        &self.hash
    }

    /// Store `s`, recombining with hypotheses of the same state.
    pub fn add(&mut self, mut s: S, backtrack: &BacktrackMemory) -> Result<Outcome> {
        let element = match self.hash.find(s.key(), s.stack()) {
            Some(e) => e,
            None => {
                let idx = self.states.insert(s)?;
                let key = self.states[idx].key();
                let stack = *self.states[idx].stack();
                let e = match self.hash.insert(key, stack, idx) {
                    Ok(e) => e,
                    Err(err) => {
                        self.states.put(idx);
                        return Err(err);
                    }
                };
                self.states[idx].set_element(Some(e));
                return Ok(Outcome::Inserted(idx));
            }
        };
        if self.hash.is_closed(element) {
            return Ok(Outcome::Discarded);
        }

        let present = self.hash.element(element).states.clone();
        let same = if self.numpaths == 1 {
            present.first().copied()
        } else {
            present
                .iter()
                .copied()
                .find(|&idx| backtrack.same_outputs(self.states[idx].history(), s.history()))
        };

        if let Some(old) = same {
            return self.compete(old, s, backtrack);
        }
        // expanded hypotheses stay listed but are already counted in `done`
        let open = present.iter().filter(|&&idx| !self.states[idx].is_closed()).count();
        if open + (self.hash.element(element).done as usize) < self.numpaths as usize {
            s.set_element(Some(element));
            let idx = self.states.insert(s)?;
            self.hash.attach(element, idx);
            return Ok(Outcome::Inserted(idx));
        }
        let worst = present
            .iter()
            .copied()
            .filter(|&idx| !self.states[idx].is_closed())
            .max_by(|&a, &b| self.states[a].score().total_cmp(&self.states[b].score()));
        match worst {
            Some(w) if s.score() < self.states[w].score() => {
                s.set_element(Some(element));
                self.states[w] = s;
                Ok(Outcome::Improved(w))
            }
            _ => Ok(Outcome::Discarded),
        }
    }

    /// Keep the better of the stored hypothesis `old` and the newcomer.
    fn compete(&mut self, old: PoolIdx, mut s: S, backtrack: &BacktrackMemory) -> Result<Outcome> {
        let stored = &mut self.states[old];
        if stored.is_closed() {
            return Ok(Outcome::Discarded);
        }
        if s.score() < stored.score() {
            let excess = stored.score() - s.score();
            backtrack.recombine(stored.history(), s.history_mut(), excess)?;
            s.set_element(stored.element());
            *stored = s;
            Ok(Outcome::Improved(old))
        } else {
            let excess = s.score() - stored.score();
            backtrack.recombine(s.history(), stored.history_mut(), excess)?;
            Ok(Outcome::Discarded)
        }
    }

    /// Remove a hypothesis that was never expanded.
    pub fn evict(&mut self, idx: PoolIdx) -> Option<S> {
        let s = self.states.put(idx)?;
        if let Some(e) = s.element() {
            self.hash.detach(e, idx);
        }
        Some(s)
    }

    /// Count an expansion of `idx`; a pruned `idx` closes its state id at
    /// once. When the state id is closed, the hypotheses it still holds
    /// (including `idx`) are returned for removal.
    pub fn finalize(&mut self, idx: PoolIdx, expanded: bool) -> Option<Vec<PoolIdx>> {
        let e = self.states.get(idx)?.element()?;
        self.hash.finalize(e, expanded)
    }

    /// Drop a hypothesis without touching the hash.
    pub fn free(&mut self, idx: PoolIdx) -> Option<S> {
        self.states.put(idx)
    }

    /// Drop all hypotheses.
    pub fn clear(&mut self) {
        self.states.clear();
        self.hash.clear();
    }

    pub fn memory_bytes(&self) -> usize {
        self.states.memory_bytes() + self.hash.memory_bytes()
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        vec![self.states.stats(), self.hash.stats()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BacktrackMode;
    use crate::fst::FstTransition;

    #[derive(Debug)]
    struct Hyp {
        key: u64,
        score: f64,
        stack: PushdownStack,
        history: History,
        element: Option<PoolIdx>,
        closed: bool,
    }

    impl Hypothesis for Hyp {
        fn key(&self) -> u64 {
            self.key
        }
        fn score(&self) -> f64 {
            self.score
        }
        fn stack(&self) -> &PushdownStack {
            &self.stack
        }
        fn history(&self) -> &History {
            &self.history
        }
        fn history_mut(&mut self) -> &mut History {
            &mut self.history
        }
        fn element(&self) -> Option<PoolIdx> {
            self.element
        }
        fn set_element(&mut self, element: Option<PoolIdx>) {
            self.element = element;
        }
        fn is_closed(&self) -> bool {
            self.closed
        }
    }

    fn hyp(memory: &BacktrackMemory, key: u64, score: f64, output: i32) -> Hyp {
        let root = memory.root(0.0).unwrap();
        let t = FstTransition {
            id: output as u32,
            ini: 0,
            ter: 1,
            input: -1,
            output,
            stack: 0,
            weight: 0.0,
        };
        Hyp {
            key,
            score,
            stack: PushdownStack::new(),
            history: memory.extend(&root, Some(&t), true, 0.0).unwrap(),
            element: None,
            closed: false,
        }
    }

    #[test]
    fn test_single_path_keeps_best() {
        let memory = BacktrackMemory::new(BacktrackMode::Outputs, 1, false, 1 << 20, 0.0).unwrap();
        let mut store = HypothesisStore::new("s", 16, 1, true, 1 << 20);
        let first = store.add(hyp(&memory, 1, 5.0, 1), &memory).unwrap();
        let Outcome::Inserted(idx) = first else { panic!("expected insert") };
        assert_eq!(store.add(hyp(&memory, 1, 6.0, 2), &memory).unwrap(), Outcome::Discarded);
        assert_eq!(store.add(hyp(&memory, 1, 4.0, 3), &memory).unwrap(), Outcome::Improved(idx));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(idx).unwrap().score, 4.0);
        drop(store);
        assert_eq!(memory.live_nodes(), 0);
    }

    #[test]
    fn test_nbest_keeps_distinct_histories() {
        let memory = BacktrackMemory::new(BacktrackMode::Outputs, 2, false, 1 << 20, 0.0).unwrap();
        let mut store = HypothesisStore::new("s", 16, 2, true, 1 << 20);
        assert!(matches!(store.add(hyp(&memory, 1, 5.0, 1), &memory).unwrap(), Outcome::Inserted(_)));
        assert!(matches!(store.add(hyp(&memory, 1, 6.0, 2), &memory).unwrap(), Outcome::Inserted(_)));
        // same history as the first, worse
        assert_eq!(store.add(hyp(&memory, 1, 7.0, 1), &memory).unwrap(), Outcome::Discarded);
        // third history replaces the worst
        assert!(matches!(store.add(hyp(&memory, 1, 5.5, 3), &memory).unwrap(), Outcome::Improved(_)));
        assert_eq!(store.add(hyp(&memory, 1, 9.0, 4), &memory).unwrap(), Outcome::Discarded);
        assert_eq!(store.len(), 2);
        let mut scores: Vec<f64> = store.iter().map(|(_, s)| s.score).collect();
        scores.sort_by(f64::total_cmp);
        assert_eq!(scores, vec![5.0, 5.5]);
    }

    #[test]
    fn test_finalize_closes_state() {
        let memory = BacktrackMemory::new(BacktrackMode::Outputs, 1, false, 1 << 20, 0.0).unwrap();
        let mut store = HypothesisStore::new("s", 16, 1, true, 1 << 20);
        let Outcome::Inserted(idx) = store.add(hyp(&memory, 3, 1.0, 1), &memory).unwrap() else {
            panic!("expected insert")
        };
        let rest = store.finalize(idx, true).unwrap();
        assert_eq!(rest, vec![idx]);
        store.free(idx);
        assert_eq!(store.add(hyp(&memory, 3, 0.5, 1), &memory).unwrap(), Outcome::Discarded);
    }

    #[test]
    fn test_evict_removes_element() {
        let memory = BacktrackMemory::new(BacktrackMode::Outputs, 1, false, 1 << 20, 0.0).unwrap();
        let mut store = HypothesisStore::new("s", 16, 1, true, 1 << 20);
        let Outcome::Inserted(idx) = store.add(hyp(&memory, 3, 1.0, 1), &memory).unwrap() else {
            panic!("expected insert")
        };
        store.evict(idx);
        assert!(store.hash().is_empty());
        assert!(matches!(store.add(hyp(&memory, 3, 2.0, 1), &memory).unwrap(), Outcome::Inserted(_)));
    }

    #[test]
    fn test_expanded_history_leaves_room_for_another() {
        let memory = BacktrackMemory::new(BacktrackMode::Outputs, 2, false, 1 << 20, 0.0).unwrap();
        let mut store = HypothesisStore::new("s", 16, 2, true, 1 << 20);
        let Outcome::Inserted(first) = store.add(hyp(&memory, 1, 1.0, 1), &memory).unwrap() else {
            panic!("expected insert")
        };
        store.get_mut(first).unwrap().closed = true;
        assert!(store.finalize(first, true).is_none());

        // one slot expanded, one still free
        let second = store.add(hyp(&memory, 1, 3.0, 2), &memory).unwrap();
        let Outcome::Inserted(second) = second else { panic!("expected insert, got {:?}", second) };
        assert_ne!(first, second);
        assert_eq!(store.hash().element(store.get(second).unwrap().element.unwrap()).states.len(), 2);

        // both slots taken now
        assert_eq!(store.add(hyp(&memory, 1, 4.0, 3), &memory).unwrap(), Outcome::Discarded);
        assert!(matches!(store.add(hyp(&memory, 1, 2.0, 4), &memory).unwrap(), Outcome::Improved(i) if i == second));
        assert_eq!(store.finalize(second, true).map(|rest| rest.len()), Some(2));
    }

    #[test]
    fn test_pruned_hypothesis_closes_state() {
        let memory = BacktrackMemory::new(BacktrackMode::Outputs, 2, false, 1 << 20, 0.0).unwrap();
        let mut store = HypothesisStore::new("s", 16, 2, true, 1 << 20);
        let Outcome::Inserted(first) = store.add(hyp(&memory, 1, 1.0, 1), &memory).unwrap() else {
            panic!("expected insert")
        };
        let Outcome::Inserted(second) = store.add(hyp(&memory, 1, 2.0, 2), &memory).unwrap() else {
            panic!("expected insert")
        };
        let mut rest = store.finalize(first, false).unwrap();
        rest.sort_by_key(|idx| idx.get());
        let mut both = vec![first, second];
        both.sort_by_key(|idx| idx.get());
        assert_eq!(rest, both);
        for idx in rest {
            store.free(idx);
        }
        assert_eq!(store.add(hyp(&memory, 1, 0.5, 3), &memory).unwrap(), Outcome::Discarded);
    }
}
