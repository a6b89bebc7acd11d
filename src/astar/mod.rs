//! Best-first A* decoder.
//!
//! Hypotheses are identified by `(frame, state, stack)`. The open queue holds
//! every hypothesis not yet expanded; the visited hash closes a state id once
//! `numpaths` of its hypotheses were expanded. The search stops when the
//! queue runs empty or `numpaths` final hypotheses were popped.
//!
//! A final hypothesis needs an exhausted weight matrix and an empty stack.
//! Without weights (time-invariant search) every transition is free of
//! weight rows and any final state ends a path.

mod queue;
mod state;

pub use queue::{HeapQueue, MakeRoom, OpenQueue, TreeQueue};
pub use state::AstarState;

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::backtrack::{BacktrackMemory, History, PathWriter};
use crate::config::{Heuristic, QueueKind, SearchConfig, WeightHeuristic};
use crate::constants::memory::STATE_INITIAL;
use crate::error::{Result, SearchError};
use crate::fst::{FstModel, Transducer};
use crate::memory::{PoolIdx, PoolStats};
use crate::recombine::{HypothesisStore, Outcome};
use crate::types::PushdownStack;
use crate::weights::Weights;

/// A* decoder over a single unit.
pub struct AstarDecoder {
    model: Arc<FstModel>,
    config: SearchConfig,
    backtrack: BacktrackMemory,
    store: HypothesisStore<AstarState>,
    queue: Box<dyn OpenQueue>,
    results: Vec<(f64, History)>,
    expanded: u64,
    finished: bool,
}

impl AstarDecoder {
    pub fn new(model: Arc<FstModel>, config: &SearchConfig) -> Result<Self> {
        if model.composed() {
            return Err(SearchError::Config(
                "on-the-fly composition only possible with tp".to_string(),
            ));
        }
        if model.units().iter().any(|u| u.sub) {
            return Err(SearchError::Config("sub units only possible with tp".to_string()));
        }
        if config.astar.heuristic == Heuristic::Potential && !model.is_pushed() {
            return Err(SearchError::Internal("potential heuristic needs pushed weights".to_string()));
        }
        let limit = config.memory.max_elements;
        let size = config.astar_queue_size();
        let queue: Box<dyn OpenQueue> = match config.astar.queue {
            QueueKind::Heap => Box::new(HeapQueue::new(size)),
            QueueKind::Tree => Box::new(TreeQueue::new(size)),
        };
        Ok(Self {
            backtrack: BacktrackMemory::new(config.backtrack, config.numpaths, false, limit, config.lattice_prune)?,
            store: HypothesisStore::new("astar", STATE_INITIAL, config.numpaths, !config.stack_prune, limit),
            queue,
            model,
            config: config.clone(),
            results: Vec::new(),
            expanded: 0,
            finished: false,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn expanded_states(&self) -> u64 {
        self.expanded
    }

    /// Number of final hypotheses found.
    pub fn result_count(&self) -> usize {
        self.results.len()
    }

    /// Run the whole search over `weights`.
    pub fn search(&mut self, weights: &Weights) -> Result<()> {
        let started = Instant::now();
        let weights: Cow<'_, Weights> = match self.config.astar.weight_heuristic {
            WeightHeuristic::Min if !weights.is_time_invariant() => {
                let mut owned = weights.clone();
                owned.subtract_frame_minima();
                Cow::Owned(owned)
            }
            _ => Cow::Borrowed(weights),
        };
        if !weights.is_time_invariant() {
            self.model.check_weights(weights.dims())?;
        }

        let model = Arc::clone(&self.model);
        let unit = &model.units()[0];
        let frames = weights.frames();
        let mut wmin = vec![f64::INFINITY; frames + 1];
        let frame_prune = self.config.astar.frame_prune;
        let weight_prune = self.config.astar.weight_prune;
        let numpaths = self.config.numpaths as usize;

        let w0 = match self.config.astar.heuristic {
            Heuristic::Potential => unit.potential0,
            _ => 0.0,
        };
        if w0.is_finite() {
            let root = self.backtrack.root(w0)?;
            self.insert(AstarState::new(0, 0, unit.states, w0, PushdownStack::new(), root))?;
        }

        let mut current_frame = 0u32;
        while let Some((idx, _)) = self.queue.pop() {
            let (frame, state, weight, stack) = match self.store.get(idx) {
                Some(s) => (s.frame, s.state, s.weight, s.stack),
                None => return Err(SearchError::Internal("queued hypothesis missing".to_string())),
            };
            current_frame = current_frame.max(frame);
            let f = frame as usize;
            if wmin[f].is_infinite() {
                wmin[f] = weight;
                debug!(frame, weight, queued = self.queue.len(), "Frame reached");
            }
            let expand = (frame_prune == 0 || current_frame - frame <= frame_prune)
                && (weight_prune == 0.0 || weight - weight_prune < wmin[f]);
            if expand {
                self.expanded += 1;
                let row = weights.frame(f);
                if row.is_none() && unit.is_final(state) && stack.is_empty() {
                    if let Some(s) = self.store.get(idx) {
                        self.results.push((weight + weights.offset(), s.history.clone()));
                    }
                    trace!(state, weight, found = self.results.len(), "Final hypothesis");
                    if self.results.len() >= numpaths {
                        self.finish(idx, true);
                        break;
                    }
                }
                self.expand(idx, row, frames, &wmin)?;
            }
            self.finish(idx, expand);
        }

        self.finished = true;
        info!(
            paths = self.results.len(),
            expanded = self.expanded,
            peak_queue = self.queue.peak(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "A* search finished"
        );
        Ok(())
    }

    fn expand(&mut self, idx: PoolIdx, row: Option<&[f64]>, frames: usize, wmin: &[f64]) -> Result<()> {
        let (frame, state, weight, stack, history) = match self.store.get(idx) {
            Some(s) => (s.frame, s.state, s.weight, s.stack, s.history.clone()),
            None => return Ok(()),
        };
        let model = Arc::clone(&self.model);
        let unit = &model.units()[0];
        let weight_prune = self.config.astar.weight_prune;
        for t in unit.outgoing(state) {
            if !stack.accepts(t.stack) {
                continue;
            }
            let (frame2, w2) = if t.input >= 0 {
                match row {
                    Some(r) => (frame + 1, weight + t.weight + r[t.input as usize]),
                    None if frames > 0 => continue,
                    None => (frame, weight + t.weight),
                }
            } else {
                (frame, weight + t.weight)
            };
            if !w2.is_finite() {
                continue;
            }
            if weight_prune > 0.0 && w2 - weight_prune >= wmin[frame2 as usize] {
                continue;
            }
            let mut stack2 = stack;
            stack2.apply(t.stack)?;
            let history2 = self.backtrack.extend(&history, Some(t), true, weight)?;
            trace!(from = state, to = t.ter, frame = frame2, weight = w2, "Expand");
            self.insert(AstarState::new(frame2, t.ter, unit.states, w2, stack2, history2))?;
        }
        Ok(())
    }

    fn insert(&mut self, s: AstarState) -> Result<()> {
        let weight = s.weight;
        match self.store.add(s, &self.backtrack)? {
            Outcome::Inserted(idx) => {
                if self.queue.is_full() {
                    if self.config.astar.queue_size > 0 {
                        match self.queue.make_room(weight) {
                            MakeRoom::Rejected => {
                                self.store.evict(idx);
                                return Ok(());
                            }
                            MakeRoom::Evicted(evicted) => {
                                if evicted.len() > 1 {
                                    warn!(evicted = evicted.len(), "Open queue full, pruning");
                                }
                                for e in evicted {
                                    self.store.evict(e);
                                }
                            }
                        }
                    } else {
                        self.queue.grow();
                    }
                }
                self.queue.push(idx, weight);
            }
            Outcome::Improved(idx) => {
                if self.queue.contains(idx) {
                    self.queue.update(idx, weight);
                } else {
                    self.queue.push(idx, weight);
                }
            }
            Outcome::Discarded => {}
        }
        Ok(())
    }

    /// Close an expanded hypothesis. A pruned one closes its whole state.
    fn finish(&mut self, idx: PoolIdx, expanded: bool) {
        let keep_outputs = self.config.numpaths > 1;
        if let Some(s) = self.store.get_mut(idx) {
            s.closed = true;
            s.history.trim(keep_outputs);
        }
        if let Some(rest) = self.store.finalize(idx, expanded) {
            for r in rest {
                self.queue.remove(r);
                self.store.free(r);
            }
        }
    }

    /// Result transducer with one unit per path found.
    pub fn backtrack(&self) -> Result<Transducer> {
        let writer = PathWriter::new(&self.model, &self.backtrack)?;
        let paths: Vec<(f64, &History)> = self.results.iter().map(|(w, h)| (*w, h)).collect();
        writer.write(&paths)
    }

    pub fn memory_bytes(&self) -> usize {
        self.store.memory_bytes() + self.queue.memory_bytes() + self.backtrack.memory_bytes()
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        let mut stats = self.store.stats();
        stats.extend(self.backtrack.stats());
        stats
    }

    pub fn backtrack_memory(&self) -> &BacktrackMemory {
        &self.backtrack
    }
}
