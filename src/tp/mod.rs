//! Frame-synchronous (TP) decoder.
//!
//! Every frame the hypotheses of the current list are expanded: input
//! transitions consume the frame's weight row and land in the next list,
//! epsilon transitions stay in the current one. Recombination happens on
//! insertion. After the last row a closing pass expands the current list
//! once more without consuming anything and collects final hypotheses.
//!
//! Without weights (time-invariant search) input transitions are free and
//! the decoder steps until no list holds hypotheses any more; a state and
//! stack is expanded at most `numpaths` times unless reached with a better
//! weight.
//!
//! Units flagged `sub` compose on the fly: their input symbols name the unit
//! to descend into, and reaching a final state of that unit returns to the
//! calling unit.

mod histogram;
mod jobs;
mod list;
mod state;

pub use histogram::Histogram;
pub use list::{JobLists, StateList, Target};
pub use state::{Packing, TpState};

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::backtrack::{BacktrackMemory, History, PathWriter};
use crate::config::SearchConfig;
use crate::constants::memory::STATE_INITIAL;
use crate::error::{Result, SearchError};
use crate::fst::{FstModel, Transducer};
use crate::memory::PoolStats;
use crate::weights::{row_minimum, Weights};
use jobs::{partition_shift, run_parallel, run_single, FrameContext, StepMode};

/// Options of one iterative search call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedOptions {
    /// No further weights follow; run the closing pass.
    pub last: bool,
    /// Re-seed the initial hypothesis before every frame.
    pub start: bool,
}

impl FeedOptions {
    pub fn last() -> Self {
        Self {
            last: true,
            start: false,
        }
    }
}

/// TP decoder. Fed frame by frame or with a whole weight matrix.
pub struct TpDecoder {
    model: Arc<FstModel>,
    config: SearchConfig,
    backtrack: BacktrackMemory,
    packing: Packing,
    jobs: Vec<JobLists>,
    shift: u32,
    offset: f64,
    frames: usize,
    started: bool,
    finished: bool,
}

impl TpDecoder {
    pub fn new(model: Arc<FstModel>, config: &SearchConfig) -> Result<Self> {
        let packing = Packing::new(&model)?;
        let jobs = config.tp.jobs.max(1);
        let limit = config.memory.max_elements;
        let numpaths = config.numpaths;
        let lists = (0..jobs)
            .map(|job| JobLists::new(job, STATE_INITIAL / jobs, numpaths, !config.stack_prune, limit))
            .collect();
        let shift = partition_shift(packing.primary_states(), jobs);
        debug!(jobs, shift, units = model.units().len(), "TP decoder ready");
        Ok(Self {
            backtrack: BacktrackMemory::new(config.backtrack, numpaths, numpaths > 1, limit, config.lattice_prune)?,
            packing,
            jobs: lists,
            shift,
            model,
            config: config.clone(),
            offset: 0.0,
            frames: 0,
            started: false,
            finished: false,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Frames consumed so far.
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn expanded_states(&self) -> u64 {
        self.jobs.iter().map(|l| l.expanded).sum()
    }

    /// Hypotheses waiting for the next frame.
    pub fn active_states(&self) -> usize {
        self.jobs.iter().map(|l| l.current.len()).sum()
    }

    /// Feed weights. A time-invariant (empty) matrix runs the whole search.
    pub fn feed(&mut self, weights: &Weights, options: FeedOptions) -> Result<()> {
        if self.finished {
            return Err(SearchError::Sequence("restart search first".to_string()));
        }
        let started = Instant::now();
        if weights.is_time_invariant() {
            if self.frames > 0 {
                return Err(SearchError::Sequence(
                    "timeinvariant iterative decoding not possible".to_string(),
                ));
            }
            self.seed()?;
            let mut steps = 0usize;
            while self.jobs.iter().any(|l| l.current.has_pending()) {
                self.step(None, StepMode::Invariant)?;
                steps += 1;
            }
            self.finished = true;
            debug!(steps, "Time-invariant search done");
        } else {
            self.model.check_weights(weights.dims())?;
            for f in 0..weights.frames() {
                if options.start || !self.started {
                    self.seed()?;
                }
                self.step(weights.frame(f), StepMode::Frame)?;
            }
            if options.last {
                if !self.started {
                    self.seed()?;
                }
                self.step(None, StepMode::Closing)?;
                self.finished = true;
            }
        }
        if self.finished {
            info!(
                frames = self.frames,
                expanded = self.expanded_states(),
                finals = self.jobs.iter().map(|l| l.finals.len()).sum::<usize>(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "TP search finished"
            );
        }
        Ok(())
    }

    fn seed(&mut self) -> Result<()> {
        let history = self.backtrack.root(self.offset)?;
        self.jobs[0]
            .current
            .add(TpState::initial(self.offset, history), &self.backtrack)?;
        self.started = true;
        Ok(())
    }

    fn step(&mut self, row: Option<&[f64]>, mode: StepMode) -> Result<()> {
        let next_offset = self.offset + row.map_or(0.0, row_minimum);
        let wmin = self
            .jobs
            .iter()
            .map(|l| l.current.wmin())
            .fold(f64::INFINITY, f64::min);
        let prnw = self.config.tp.weight_prune;
        let prnh = self.config.tp.hypothesis_prune;
        // only frames consuming a weight row are pruned
        let pruning = mode == StepMode::Frame;
        let beam = if pruning && prnw > 0.0 && wmin.is_finite() {
            wmin + prnw
        } else {
            f64::INFINITY
        };
        for lists in &mut self.jobs {
            if mode != StepMode::Invariant {
                lists.finals.clear();
            }
            let histogram = if pruning {
                lists.current.histogram.threshold(prnh)
            } else {
                f64::INFINITY
            };
            // the looser of both thresholds wins
            lists.threshold = if histogram.is_finite() && beam.is_finite() {
                histogram.max(beam)
            } else if beam.is_finite() {
                beam
            } else {
                histogram
            };
            let base = lists.current.wmin();
            lists.next.histogram.reset(base, prnh > 0);
        }

        let ctx = FrameContext {
            model: &self.model,
            backtrack: &self.backtrack,
            packing: &self.packing,
            row,
            mode,
            offset: self.offset,
            next_offset,
            numpaths: self.config.numpaths,
            jobs: self.jobs.len(),
            shift: self.shift,
        };
        if self.jobs.len() == 1 {
            run_single(&ctx, &mut self.jobs[0])?;
        } else {
            run_parallel(&ctx, &mut self.jobs)?;
        }

        if mode != StepMode::Closing {
            for lists in &mut self.jobs {
                lists.swap();
            }
            self.offset = next_offset;
            if mode == StepMode::Frame {
                self.frames += 1;
            }
        }
        self.backtrack.flush_delayed();
        debug!(
            frame = self.frames,
            ?mode,
            active = self.active_states(),
            beam,
            "TP step"
        );
        Ok(())
    }

    /// Best paths so far. Before the closing pass these are the best
    /// hypotheses of the last frame, afterwards the best final hypotheses.
    pub fn backtrack(&self) -> Result<Transducer> {
        let writer = PathWriter::new(&self.model, &self.backtrack)?;
        let mut paths: Vec<(f64, f64, &History)> = if self.finished {
            self.jobs
                .iter()
                .flat_map(|l| l.finals.iter().map(|(_, s)| (s.wc, s.wc, &s.history)))
                .collect()
        } else {
            self.jobs
                .iter()
                .flat_map(|l| l.current.iter().map(|s| (s.wn, s.wc, &s.history)))
                .collect()
        };
        paths.sort_by(|a, b| a.0.total_cmp(&b.0));
        paths.truncate(self.config.numpaths as usize);
        let paths: Vec<(f64, &History)> = paths.into_iter().map(|(_, wc, h)| (wc, h)).collect();
        writer.write(&paths)
    }

    pub fn memory_bytes(&self) -> usize {
        self.jobs.iter().map(JobLists::memory_bytes).sum::<usize>() + self.backtrack.memory_bytes()
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self.jobs.iter().flat_map(JobLists::stats).collect();
        stats.extend(self.backtrack.stats());
        stats
    }

    pub fn backtrack_memory(&self) -> &BacktrackMemory {
        &self.backtrack
    }
}
