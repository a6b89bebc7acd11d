//! Expansion of one frame, on the calling thread or split over jobs.
//!
//! With several jobs, hypotheses are partitioned by a bit slice of their
//! state in unit 0. Each job expands its own current list on a scoped
//! thread; a hypothesis owned by another job is mailed to it. `active`
//! counts busy jobs plus mails in flight, so the frame is complete when it
//! drops to zero. The job that observes this wakes all others.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam::channel::{unbounded, Receiver, Sender};
use crossbeam::thread;
use tracing::{trace, warn};

use super::list::{JobLists, Target};
use super::state::{Packing, TpState};
use crate::backtrack::{BacktrackMemory, History};
use crate::constants::search::MAX_LAYER;
use crate::error::{Result, SearchError};
use crate::fst::FstModel;
use crate::memory::PoolIdx;
use crate::types::PushdownStack;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepMode {
    /// Consume one weight row.
    Frame,
    /// After the last row: epsilon closure only.
    Closing,
    /// No weights; input transitions are free.
    Invariant,
}

/// Read-only data shared by all jobs during one frame.
pub(crate) struct FrameContext<'a> {
    pub model: &'a FstModel,
    pub backtrack: &'a BacktrackMemory,
    pub packing: &'a Packing,
    pub row: Option<&'a [f64]>,
    pub mode: StepMode,
    /// Accumulated frame minima before and after this frame.
    pub offset: f64,
    pub next_offset: f64,
    pub numpaths: u32,
    pub jobs: usize,
    pub shift: u32,
}

impl FrameContext<'_> {
    pub fn job_of(&self, s: &TpState) -> usize {
        if self.jobs == 1 {
            0
        } else {
            (s.layers[0] >> self.shift) as usize & (self.jobs - 1)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn hypothesis(
        &self,
        layers: [u32; MAX_LAYER],
        units: [u32; MAX_LAYER],
        depth: u8,
        stack: PushdownStack,
        wc: f64,
        target: Target,
        history: History,
    ) -> TpState {
        let base = if target == Target::Next {
            self.next_offset
        } else {
            self.offset
        };
        TpState {
            id: self.packing.id(&layers, &units, depth),
            wc,
            wn: wc - base,
            depth,
            layers,
            units,
            stack,
            history,
            element: None,
        }
    }
}

/// Largest shift such that every job still gets at least two blocks of
/// `2^shift` states of unit 0.
pub(crate) fn partition_shift(states: u64, jobs: usize) -> u32 {
    let mut shift = 0u32;
    while shift < 31 && (1u64 << (shift + 2)) * jobs as u64 <= states {
        shift += 1;
    }
    shift
}

/// Expand the hypothesis `idx` of the current list into `out`.
pub(crate) fn expand(
    ctx: &FrameContext<'_>,
    lists: &mut JobLists,
    idx: PoolIdx,
    out: &mut Vec<(TpState, Target)>,
) -> Result<()> {
    let Some(s) = lists.current.get(idx) else {
        return Ok(());
    };
    let (id, wc, wn, depth, layers, units, stack) = (s.id, s.wc, s.wn, s.depth, s.layers, s.units, s.stack);
    let history = s.history.clone();
    if wn >= lists.threshold {
        retire(ctx, lists, idx);
        return Ok(());
    }
    if ctx.mode == StepMode::Invariant && !lists.settle(id, stack, wc, ctx.numpaths) {
        retire(ctx, lists, idx);
        return Ok(());
    }
    lists.expanded += 1;

    let d = depth as usize;
    let unit = ctx
        .model
        .unit(units[d] as usize)
        .ok_or_else(|| SearchError::Internal(format!("unit {} not loaded", units[d])))?;
    let q = layers[d];
    for t in unit.outgoing(q) {
        if !stack.accepts(t.stack) {
            continue;
        }
        let mut layers2 = layers;
        let mut units2 = units;
        let mut depth2 = depth;
        let mut wc2 = wc + t.weight;
        layers2[d] = t.ter;
        let target = if unit.sub && t.input >= 0 {
            if d + 1 >= MAX_LAYER {
                return Err(SearchError::Structure("out of layers".to_string()));
            }
            depth2 += 1;
            units2[d + 1] = t.input as u32;
            layers2[d + 1] = 0;
            Target::Current
        } else if t.input >= 0 {
            match (ctx.mode, ctx.row) {
                (StepMode::Frame, Some(row)) => match row.get(t.input as usize) {
                    Some(w) => wc2 += w,
                    None => continue,
                },
                (StepMode::Invariant, _) => {}
                _ => continue,
            }
            Target::Next
        } else {
            Target::Current
        };
        if !wc2.is_finite() {
            continue;
        }
        let mut stack2 = stack;
        stack2.apply(t.stack)?;
        let history2 = ctx.backtrack.extend(&history, Some(t), d == 0, wc)?;
        trace!(unit = units[d], from = q, to = t.ter, depth = depth2, weight = wc2, "Expand");
        out.push((ctx.hypothesis(layers2, units2, depth2, stack2, wc2, target, history2), target));
    }

    if unit.is_final(q) {
        if d > 0 {
            let mut layers2 = layers;
            let mut units2 = units;
            layers2[d] = 0;
            units2[d] = 0;
            let s = ctx.hypothesis(layers2, units2, depth - 1, stack, wc, Target::Current, history);
            out.push((s, Target::Current));
        } else if stack.is_empty() && ctx.mode != StepMode::Frame {
            out.push((ctx.hypothesis(layers, units, depth, stack, wc, Target::Final, history), Target::Final));
        }
    }
    retire(ctx, lists, idx);
    Ok(())
}

/// An expanded or pruned hypothesis only needs what recombination compares.
fn retire(ctx: &FrameContext<'_>, lists: &mut JobLists, idx: PoolIdx) {
    if let Some(s) = lists.current.get_mut(idx) {
        s.history.trim(ctx.numpaths > 1);
    }
}

/// Run one frame with a single job.
pub(crate) fn run_single(ctx: &FrameContext<'_>, lists: &mut JobLists) -> Result<()> {
    let mut out = Vec::new();
    while let Some(idx) = lists.current.pop() {
        expand(ctx, lists, idx, &mut out)?;
        for (s, target) in out.drain(..) {
            lists.deliver(s, target, ctx.backtrack)?;
        }
    }
    Ok(())
}

enum Mail {
    State(Box<TpState>, Target),
    Done,
}

struct Worker<'a, 'c> {
    job: usize,
    ctx: &'a FrameContext<'c>,
    senders: &'a [Sender<Mail>],
    active: &'a AtomicUsize,
    abort: &'a AtomicBool,
}

impl Worker<'_, '_> {
    fn run(&self, lists: &mut JobLists, mailbox: Receiver<Mail>) -> Result<()> {
        let mut failure = None;
        let mut out = Vec::new();
        loop {
            while let Ok(mail) = mailbox.try_recv() {
                match mail {
                    Mail::State(s, target) => {
                        self.active.fetch_sub(1, Ordering::SeqCst);
                        self.accept(lists, *s, target, &mut failure);
                    }
                    Mail::Done => return failure.map_or(Ok(()), Err),
                }
            }
            if failure.is_none() && !self.abort.load(Ordering::SeqCst) {
                if let Some(idx) = lists.current.pop() {
                    let step = expand(self.ctx, lists, idx, &mut out).and_then(|_| self.route(lists, &mut out));
                    if let Err(e) = step {
                        self.fail(&mut failure, e);
                    }
                    continue;
                }
            } else {
                lists.current.abandon();
            }

            if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
                for sender in self.senders {
                    let _ = sender.send(Mail::Done);
                }
            }
            match mailbox.recv() {
                Ok(Mail::State(s, target)) => self.accept(lists, *s, target, &mut failure),
                Ok(Mail::Done) | Err(_) => break,
            }
        }
        failure.map_or(Ok(()), Err)
    }

    fn route(&self, lists: &mut JobLists, out: &mut Vec<(TpState, Target)>) -> Result<()> {
        for (s, target) in out.drain(..) {
            let job = self.ctx.job_of(&s);
            if job == self.job {
                lists.deliver(s, target, self.ctx.backtrack)?;
                continue;
            }
            self.active.fetch_add(1, Ordering::SeqCst);
            self.senders[job]
                .send(Mail::State(Box::new(s), target))
                .map_err(|_| SearchError::Internal(format!("mailbox of job {} closed", job)))?;
        }
        Ok(())
    }

    fn accept(&self, lists: &mut JobLists, s: TpState, target: Target, failure: &mut Option<SearchError>) {
        if failure.is_some() || self.abort.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = lists.deliver(s, target, self.ctx.backtrack) {
            self.fail(failure, e);
        }
    }

    fn fail(&self, failure: &mut Option<SearchError>, e: SearchError) {
        warn!(job = self.job, error = %e, "TP job failed, aborting frame");
        self.abort.store(true, Ordering::SeqCst);
        *failure = Some(e);
    }
}

/// Run one frame over all jobs, each on its own scoped thread.
///
/// Threads and mailboxes live for one frame only, so each job borrows its
/// lists and the frame context for the duration of the scope.
pub(crate) fn run_parallel(ctx: &FrameContext<'_>, jobs: &mut [JobLists]) -> Result<()> {
    let (senders, mailboxes): (Vec<Sender<Mail>>, Vec<Receiver<Mail>>) = (0..jobs.len()).map(|_| unbounded()).unzip();
    let active = AtomicUsize::new(jobs.len());
    let abort = AtomicBool::new(false);

    let results = thread::scope(|scope| {
        let handles: Vec<_> = jobs
            .iter_mut()
            .zip(mailboxes)
            .enumerate()
            .map(|(job, (lists, mailbox))| {
                let worker = Worker {
                    job,
                    ctx,
                    senders: &senders,
                    active: &active,
                    abort: &abort,
                };
                scope.spawn(move |_| worker.run(lists, mailbox))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(SearchError::Internal("tp job panicked".to_string())))
            })
            .collect::<Vec<_>>()
    })
    .map_err(|_| SearchError::Internal("tp job panicked".to_string()))?;

    results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
}
