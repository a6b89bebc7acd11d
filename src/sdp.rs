//! Synchronous dynamic programming (SDP) over a single unit.
//!
//! The decoder delegates the actual shortest-path computation to a
//! [`ShortestDistance`] implementation. [`FrameDp`] is the built-in one: a
//! layered Viterbi pass where every frame contributes one layer of input
//! transitions followed by epsilon layers until no distance improves.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace};

use crate::backtrack::{BacktrackMemory, PathStep, PathWriter};
use crate::config::SearchConfig;
use crate::error::{Result, SearchError};
use crate::fst::{FstModel, FstTransition, ModelUnit, Transducer};
use crate::memory::PoolStats;
use crate::weights::Weights;

/// Best path through a unit given a weight matrix.
pub trait ShortestDistance: Send {
    /// Returns the path weight and its steps, oldest first, or `None` when no
    /// final state is reachable after consuming every frame.
    fn shortest_path(&self, unit: &ModelUnit, weights: &Weights) -> Result<Option<(f64, Vec<PathStep>)>>;
}

/// Layered Viterbi over frames.
#[derive(Debug, Clone)]
pub struct FrameDp {
    /// Relative beam in `0..=1`: states above
    /// `max - prune * (max - min)` of their layer are not expanded.
    pub prune: f64,
    /// Run from the initial state forward, or from the final states backward.
    pub forward: bool,
}

impl Default for FrameDp {
    fn default() -> Self {
        Self {
            prune: 0.0,
            forward: true,
        }
    }
}

/// Choices of one DP layer: the transition that set each state's distance.
struct Layer {
    frame: Option<usize>,
    choice: Vec<Option<u32>>,
}

impl FrameDp {
    pub fn new(prune: f64, forward: bool) -> Self {
        Self { prune, forward }
    }

    fn threshold(&self, dist: &[f64]) -> f64 {
        if self.prune <= 0.0 {
            return f64::INFINITY;
        }
        let (min, max) = dist
            .iter()
            .filter(|d| d.is_finite())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &d| (lo.min(d), hi.max(d)));
        if min > max {
            return f64::INFINITY;
        }
        max - self.prune * (max - min)
    }

    /// One layer. `row` is `Some` for an input layer, `None` for an epsilon
    /// layer. Returns `None` for an epsilon layer that changed nothing.
    fn relax(
        &self,
        unit: &ModelUnit,
        dist: &[f64],
        row: Option<&[f64]>,
    ) -> Option<(Vec<f64>, Vec<Option<u32>>)> {
        let n = dist.len();
        let beam = self.threshold(dist);
        let mut next = if row.is_some() {
            vec![f64::INFINITY; n]
        } else {
            dist.to_vec()
        };
        let mut choice = vec![None; n];
        let mut changed = false;
        for (local, t) in unit.transitions().iter().enumerate() {
            let w = match (row, t.input) {
                (None, input) if input < 0 => t.weight,
                (Some(r), input) if input >= 0 => match r.get(input as usize) {
                    Some(x) => t.weight + x,
                    None => continue,
                },
                _ => continue,
            };
            // forward: from ini to ter; backward: from ter to ini
            let (from, to) = if self.forward {
                (t.ini as usize, t.ter as usize)
            } else {
                (t.ter as usize, t.ini as usize)
            };
            if dist[from] > beam {
                continue;
            }
            let cand = dist[from] + w;
            if cand < next[to] {
                next[to] = cand;
                choice[to] = Some(local as u32);
                changed = true;
            }
        }
        (row.is_some() || changed).then_some((next, choice))
    }

    /// Epsilon layers until nothing improves.
    fn closure(&self, unit: &ModelUnit, dist: &mut Vec<f64>, layers: &mut Vec<Layer>) -> Result<()> {
        for _ in 0..=unit.states {
            match self.relax(unit, dist, None) {
                Some((next, choice)) => {
                    *dist = next;
                    layers.push(Layer { frame: None, choice });
                }
                None => return Ok(()),
            }
        }
        Err(SearchError::Structure(format!(
            "unit {}: epsilon closure does not converge",
            unit.name
        )))
    }

    fn step(&self, t: &FstTransition, frame: Option<usize>, weights: &Weights) -> PathStep {
        let sync = frame
            .and_then(|f| weights.frame(f))
            .and_then(|row| row.get(t.input as usize).copied())
            .unwrap_or(0.0);
        PathStep {
            id: Some(t.id),
            output: t.output,
            weight: t.weight + sync,
        }
    }
}

impl ShortestDistance for FrameDp {
    fn shortest_path(&self, unit: &ModelUnit, weights: &Weights) -> Result<Option<(f64, Vec<PathStep>)>> {
        let n = unit.states as usize;
        if n == 0 {
            return Ok(None);
        }
        let transitions = unit.transitions();
        let frames = weights.frames();
        let mut layers: Vec<Layer> = Vec::new();
        let mut dist = vec![f64::INFINITY; n];

        if self.forward {
            dist[0] = 0.0;
            self.closure(unit, &mut dist, &mut layers)?;
            for f in 0..frames {
                let row = weights.frame(f);
                if let Some((next, choice)) = self.relax(unit, &dist, row) {
                    dist = next;
                    layers.push(Layer { frame: Some(f), choice });
                }
                self.closure(unit, &mut dist, &mut layers)?;
                trace!(frame = f, active = dist.iter().filter(|d| d.is_finite()).count(), "SDP layer");
            }
            let best = (0..n as u32)
                .filter(|&s| unit.is_final(s))
                .map(|s| (s, dist[s as usize]))
                .filter(|(_, d)| d.is_finite())
                .min_by(|a, b| a.1.total_cmp(&b.1));
            let Some((mut state, total)) = best else {
                return Ok(None);
            };
            let mut steps = Vec::new();
            for layer in layers.iter().rev() {
                if let Some(local) = layer.choice[state as usize] {
                    let t = &transitions[local as usize];
                    steps.push(self.step(t, layer.frame, weights));
                    state = t.ini;
                }
            }
            steps.reverse();
            Ok(Some((total, steps)))
        } else {
            for (s, d) in dist.iter_mut().enumerate() {
                if unit.is_final(s as u32) {
                    *d = 0.0;
                }
            }
            self.closure(unit, &mut dist, &mut layers)?;
            for f in (0..frames).rev() {
                let row = weights.frame(f);
                if let Some((next, choice)) = self.relax(unit, &dist, row) {
                    dist = next;
                    layers.push(Layer { frame: Some(f), choice });
                }
                self.closure(unit, &mut dist, &mut layers)?;
            }
            let total = dist[0];
            if !total.is_finite() {
                return Ok(None);
            }
            let mut state = 0u32;
            let mut steps = Vec::new();
            for layer in layers.iter().rev() {
                if let Some(local) = layer.choice[state as usize] {
                    let t = &transitions[local as usize];
                    steps.push(self.step(t, layer.frame, weights));
                    state = t.ter;
                }
            }
            Ok(Some((total, steps)))
        }
    }
}

/// SDP decoder: a single unit, no stacks, one path.
pub struct SdpDecoder {
    model: Arc<FstModel>,
    config: SearchConfig,
    backtrack: BacktrackMemory,
    engine: Box<dyn ShortestDistance>,
    result: Option<(f64, Vec<PathStep>)>,
    finished: bool,
}

impl SdpDecoder {
    pub fn new(model: Arc<FstModel>, config: &SearchConfig, engine: Option<Box<dyn ShortestDistance>>) -> Result<Self> {
        if model.composed() {
            return Err(SearchError::Config(
                "on-the-fly composition only possible with tp".to_string(),
            ));
        }
        if model.units().iter().any(|u| u.sub) {
            return Err(SearchError::Config("sub units only possible with tp".to_string()));
        }
        if model.has_stack() {
            return Err(SearchError::Config("pushdown transitions not possible with sdp".to_string()));
        }
        let engine = engine.unwrap_or_else(|| Box::new(FrameDp::new(config.sdp.prune, config.sdp.forward)));
        Ok(Self {
            backtrack: BacktrackMemory::new(config.backtrack, 1, false, config.memory.max_elements, config.lattice_prune)?,
            model,
            config: config.clone(),
            engine,
            result: None,
            finished: false,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn search(&mut self, weights: &Weights) -> Result<()> {
        if weights.is_time_invariant() {
            return Err(SearchError::Sequence(
                "timeinvariant decoding not implemented for this algo".to_string(),
            ));
        }
        let started = Instant::now();
        self.model.check_weights(weights.dims())?;
        let unit = &self.model.units()[0];
        let mut result = self.engine.shortest_path(unit, weights)?;
        if self.config.sdp.eps_remove {
            if let Some((_, steps)) = result.as_mut() {
                *steps = remove_epsilons(unit, std::mem::take(steps));
            }
        }
        debug!(found = result.is_some(), frames = weights.frames(), "SDP pass done");
        info!(
            weight = result.as_ref().map(|(w, _)| *w),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "SDP search finished"
        );
        self.result = result;
        self.finished = true;
        Ok(())
    }

    pub fn backtrack(&self) -> Result<Transducer> {
        let writer = PathWriter::new(&self.model, &self.backtrack)?;
        let mut out = writer.empty_result();
        if let Some((total, steps)) = &self.result {
            out.units.push(writer.write_steps("path0", *total, steps)?);
        }
        Ok(out)
    }

    pub fn expanded_states(&self) -> u64 {
        self.result.as_ref().map_or(0, |(_, steps)| steps.len() as u64)
    }

    pub fn memory_bytes(&self) -> usize {
        self.model.memory_bytes() + self.backtrack.memory_bytes()
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.backtrack.stats()
    }
}

/// Fold steps of epsilon/epsilon transitions into their predecessor, or the
/// successor at the start of the path.
fn remove_epsilons(unit: &ModelUnit, steps: Vec<PathStep>) -> Vec<PathStep> {
    let is_epsilon = |step: &PathStep| {
        step.id
            .and_then(|id| id.checked_sub(unit.first_id))
            .and_then(|local| unit.transitions().get(local as usize))
            .is_some_and(|t| t.input < 0 && t.output < 0)
    };
    let mut kept: Vec<PathStep> = Vec::with_capacity(steps.len());
    let mut carry = 0.0;
    for step in steps {
        if is_epsilon(&step) {
            match kept.last_mut() {
                Some(last) => last.weight += step.weight,
                None => carry += step.weight,
            }
        } else {
            kept.push(PathStep {
                weight: step.weight + carry,
                ..step
            });
            carry = 0.0;
        }
    }
    if kept.is_empty() && carry != 0.0 {
        kept.push(PathStep {
            id: None,
            output: -1,
            weight: carry,
        });
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Algorithm, BacktrackMode};
    use crate::fst::{Transition, Unit};

    fn config() -> SearchConfig {
        let mut config = SearchConfig::default();
        config.algorithm = Algorithm::Sdp;
        config
    }

    /// Two competing words with an epsilon tail.
    fn model() -> Arc<FstModel> {
        let mut unit = Unit::new("words", 5);
        unit.finals = vec![4];
        unit.transitions = vec![
            Transition::new(0, 1, 0, 1, 0.0),
            Transition::new(1, 3, 1, -1, 0.0),
            Transition::new(0, 2, 1, 2, 0.0),
            Transition::new(2, 3, 0, -1, 0.0),
            Transition::new(3, 4, -1, -1, 0.5),
        ];
        Arc::new(FstModel::load(&Transducer::new(vec![unit]), None, false).unwrap())
    }

    fn weights() -> Weights {
        Weights::from_rows(vec![vec![1.0, 2.0], vec![3.0, 0.5]]).unwrap()
    }

    #[test]
    fn test_forward_and_backward_agree() {
        let model = model();
        let unit = &model.units()[0];
        let (fw, fw_steps) = FrameDp::new(0.0, true).shortest_path(unit, &weights()).unwrap().unwrap();
        let (bw, bw_steps) = FrameDp::new(0.0, false).shortest_path(unit, &weights()).unwrap().unwrap();
        assert_eq!(fw, 2.0);
        assert_eq!(bw, 2.0);
        assert_eq!(fw_steps, bw_steps);
        let ids: Vec<Option<u32>> = fw_steps.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![Some(0), Some(1), Some(4)]);
        let sum: f64 = fw_steps.iter().map(|s| s.weight).sum();
        assert_eq!(sum, 2.0);
    }

    #[test]
    fn test_decoder_writes_path() {
        let mut decoder = SdpDecoder::new(model(), &config(), None).unwrap();
        decoder.search(&weights()).unwrap();
        let result = decoder.backtrack().unwrap();
        assert_eq!(result.units[0].weight, Some(2.0));
        assert_eq!(result.units[0].output_sequence(), vec![1]);
    }

    #[test]
    fn test_epsilon_removal_keeps_weight() {
        let mut cfg = config();
        cfg.backtrack = BacktrackMode::Transitions;
        cfg.sdp.eps_remove = true;
        let mut decoder = SdpDecoder::new(model(), &cfg, None).unwrap();
        decoder.search(&weights()).unwrap();
        let path = decoder.backtrack().unwrap().units.remove(0);
        assert_eq!(path.transitions.len(), 2);
        assert_eq!(path.total_weight(), 2.0);
        assert_eq!(path.input_sequence(), vec![0, 1]);
    }

    #[test]
    fn test_unreachable_final() {
        let model = model();
        let short = Weights::from_rows(vec![vec![0.0, 0.0]]).unwrap();
        let found = FrameDp::default().shortest_path(&model.units()[0], &short).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_pruning_keeps_best() {
        let model = model();
        let (w, _) = FrameDp::new(0.5, true)
            .shortest_path(&model.units()[0], &weights())
            .unwrap()
            .unwrap();
        assert_eq!(w, 2.0);
    }

    #[test]
    fn test_rejects_time_invariant_and_stacks() {
        let mut decoder = SdpDecoder::new(model(), &config(), None).unwrap();
        assert!(decoder.search(&Weights::empty()).is_err());

        let mut unit = Unit::new("stack", 2);
        unit.finals = vec![1];
        unit.transitions = vec![Transition::new(0, 1, 0, -1, 0.0).with_stack(2)];
        let model = FstModel::load(&Transducer::new(vec![unit]), None, false).unwrap();
        assert!(SdpDecoder::new(Arc::new(model), &config(), None).is_err());
    }

    struct Fixed;

    impl ShortestDistance for Fixed {
        fn shortest_path(&self, _: &ModelUnit, _: &Weights) -> Result<Option<(f64, Vec<PathStep>)>> {
            Ok(Some((
                7.0,
                vec![PathStep {
                    id: Some(2),
                    output: 2,
                    weight: 7.0,
                }],
            )))
        }
    }

    #[test]
    fn test_custom_engine() {
        let mut decoder = SdpDecoder::new(model(), &config(), Some(Box::new(Fixed))).unwrap();
        decoder.search(&weights()).unwrap();
        let result = decoder.backtrack().unwrap();
        assert_eq!(result.units[0].weight, Some(7.0));
        assert_eq!(result.units[0].output_sequence(), vec![2]);
    }
}
