//! Conversion of path histories into result transducers.

use tracing::debug;

use super::{BacktrackMemory, History};
use crate::config::BacktrackMode;
use crate::error::{Result, SearchError};
use crate::fst::{FstModel, Transducer, Transition, Unit};

/// One step of a recovered path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathStep {
    /// Global transition id, when known.
    pub id: Option<u32>,
    pub output: i32,
    pub weight: f64,
}

/// Writes recovered paths as units of a result transducer.
pub struct PathWriter<'a> {
    model: &'a FstModel,
    memory: &'a BacktrackMemory,
}

impl<'a> PathWriter<'a> {
    pub fn new(model: &'a FstModel, memory: &'a BacktrackMemory) -> Result<Self> {
        if memory.mode() == BacktrackMode::Transitions && model.source().is_none() {
            return Err(SearchError::Config("fast loading not possible with bt=t".to_string()));
        }
        Ok(Self { model, memory })
    }

    /// Result transducer carrying the source's symbol tables, if retained.
    pub fn empty_result(&self) -> Transducer {
        let mut result = Transducer::default();
        if let Some(source) = self.model.source() {
            result.input_symbols = source.input_symbols.clone();
            result.output_symbols = source.output_symbols.clone();
        }
        result
    }

    /// Emit paths given as `(total weight, history)`, best first.
    pub fn write(&self, paths: &[(f64, &History)]) -> Result<Transducer> {
        let mut result = self.empty_result();
        if self.memory.mode() == BacktrackMode::Lattice {
            let lattice = self
                .memory
                .lattice()
                .ok_or_else(|| SearchError::Internal("lattice memory missing".to_string()))?;
            let ends: Vec<_> = paths.iter().filter_map(|(w, h)| h.lattice.map(|n| (n, *w))).collect();
            if !ends.is_empty() {
                result.units.push(lattice.determinize(&ends, "lattice")?);
            }
        } else {
            for (i, (weight, history)) in paths.iter().enumerate() {
                let steps = self.steps(*weight, history)?;
                result.units.push(self.write_steps(&format!("path{}", i), *weight, &steps)?);
            }
        }
        debug!(units = result.units.len(), "Paths written");
        Ok(result)
    }

    /// Steps of a chain history, oldest first. Step weights are the
    /// differences of consecutive node weights; the oldest step also carries
    /// the remainder so the steps sum up to `total`.
    pub fn steps(&self, total: f64, history: &History) -> Result<Vec<PathStep>> {
        let (chain, by_id) = match self.memory.mode() {
            BacktrackMode::Transitions => (history.transitions.as_ref(), true),
            _ => (history.outputs.as_ref(), false),
        };
        let chain = chain.ok_or_else(|| SearchError::Internal("history chain missing".to_string()))?;
        let mut rest = total;
        let mut steps: Vec<PathStep> = chain
            .path()
            .into_iter()
            .map(|(payload, before)| {
                let step = PathStep {
                    id: by_id.then_some(payload as u32),
                    output: if by_id { -1 } else { payload },
                    weight: rest - before,
                };
                rest = before;
                step
            })
            .collect();
        steps.reverse();
        if let Some(first) = steps.first_mut() {
            first.weight += rest;
        }
        Ok(steps)
    }

    /// Write one path unit from explicit steps.
    pub fn write_steps(&self, name: &str, total: f64, steps: &[PathStep]) -> Result<Unit> {
        let mut transitions = Vec::with_capacity(steps.len());
        let mut carry = 0.0;
        for step in steps {
            let k = transitions.len() as u32;
            match (self.memory.mode(), step.id) {
                (BacktrackMode::Transitions, Some(id)) => {
                    transitions.push(self.copy_source(id, k, step.weight + carry)?);
                    carry = 0.0;
                }
                _ if step.output >= 0 => {
                    transitions.push(Transition::new(k, k + 1, -1, step.output, step.weight + carry));
                    carry = 0.0;
                }
                _ => carry += step.weight,
            }
        }
        if transitions.is_empty() {
            transitions.push(Transition::new(0, 1, -1, -1, total));
        } else if let Some(last) = transitions.last_mut() {
            last.weight += carry;
        }
        let mut unit = Unit::new(name, transitions.len() as u32 + 1);
        unit.finals = vec![transitions.len() as u32];
        unit.weight = Some(total);
        unit.transitions = transitions;
        Ok(unit)
    }

    fn copy_source(&self, id: u32, k: u32, weight: f64) -> Result<Transition> {
        let source = self
            .model
            .locate(id)
            .ok_or_else(|| SearchError::Internal(format!("transition {} not in source", id)))?;
        let mut t = source.clone();
        t.ini = k;
        t.ter = k + 1;
        t.weight = weight;
        let unit = self.model.unit_of(id);
        if unit != Some(0) {
            t.output = -1;
        }
        if unit.and_then(|u| self.model.unit(u)).is_some_and(|u| u.sub) {
            t.input = -1;
        }
        Ok(t)
    }
}
