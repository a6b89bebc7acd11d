//! Decoder-side graph representation of a transducer.

use tracing::{debug, info};

use super::transducer::{Semiring, Transducer, Transition};
use crate::constants::fst::{MAX_INDEX, MAX_STACK_SYMBOL};
use crate::error::{Result, SearchError};

/// A transition as seen by the decoders.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FstTransition {
    /// Position in the concatenated transition tables of the source.
    pub id: u32,
    pub ini: u32,
    pub ter: u32,
    pub input: i32,
    pub output: i32,
    pub stack: i32,
    pub weight: f64,
}

/// One unit with forward and backward adjacency.
#[derive(Debug, Clone)]
pub struct ModelUnit {
    pub name: String,
    pub states: u32,
    pub sub: bool,
    /// Global id of the first transition.
    pub first_id: u32,
    /// Potential of the initial state once weights were pushed.
    pub potential0: f64,
    transitions: Vec<FstTransition>,
    forward_start: Vec<u32>,
    forward: Vec<u32>,
    backward_start: Vec<u32>,
    backward: Vec<u32>,
    finals: Vec<bool>,
}

fn adjacency(states: u32, keys: impl Iterator<Item = u32> + Clone) -> (Vec<u32>, Vec<u32>) {
    let mut start = vec![0u32; states as usize + 1];
    for key in keys.clone() {
        start[key as usize + 1] += 1;
    }
    for s in 0..states as usize {
        start[s + 1] += start[s];
    }
    let mut fill = start.clone();
    let mut order = vec![0u32; start[states as usize] as usize];
    for (local, key) in keys.enumerate() {
        let slot = &mut fill[key as usize];
        order[*slot as usize] = local as u32;
        *slot += 1;
    }
    (start, order)
}

impl ModelUnit {
    fn build(name: String, states: u32, sub: bool, first_id: u32, finals: &[u32], transitions: Vec<FstTransition>) -> Self {
        let (forward_start, forward) = adjacency(states, transitions.iter().map(|t| t.ini));
        let (backward_start, backward) = adjacency(states, transitions.iter().map(|t| t.ter));
        let mut final_map = vec![false; states as usize];
        for &f in finals {
            final_map[f as usize] = true;
        }
        Self {
            name,
            states,
            sub,
            first_id,
            potential0: 0.0,
            transitions,
            forward_start,
            forward,
            backward_start,
            backward,
            finals: final_map,
        }
    }

    /// Transitions leaving `state`, in source order.
    pub fn outgoing(&self, state: u32) -> impl Iterator<Item = &FstTransition> {
        let s = state as usize;
        let range = self.forward_start[s] as usize..self.forward_start[s + 1] as usize;
        self.forward[range].iter().map(move |&i| &self.transitions[i as usize])
    }

    /// Transitions entering `state`.
    pub fn incoming(&self, state: u32) -> impl Iterator<Item = &FstTransition> {
        let s = state as usize;
        let range = self.backward_start[s] as usize..self.backward_start[s + 1] as usize;
        self.backward[range].iter().map(move |&i| &self.transitions[i as usize])
    }

    pub fn is_final(&self, state: u32) -> bool {
        self.finals.get(state as usize).copied().unwrap_or(false)
    }

    pub fn transitions(&self) -> &[FstTransition] {
        &self.transitions
    }

    pub(crate) fn transitions_mut(&mut self) -> &mut [FstTransition] {
        &mut self.transitions
    }

    /// Whether a global transition id belongs to this unit.
    pub fn owns(&self, id: u32) -> bool {
        id >= self.first_id && ((id - self.first_id) as usize) < self.transitions.len()
    }

    /// Largest input symbol used, if any.
    pub fn max_input(&self) -> Option<i32> {
        self.transitions.iter().map(|t| t.input).filter(|&i| i >= 0).max()
    }

    /// Heap bytes held by the adjacency tables.
    pub fn memory_bytes(&self) -> usize {
        self.transitions.len() * std::mem::size_of::<FstTransition>()
            + (self.forward.len() + self.backward.len() + self.forward_start.len() + self.backward_start.len()) * 4
            + self.finals.len()
    }
}

/// Graph of one or several units, ready for decoding.
#[derive(Debug, Clone)]
pub struct FstModel {
    units: Vec<ModelUnit>,
    source: Option<Transducer>,
    pushed: bool,
}

fn check_limit(what: &str, value: u64) -> Result<()> {
    if value > MAX_INDEX {
        return Err(SearchError::Structure(format!(
            "{} count {} exceeds {}",
            what, value, MAX_INDEX
        )));
    }
    Ok(())
}

fn convert_weight(semiring: Semiring, weight: f64) -> f64 {
    match semiring {
        Semiring::Tropical => weight,
        Semiring::Probability => -weight.ln(),
    }
}

impl FstModel {
    /// Build the decoder graph.
    ///
    /// # Arguments
    /// * `source` - External transducer.
    /// * `unit` - Decode only this unit; `None` keeps all units for composition.
    /// * `fast` - Do not retain a copy of `source`.
    pub fn load(source: &Transducer, unit: Option<usize>, fast: bool) -> Result<Self> {
        if source.units.is_empty() {
            return Err(SearchError::InvalidInput("transducer has no units".to_string()));
        }
        check_limit("unit", source.units.len() as u64)?;
        check_limit("transition", source.transition_count() as u64)?;
        if let Some(u) = unit {
            if u >= source.units.len() {
                return Err(SearchError::InvalidInput(format!(
                    "unit {} out of range ({} units)",
                    u,
                    source.units.len()
                )));
            }
        }

        let mut units = Vec::new();
        let mut first_id = 0u32;
        for (index, src) in source.units.iter().enumerate() {
            let selected = unit.map_or(true, |u| u == index);
            if selected {
                units.push(Self::load_unit(source.semiring, index, src, first_id)?);
            }
            first_id += src.transitions.len() as u32;
        }

        let model = Self {
            units,
            source: if fast { None } else { Some(source.clone()) },
            pushed: false,
        };
        info!(
            units = model.units.len(),
            transitions = model.transition_count(),
            fast,
            "Transducer loaded"
        );
        Ok(model)
    }

    fn load_unit(semiring: Semiring, index: usize, src: &crate::fst::Unit, first_id: u32) -> Result<ModelUnit> {
        check_limit("state", src.states as u64)?;
        if src.states == 0 {
            return Err(SearchError::InvalidInput(format!("unit {} has no states", index)));
        }
        for &f in &src.finals {
            if f >= src.states {
                return Err(SearchError::InvalidInput(format!(
                    "unit {}: final state {} out of range",
                    index, f
                )));
            }
        }
        let mut transitions = Vec::with_capacity(src.transitions.len());
        for (local, t) in src.transitions.iter().enumerate() {
            Self::check_transition(index, local, src.states, t)?;
            transitions.push(FstTransition {
                id: first_id + local as u32,
                ini: t.ini,
                ter: t.ter,
                input: t.input,
                output: t.output,
                stack: t.stack,
                weight: convert_weight(semiring, t.weight),
            });
        }
        debug!(unit = index, states = src.states, transitions = transitions.len(), "Unit loaded");
        Ok(ModelUnit::build(
            src.name.clone(),
            src.states,
            src.sub,
            first_id,
            &src.finals,
            transitions,
        ))
    }

    fn check_transition(unit: usize, local: usize, states: u32, t: &Transition) -> Result<()> {
        if t.ini >= states || t.ter >= states {
            return Err(SearchError::InvalidInput(format!(
                "unit {} transition {}: state out of range",
                unit, local
            )));
        }
        if t.input as i64 > MAX_INDEX as i64 || t.output as i64 > MAX_INDEX as i64 {
            return Err(SearchError::Structure(format!(
                "unit {} transition {}: symbol exceeds {}",
                unit, local, MAX_INDEX
            )));
        }
        if t.stack.abs() > MAX_STACK_SYMBOL {
            return Err(SearchError::Structure(format!(
                "unit {} transition {}: stack symbol {} out of range",
                unit, local, t.stack
            )));
        }
        Ok(())
    }

    pub fn units(&self) -> &[ModelUnit] {
        &self.units
    }

    pub(crate) fn units_mut(&mut self) -> &mut [ModelUnit] {
        &mut self.units
    }

    pub fn unit(&self, index: usize) -> Option<&ModelUnit> {
        self.units.get(index)
    }

    /// Retained source transducer, absent after fast loading.
    pub fn source(&self) -> Option<&Transducer> {
        self.source.as_ref()
    }

    /// Whether several units take part in on-the-fly composition.
    pub fn composed(&self) -> bool {
        self.units.len() > 1
    }

    pub fn transition_count(&self) -> usize {
        self.units.iter().map(|u| u.transitions.len()).sum()
    }

    /// Whether any transition carries a pushdown symbol.
    pub fn has_stack(&self) -> bool {
        self.units
            .iter()
            .any(|u| u.transitions.iter().any(|t| t.stack != 0))
    }

    pub fn is_pushed(&self) -> bool {
        self.pushed
    }

    pub(crate) fn set_pushed(&mut self) {
        self.pushed = true;
    }

    /// Index of the model unit owning a global transition id.
    pub fn unit_of(&self, id: u32) -> Option<usize> {
        self.units.iter().position(|u| u.owns(id))
    }

    /// Source transition of a global transition id.
    pub fn locate(&self, id: u32) -> Option<&Transition> {
        let source = self.source.as_ref()?;
        let mut first = 0usize;
        for unit in &source.units {
            let local = (id as usize).checked_sub(first)?;
            if local < unit.transitions.len() {
                return unit.transitions.get(local);
            }
            first += unit.transitions.len();
        }
        None
    }

    /// Verify that every input symbol consumed against a weight row of
    /// `dims` columns is a valid column.
    pub fn check_weights(&self, dims: usize) -> Result<()> {
        for (index, unit) in self.units.iter().enumerate() {
            if unit.sub {
                continue;
            }
            if let Some(max) = unit.max_input() {
                if max as usize >= dims {
                    return Err(SearchError::InvalidInput(format!(
                        "unit {}: input symbol {} exceeds weight dimension {}",
                        index, max, dims
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn memory_bytes(&self) -> usize {
        self.units.iter().map(ModelUnit::memory_bytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fst::Unit;

    fn two_units() -> Transducer {
        let mut a = Unit::new("a", 3);
        a.finals = vec![2];
        a.transitions = vec![
            Transition::new(0, 1, 0, 10, 1.0),
            Transition::new(1, 2, 1, 11, 2.0),
            Transition::new(0, 2, 1, -1, 5.0),
        ];
        let mut b = Unit::new("b", 2);
        b.finals = vec![1];
        b.transitions = vec![Transition::new(0, 1, 0, 20, 0.5)];
        Transducer::new(vec![a, b])
    }

    #[test]
    fn test_adjacency() {
        let model = FstModel::load(&two_units(), None, false).unwrap();
        let unit = &model.units()[0];
        let out: Vec<u32> = unit.outgoing(0).map(|t| t.id).collect();
        assert_eq!(out, vec![0, 2]);
        let inc: Vec<u32> = unit.incoming(2).map(|t| t.id).collect();
        assert_eq!(inc, vec![1, 2]);
        assert!(unit.is_final(2));
        assert!(!unit.is_final(0));
        assert_eq!(model.units()[1].first_id, 3);
        assert!(model.composed());
    }

    #[test]
    fn test_unit_selection_keeps_global_ids() {
        let model = FstModel::load(&two_units(), Some(1), true).unwrap();
        assert_eq!(model.units().len(), 1);
        assert_eq!(model.units()[0].transitions()[0].id, 3);
        assert!(model.source().is_none());
        assert!(FstModel::load(&two_units(), Some(2), true).is_err());
    }

    #[test]
    fn test_locate() {
        let model = FstModel::load(&two_units(), None, false).unwrap();
        assert_eq!(model.locate(3).map(|t| t.output), Some(20));
        assert!(model.locate(4).is_none());
        assert_eq!(model.unit_of(3), Some(1));
    }

    #[test]
    fn test_probability_weights() {
        let mut fst = two_units();
        fst.semiring = Semiring::Probability;
        fst.units[0].transitions[0].weight = 0.5;
        let model = FstModel::load(&fst, Some(0), true).unwrap();
        let w = model.units()[0].transitions()[0].weight;
        assert!((w - 0.5f64.ln().abs()).abs() < 1e-12);
    }

    #[test]
    fn test_validation() {
        let mut fst = two_units();
        fst.units[0].transitions[0].ter = 9;
        assert!(matches!(FstModel::load(&fst, None, true), Err(SearchError::InvalidInput(_))));

        let mut fst = two_units();
        fst.units[0].transitions[0].stack = 70_000;
        assert!(matches!(FstModel::load(&fst, None, true), Err(SearchError::Structure(_))));

        assert!(FstModel::load(&Transducer::default(), None, true).is_err());
    }

    #[test]
    fn test_check_weights() {
        let model = FstModel::load(&two_units(), Some(0), true).unwrap();
        assert!(model.check_weights(2).is_ok());
        assert!(model.check_weights(1).is_err());
    }
}
