use crate::backtrack::History;
use crate::constants::search::MAX_LAYER;
use crate::error::{Result, SearchError};
use crate::fst::FstModel;
use crate::memory::PoolIdx;
use crate::recombine::Hypothesis;
use crate::types::PushdownStack;

/// Frame-synchronous hypothesis.
///
/// Under composition a hypothesis sits in a stack of units: `units[d]` and
/// `layers[d]` give the unit and state at depth `d`, where depth 0 is always
/// unit 0. For `d > 0`, `layers[d - 1]` holds the state to return to once
/// the unit at depth `d` reaches a final state.
#[derive(Debug, Clone)]
pub struct TpState {
    pub id: u64,
    /// Path weight.
    pub wc: f64,
    /// Path weight minus the accumulated frame minima, used for pruning.
    pub wn: f64,
    pub depth: u8,
    pub layers: [u32; MAX_LAYER],
    pub units: [u32; MAX_LAYER],
    pub stack: PushdownStack,
    pub history: History,
    pub element: Option<PoolIdx>,
}

impl TpState {
    /// The hypothesis every search starts from.
    pub fn initial(wc: f64, history: History) -> Self {
        Self {
            id: 0,
            wc,
            wn: 0.0,
            depth: 0,
            layers: [0; MAX_LAYER],
            units: [0; MAX_LAYER],
            stack: PushdownStack::new(),
            history,
            element: None,
        }
    }

    pub fn unit(&self) -> usize {
        self.units[self.depth as usize] as usize
    }

    pub fn state(&self) -> u32 {
        self.layers[self.depth as usize]
    }
}

impl Hypothesis for TpState {
    fn key(&self) -> u64 {
        self.id
    }

    fn score(&self) -> f64 {
        self.wc
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
}

/// Packs the layer stack of a hypothesis into a 64-bit id.
///
/// The id is mixed-radix: `l0 + ns0 * (u1' + nu' * (l1 + maxns * (u2' + ...)))`
/// with `u' = u + 1` so deeper hypotheses never collide with shallower ones.
#[derive(Debug, Clone, Copy)]
pub struct Packing {
    ns0: u64,
    nunits: u64,
    maxns: u64,
}

impl Packing {
    /// Check the composition of `model` and derive the packing.
    pub fn new(model: &FstModel) -> Result<Self> {
        let units = model.units();
        let nunits = units.len() as u64;
        for (index, unit) in units.iter().enumerate().filter(|(_, u)| u.sub) {
            if let Some(t) = unit.transitions().iter().find(|t| t.input >= 0 && t.input as u64 >= nunits) {
                return Err(SearchError::Structure(format!(
                    "unit {}: transition {} references missing unit {}",
                    index, t.id, t.input
                )));
            }
        }
        let packing = Self {
            ns0: units.first().map_or(1, |u| u.states.max(1) as u64),
            nunits,
            maxns: units.iter().map(|u| u.states as u64).max().unwrap_or(1).max(1),
        };
        if units.iter().any(|u| u.sub) {
            let radix = (nunits + 1)
                .checked_mul(packing.maxns)
                .ok_or_else(Self::too_large)?;
            let mut bound = packing.ns0;
            for _ in 1..MAX_LAYER {
                bound = bound.checked_mul(radix).ok_or_else(Self::too_large)?;
            }
        }
        Ok(packing)
    }

    fn too_large() -> SearchError {
        SearchError::Structure("composed state space exceeds 64-bit state ids".to_string())
    }

    pub fn id(&self, layers: &[u32; MAX_LAYER], units: &[u32; MAX_LAYER], depth: u8) -> u64 {
        let mut acc = 0u64;
        for d in (1..=depth as usize).rev() {
            acc = (units[d] as u64 + 1) + (self.nunits + 1) * (layers[d] as u64 + self.maxns * acc);
        }
        layers[0] as u64 + self.ns0 * acc
    }

    /// States of unit 0, the range partitioned between jobs.
    pub fn primary_states(&self) -> u64 {
        self.ns0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fst::{Transducer, Transition, Unit};

    fn composed(reference: i32) -> FstModel {
        let mut top = Unit::new("top", 2);
        top.sub = true;
        top.finals = vec![1];
        top.transitions = vec![Transition::new(0, 1, reference, 5, 0.0)];
        let mut word = Unit::new("word", 3);
        word.finals = vec![2];
        word.transitions = vec![Transition::new(0, 1, 0, -1, 0.0), Transition::new(1, 2, 1, -1, 0.0)];
        FstModel::load(&Transducer::new(vec![top, word]), None, false).unwrap()
    }

    #[test]
    fn test_ids_are_distinct_across_depths() {
        let packing = Packing::new(&composed(1)).unwrap();
        let mut seen = std::collections::HashSet::new();
        for l0 in 0..2 {
            assert!(seen.insert(packing.id(&[l0, 0, 0, 0], &[0; MAX_LAYER], 0)));
            for l1 in 0..3 {
                for u1 in 0..2 {
                    assert!(seen.insert(packing.id(&[l0, l1, 0, 0], &[0, u1, 0, 0], 1)));
                }
            }
        }
    }

    #[test]
    fn test_missing_unit_reference() {
        let err = Packing::new(&composed(7)).unwrap_err();
        assert!(matches!(err, SearchError::Structure(_)));
    }

    #[test]
    fn test_initial_state() {
        let s = TpState::initial(2.5, History::default());
        assert_eq!(s.id, 0);
        assert_eq!((s.unit(), s.state()), (0, 0));
        assert_eq!(s.score(), 2.5);
    }
}
