//! Weight pushing towards the initial state.
//!
//! The potential of a state is its shortest distance to any final state.
//! Re-weighting every transition by `potential(ter) - potential(ini)` makes
//! all weights non-negative reduced costs and turns the remaining distance
//! into an admissible A* heuristic. The initial state's potential is kept as
//! a path-weight offset.

use std::collections::VecDeque;
use tracing::debug;

use super::model::{FstModel, ModelUnit};
use crate::error::{Result, SearchError};

/// Shortest distance from every state to a final state.
///
/// Unreachable states get `f64::INFINITY`.
pub fn potentials(unit: &ModelUnit) -> Result<Vec<f64>> {
    let n = unit.states as usize;
    let mut pot = vec![f64::INFINITY; n];
    let mut queued = vec![false; n];
    let mut relaxed = vec![0u32; n];
    let mut queue = VecDeque::new();
    for s in 0..unit.states {
        if unit.is_final(s) {
            pot[s as usize] = 0.0;
            queued[s as usize] = true;
            queue.push_back(s);
        }
    }
    while let Some(s) = queue.pop_front() {
        queued[s as usize] = false;
        for t in unit.incoming(s) {
            let w = pot[s as usize] + t.weight;
            let ini = t.ini as usize;
            if w < pot[ini] {
                pot[ini] = w;
                relaxed[ini] += 1;
                if relaxed[ini] > unit.states {
                    return Err(SearchError::Structure(format!(
                        "unit {}: negative weight cycle",
                        unit.name
                    )));
                }
                if !queued[ini] {
                    queued[ini] = true;
                    queue.push_back(t.ini);
                }
            }
        }
    }
    Ok(pot)
}

/// Push the weights of every unit. Calling it twice has no further effect.
pub fn push_weights(model: &mut FstModel) -> Result<()> {
    if model.is_pushed() {
        return Ok(());
    }
    for unit in model.units_mut() {
        let pot = potentials(unit)?;
        for t in unit.transitions_mut() {
            let ter = pot[t.ter as usize];
            if ter.is_infinite() {
                t.weight = f64::INFINITY;
            } else {
                t.weight += ter - pot[t.ini as usize];
            }
        }
        unit.potential0 = pot[0];
        debug!(unit = %unit.name, potential0 = unit.potential0, "Weights pushed");
    }
    model.set_pushed();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fst::{Transducer, Transition, Unit};

    fn diamond() -> FstModel {
        let mut unit = Unit::new("diamond", 4);
        unit.finals = vec![3];
        unit.transitions = vec![
            Transition::new(0, 1, 0, 0, 1.0),
            Transition::new(0, 2, 1, 1, 4.0),
            Transition::new(1, 3, 2, 2, 5.0),
            Transition::new(2, 3, 3, 3, 1.0),
        ];
        FstModel::load(&Transducer::new(vec![unit]), None, true).unwrap()
    }

    #[test]
    fn test_potentials() {
        let model = diamond();
        let pot = potentials(&model.units()[0]).unwrap();
        assert_eq!(pot, vec![5.0, 5.0, 1.0, 0.0]);
    }

    #[test]
    fn test_push_weights_preserves_path_weights() {
        let mut model = diamond();
        push_weights(&mut model).unwrap();
        push_weights(&mut model).unwrap();
        let unit = &model.units()[0];
        assert_eq!(unit.potential0, 5.0);
        let w: Vec<f64> = unit.transitions().iter().map(|t| t.weight).collect();
        // best path 0-2-3 becomes free, 0-1-3 costs its excess
        assert_eq!(w, vec![1.0, 0.0, 0.0, 0.0]);
        assert!(w.iter().all(|&x| x >= 0.0));
    }

    #[test]
    fn test_dead_end_gets_infinite_weight() {
        let mut unit = Unit::new("dead", 3);
        unit.finals = vec![1];
        unit.transitions = vec![Transition::new(0, 1, 0, 0, 1.0), Transition::new(0, 2, 0, 0, 1.0)];
        let mut model = FstModel::load(&Transducer::new(vec![unit]), None, true).unwrap();
        push_weights(&mut model).unwrap();
        assert!(model.units()[0].transitions()[1].weight.is_infinite());
    }
}
