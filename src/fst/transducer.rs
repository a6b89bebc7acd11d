//! Exchange format for transducers, used for decoder input and results.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::constants::fst::EPSILON;
use crate::error::{ErrorContext, Result};

/// Weight semiring of a transducer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Semiring {
    /// Additive weights, lower is better.
    #[default]
    Tropical,
    /// Probabilities, converted to `-ln(p)` at load time.
    Probability,
}

fn epsilon() -> i32 {
    EPSILON
}

/// One edge of a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub ini: u32,
    pub ter: u32,
    #[serde(default = "epsilon")]
    pub input: i32,
    #[serde(default = "epsilon")]
    pub output: i32,
    #[serde(default)]
    pub stack: i32,
    #[serde(default)]
    pub weight: f64,
}

impl Transition {
    /// Transition without pushdown symbol.
    pub fn new(ini: u32, ter: u32, input: i32, output: i32, weight: f64) -> Self {
        Self {
            ini,
            ter,
            input,
            output,
            stack: 0,
            weight,
        }
    }

    /// Set the pushdown symbol.
    pub fn with_stack(mut self, stack: i32) -> Self {
        self.stack = stack;
        self
    }
}

/// One transducer layer. State 0 is the initial state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Unit {
    #[serde(default)]
    pub name: String,
    pub states: u32,
    #[serde(default)]
    pub finals: Vec<u32>,
    /// Input symbols of this unit name sub-units to descend into.
    #[serde(default)]
    pub sub: bool,
    /// Total path weight, set on decoder results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

impl Unit {
    pub fn new(name: impl Into<String>, states: u32) -> Self {
        Self {
            name: name.into(),
            states,
            ..Self::default()
        }
    }

    /// Non-epsilon output symbols along the transition table, in order.
    ///
    /// Meaningful for path units, whose transitions are stored in path order.
    pub fn output_sequence(&self) -> Vec<i32> {
        self.transitions
            .iter()
            .filter(|t| t.output >= 0)
            .map(|t| t.output)
            .collect()
    }

    /// Non-epsilon input symbols along the transition table, in order.
    pub fn input_sequence(&self) -> Vec<i32> {
        self.transitions
            .iter()
            .filter(|t| t.input >= 0)
            .map(|t| t.input)
            .collect()
    }

    /// Sum of all transition weights.
    pub fn total_weight(&self) -> f64 {
        self.transitions.iter().map(|t| t.weight).sum()
    }

    pub fn is_final(&self, state: u32) -> bool {
        self.finals.contains(&state)
    }
}

/// A set of units with optional symbol tables.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Transducer {
    #[serde(default)]
    pub semiring: Semiring,
    pub units: Vec<Unit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_symbols: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_symbols: Option<Vec<String>>,
}

impl Transducer {
    pub fn new(units: Vec<Unit>) -> Self {
        Self {
            units,
            ..Self::default()
        }
    }

    /// Total transition count over all units.
    pub fn transition_count(&self) -> usize {
        self.units.iter().map(|u| u.transitions.len()).sum()
    }

    /// Read a transducer from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_defaults() {
        let json = r#"{"units":[{"states":2,"finals":[1],"transitions":[{"ini":0,"ter":1,"output":4}]}]}"#;
        let fst: Transducer = serde_json::from_str(json).unwrap();
        let t = &fst.units[0].transitions[0];
        assert_eq!(fst.semiring, Semiring::Tropical);
        assert_eq!(t.input, EPSILON);
        assert_eq!(t.output, 4);
        assert_eq!(t.stack, 0);
        assert_eq!(fst.units[0].output_sequence(), vec![4]);
    }

    #[test]
    fn test_from_json_file_reports_context() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{").unwrap();
        let err = Transducer::from_json_file(&path).unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }
}
