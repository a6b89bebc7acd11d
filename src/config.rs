//! Decoder configuration.
//!
//! Options are layered through `figment`: built-in defaults, then
//! `wfst-search.toml`, then `wfst-search.yaml`, then `WFST_`-prefixed
//! environment variables (`__` separates sections, e.g.
//! `WFST_ASTAR__QUEUE_SIZE=4096`). Every configuration is validated before it
//! reaches a decoder.

use figment::{
    providers::{Env, Format, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

use crate::constants::memory::DEFAULT_MAX_ELEMENTS;
use crate::constants::search::MAX_PATHS;
use crate::error::{Result, SearchError};

/// Declares an option enum parsed case-insensitively by prefix: a value is
/// accepted when it starts with the option name, names are tried in order.
macro_rules! option_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            pub const NAMES: &'static [&'static str] = &[$($text),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = SearchError;

            fn from_str(value: &str) -> Result<Self> {
                let lower = value.trim().to_ascii_lowercase();
                $(
                    if lower.starts_with($text) {
                        return Ok($name::$variant);
                    }
                )+
                Err(SearchError::Config(format!(
                    "unknown {} '{}' (expected one of {:?})",
                    stringify!($name),
                    value,
                    Self::NAMES
                )))
            }
        }

        impl TryFrom<String> for $name {
            type Error = SearchError;

            fn try_from(value: String) -> Result<Self> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.as_str().to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

option_enum! {
    /// Search strategy.
    Algorithm {
        /// Time-synchronous propagation.
        Tp => "tp",
        /// Best-first A* search.
        Astar => "as",
        /// Shortest-distance dynamic programming.
        Sdp => "sdp",
    }
}

option_enum! {
    /// Path history representation.
    BacktrackMode {
        /// Transition index chains; needs the source transducer.
        Transitions => "t",
        /// Output symbol chains.
        Outputs => "os",
        /// Recombination lattice.
        Lattice => "lat",
    }
}

option_enum! {
    /// A* open queue implementation.
    QueueKind {
        Heap => "heap",
        Tree => "tree",
    }
}

option_enum! {
    /// A* state heuristic.
    Heuristic {
        None => "none",
        Exist => "exist",
        /// Push weights and start from the initial state's potential.
        Potential => "pot",
    }
}

option_enum! {
    /// A* time-variant weight heuristic.
    WeightHeuristic {
        None => "none",
        Exist => "exist",
        MinIsu => "minisu",
        /// Subtract per-frame minima from the weight rows.
        Min => "min",
    }
}

// Default value functions for serde defaults
fn default_numpaths() -> u32 { 1 }
fn default_jobs() -> usize { 1 }
fn default_forward() -> bool { true }
fn default_max_elements() -> usize { DEFAULT_MAX_ELEMENTS }
fn default_log_level() -> String { "info".to_string() }
fn default_queue() -> QueueKind { QueueKind::Heap }
fn default_heuristic() -> Heuristic { Heuristic::None }
fn default_weight_heuristic() -> WeightHeuristic { WeightHeuristic::None }
fn default_algorithm() -> Algorithm { Algorithm::Tp }
fn default_backtrack() -> BacktrackMode { BacktrackMode::Outputs }

/// A* options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AstarConfig {
    /// Open queue length; zero selects the default length without pruning.
    #[serde(default)]
    pub queue_size: usize,
    #[serde(default = "default_queue")]
    pub queue: QueueKind,
    /// Frame window behind the newest frame; zero disables.
    #[serde(default)]
    pub frame_prune: u32,
    /// Weight beam relative to the best weight of a frame; zero disables.
    #[serde(default)]
    pub weight_prune: f64,
    #[serde(default = "default_heuristic")]
    pub heuristic: Heuristic,
    #[serde(default = "default_weight_heuristic")]
    pub weight_heuristic: WeightHeuristic,
}

impl Default for AstarConfig {
    fn default() -> Self {
        Self {
            queue_size: 0,
            queue: default_queue(),
            frame_prune: 0,
            weight_prune: 0.0,
            heuristic: default_heuristic(),
            weight_heuristic: default_weight_heuristic(),
        }
    }
}

/// TP options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TpConfig {
    /// Worker count, a power of two.
    #[serde(default = "default_jobs")]
    pub jobs: usize,
    /// Weight beam relative to the best hypothesis of a frame; zero disables.
    #[serde(default)]
    pub weight_prune: f64,
    /// Target hypothesis count for histogram pruning; zero disables.
    #[serde(default)]
    pub hypothesis_prune: u32,
}

impl Default for TpConfig {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            weight_prune: 0.0,
            hypothesis_prune: 0,
        }
    }
}

/// Shortest-distance options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdpConfig {
    /// Relative beam in `0..=1`; zero disables.
    #[serde(default)]
    pub prune: f64,
    /// Drop epsilon transitions from the result path.
    #[serde(default)]
    pub eps_remove: bool,
    #[serde(default = "default_forward")]
    pub forward: bool,
}

impl Default for SdpConfig {
    fn default() -> Self {
        Self {
            prune: 0.0,
            eps_remove: false,
            forward: default_forward(),
        }
    }
}

/// Pool limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Record limit per pool.
    #[serde(default = "default_max_elements")]
    pub max_elements: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_elements: default_max_elements(),
        }
    }
}

/// Log output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Complete decoder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: Algorithm,
    #[serde(default = "default_backtrack")]
    pub backtrack: BacktrackMode,
    /// Number of best paths to find.
    #[serde(default = "default_numpaths")]
    pub numpaths: u32,
    /// Merge hypotheses regardless of their pushdown stacks.
    #[serde(default)]
    pub stack_prune: bool,
    /// Excess weight above which recombined lattice paths are dropped.
    #[serde(default)]
    pub lattice_prune: f64,
    /// Do not keep a copy of the source transducer.
    #[serde(default)]
    pub fast: bool,
    #[serde(default)]
    pub astar: AstarConfig,
    #[serde(default)]
    pub tp: TpConfig,
    #[serde(default)]
    pub sdp: SdpConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            backtrack: default_backtrack(),
            numpaths: default_numpaths(),
            stack_prune: false,
            lattice_prune: 0.0,
            fast: false,
            astar: AstarConfig::default(),
            tp: TpConfig::default(),
            sdp: SdpConfig::default(),
            memory: MemoryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl SearchConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables prefixed `WFST_` (highest priority)
    /// 2. wfst-search.yaml (if exists)
    /// 3. wfst-search.toml (if exists)
    /// 4. Built-in defaults (lowest priority)
    pub fn load() -> Result<Self> {
        Self::extract(
            Self::default_figment()
                .merge(Toml::file("wfst-search.toml"))
                .merge(Yaml::file("wfst-search.yaml"))
                .merge(Env::prefixed("WFST_").split("__")),
        )
    }

    /// Load defaults overlaid with one TOML or YAML file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SearchError::Config(format!(
                "configuration file {} not found",
                path.display()
            )));
        }
        let figment = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::default_figment().merge(Yaml::file(path)),
            _ => Self::default_figment().merge(Toml::file(path)),
        };
        debug!(path = %path.display(), "Loading configuration file");
        Self::extract(figment)
    }

    /// Generate default configuration values
    fn default_figment() -> Figment {
        Figment::from(Serialized::defaults(SearchConfig::default()))
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: SearchConfig = figment
            .extract()
            .map_err(|e| SearchError::Config(format!("Failed to load configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check option ranges and combinations.
    pub fn validate(&self) -> Result<()> {
        if self.numpaths == 0 || self.numpaths > MAX_PATHS {
            return Err(SearchError::Config(format!(
                "numpaths must be between 1 and {}",
                MAX_PATHS
            )));
        }
        for (name, value) in [
            ("lattice_prune", self.lattice_prune),
            ("astar.weight_prune", self.astar.weight_prune),
            ("tp.weight_prune", self.tp.weight_prune),
        ] {
            if !(value >= 0.0 && value.is_finite()) {
                return Err(SearchError::Config(format!("{} must be >= 0", name)));
            }
        }
        if !(0.0..=1.0).contains(&self.sdp.prune) {
            return Err(SearchError::Config("sdp.prune must be between 0 and 1".to_string()));
        }
        if !self.tp.jobs.is_power_of_two() {
            return Err(SearchError::Config("tp.jobs must be a power of two".to_string()));
        }
        if self.tp.jobs > 1 && self.backtrack == BacktrackMode::Lattice {
            return Err(SearchError::Config(
                "lattice backtracking not possible with multiple jobs".to_string(),
            ));
        }
        if self.tp.jobs > 1 && self.tp.hypothesis_prune > 0 {
            return Err(SearchError::Config(
                "hypothesis pruning not possible with multiple jobs".to_string(),
            ));
        }
        if self.fast && self.backtrack == BacktrackMode::Transitions {
            return Err(SearchError::Config("fast loading not possible with bt=t".to_string()));
        }
        if self.algorithm == Algorithm::Sdp && self.numpaths > 1 {
            return Err(SearchError::Config("sdp finds a single path only".to_string()));
        }
        if self.memory.max_elements == 0 {
            return Err(SearchError::Config("memory.max_elements must be > 0".to_string()));
        }
        Ok(())
    }

    /// Effective length of the A* open queue.
    pub fn astar_queue_size(&self) -> usize {
        if self.astar.queue_size == 0 {
            crate::constants::astar::DEFAULT_QUEUE_SIZE
        } else {
            self.astar.queue_size
        }
    }

    /// Export configuration to TOML format
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SearchError::Config(format!("Failed to serialize to TOML: {}", e)))
    }

    /// Export configuration to YAML format
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| SearchError::Config(format!("Failed to serialize to YAML: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = SearchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.algorithm, Algorithm::Tp);
        assert_eq!(config.backtrack, BacktrackMode::Outputs);
        assert_eq!(config.astar_queue_size(), 32_767);
    }

    #[test]
    fn test_prefix_parsing() {
        assert_eq!("ASTAR".parse::<Algorithm>().unwrap(), Algorithm::Astar);
        assert_eq!("lattice".parse::<BacktrackMode>().unwrap(), BacktrackMode::Lattice);
        assert_eq!("minisu".parse::<WeightHeuristic>().unwrap(), WeightHeuristic::MinIsu);
        assert_eq!("min".parse::<WeightHeuristic>().unwrap(), WeightHeuristic::Min);
        assert_eq!("potential".parse::<Heuristic>().unwrap(), Heuristic::Potential);
        assert!(matches!("x".parse::<Algorithm>(), Err(SearchError::Config(_))));
    }

    #[test]
    fn test_validation() {
        let mut config = SearchConfig::default();
        config.numpaths = 0;
        assert!(config.validate().is_err());

        let mut config = SearchConfig::default();
        config.tp.jobs = 3;
        assert!(config.validate().is_err());

        let mut config = SearchConfig::default();
        config.tp.jobs = 4;
        config.backtrack = BacktrackMode::Lattice;
        assert!(config.validate().is_err());

        let mut config = SearchConfig::default();
        config.tp.jobs = 2;
        config.tp.hypothesis_prune = 100;
        assert!(config.validate().is_err());

        let mut config = SearchConfig::default();
        config.astar.weight_prune = -1.0;
        assert!(config.validate().is_err());

        let mut config = SearchConfig::default();
        config.fast = true;
        config.backtrack = BacktrackMode::Transitions;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "algorithm = \"astar\"\nnumpaths = 3\n[astar]\nqueue = \"tree\"\nheuristic = \"pot\""
        )
        .unwrap();
        let config = SearchConfig::load_from(file.path()).unwrap();
        assert_eq!(config.algorithm, Algorithm::Astar);
        assert_eq!(config.numpaths, 3);
        assert_eq!(config.astar.queue, QueueKind::Tree);
        assert_eq!(config.astar.heuristic, Heuristic::Potential);
        assert_eq!(config.tp.jobs, 1);
    }

    #[test]
    fn test_load_from_yaml_rejects_invalid() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "tp:\n  jobs: 6").unwrap();
        assert!(matches!(SearchConfig::load_from(file.path()), Err(SearchError::Config(_))));
    }

    #[test]
    fn test_toml_export() {
        let mut config = SearchConfig::default();
        config.backtrack = BacktrackMode::Lattice;
        let text = config.to_toml().unwrap();
        assert!(text.contains("backtrack = \"lat\""));
        let back: SearchConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, config);
        assert!(config.to_yaml().unwrap().contains("algorithm: tp"));
    }
}
