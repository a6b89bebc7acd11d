//! Search orchestrator.
//!
//! [`FstSearch`] owns the loaded model and one decoder built for the
//! configured algorithm:
//!
//! ```text
//! Free --load--> Begin --isearch--> Searching --isearch(last)--> End
//! ```
//!
//! `restart` rebuilds the decoder from the current configuration and returns
//! to `Begin`; `unload` releases everything. Backtracking from `End` restarts
//! implicitly. A decoder failure releases the decoder; the model stays loaded
//! so `restart` can continue.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::astar::AstarDecoder;
use crate::config::{Algorithm, Heuristic, SearchConfig};
use crate::error::{Result, SearchError};
use crate::fst::{push_weights, FstModel, Transducer};
use crate::memory::PoolStats;
use crate::sdp::{SdpDecoder, ShortestDistance};
use crate::telemetry;
use crate::tp::{FeedOptions, TpDecoder};
use crate::weights::Weights;

/// Lifecycle position of an [`FstSearch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    /// No decoder.
    Free,
    /// Decoder ready, nothing fed yet.
    Begin,
    /// Iterative TP search in progress.
    Searching,
    /// Search complete; backtrack or restart.
    End,
}

/// Diagnostics of the current search.
#[derive(Debug, Clone, Default)]
pub struct SearchStats {
    pub expanded_states: u64,
    pub memory_bytes: usize,
    /// Time spent in `isearch` and `backtrack` since the search began.
    pub elapsed: Duration,
    pub pools: Vec<PoolStats>,
}

/// Builds the shortest-distance engine of every SDP search.
pub type EngineFactory = Arc<dyn Fn() -> Box<dyn ShortestDistance> + Send + Sync>;

enum Decoder {
    Astar(AstarDecoder),
    Tp(TpDecoder),
    Sdp(SdpDecoder),
}

impl Decoder {
    fn algorithm(&self) -> Algorithm {
        match self {
            Decoder::Astar(_) => Algorithm::Astar,
            Decoder::Tp(_) => Algorithm::Tp,
            Decoder::Sdp(_) => Algorithm::Sdp,
        }
    }

    fn search(&mut self, weights: &Weights, options: FeedOptions) -> Result<()> {
        match self {
            Decoder::Astar(d) => d.search(weights),
            Decoder::Tp(d) => d.feed(weights, options),
            Decoder::Sdp(d) => d.search(weights),
        }
    }

    fn backtrack(&self) -> Result<Transducer> {
        match self {
            Decoder::Astar(d) => d.backtrack(),
            Decoder::Tp(d) => d.backtrack(),
            Decoder::Sdp(d) => d.backtrack(),
        }
    }

    fn expanded_states(&self) -> u64 {
        match self {
            Decoder::Astar(d) => d.expanded_states(),
            Decoder::Tp(d) => d.expanded_states(),
            Decoder::Sdp(d) => d.expanded_states(),
        }
    }

    fn memory_bytes(&self) -> usize {
        match self {
            Decoder::Astar(d) => d.memory_bytes(),
            Decoder::Tp(d) => d.memory_bytes(),
            Decoder::Sdp(d) => d.memory_bytes(),
        }
    }

    fn pool_stats(&self) -> Vec<PoolStats> {
        match self {
            Decoder::Astar(d) => d.pool_stats(),
            Decoder::Tp(d) => d.pool_stats(),
            Decoder::Sdp(d) => d.pool_stats(),
        }
    }
}

/// Decoder front end: load a transducer, feed weights, collect paths.
pub struct FstSearch {
    config: SearchConfig,
    state: SearchState,
    model: Option<Arc<FstModel>>,
    decoder: Option<Decoder>,
    engine: Option<EngineFactory>,
    stats: SearchStats,
}

impl FstSearch {
    pub fn new(config: SearchConfig) -> Result<Self> {
        config.validate()?;
        telemetry::register_metrics();
        Ok(Self {
            config,
            state: SearchState::Free,
            model: None,
            decoder: None,
            engine: None,
            stats: SearchStats::default(),
        })
    }

    /// Use a custom shortest-distance engine for SDP searches.
    pub fn with_shortest_distance<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn ShortestDistance> + Send + Sync + 'static,
    {
        self.engine = Some(Arc::new(factory));
        self
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Replace the configuration. Takes effect at the next restart.
    pub fn configure(&mut self, config: SearchConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub fn state(&self) -> SearchState {
        self.state
    }

    pub fn stats(&self) -> &SearchStats {
        &self.stats
    }

    /// Load `source` (one unit, or all units for composition) and prepare
    /// a decoder.
    pub fn load(&mut self, source: &Transducer, unit: Option<usize>) -> Result<()> {
        self.unload();
        let model = FstModel::load(source, unit, self.config.fast)?;
        self.model = Some(Arc::new(model));
        self.restart()
    }

    /// Drop the running search and build a fresh decoder. Does nothing
    /// without a loaded model.
    pub fn restart(&mut self) -> Result<()> {
        let Some(model) = self.model.clone() else {
            return Ok(());
        };
        self.release_decoder();
        self.config.validate()?;
        let decoder = self.build(model)?;
        info!(algorithm = %decoder.algorithm(), "Search restarted");
        self.decoder = Some(decoder);
        self.state = SearchState::Begin;
        Ok(())
    }

    fn build(&self, model: Arc<FstModel>) -> Result<Decoder> {
        let config = &self.config;
        Ok(match config.algorithm {
            Algorithm::Tp => Decoder::Tp(TpDecoder::new(model, config)?),
            Algorithm::Astar => {
                let model = if config.astar.heuristic == Heuristic::Potential && !model.is_pushed() {
                    let mut pushed = FstModel::clone(&model);
                    push_weights(&mut pushed)?;
                    Arc::new(pushed)
                } else {
                    model
                };
                Decoder::Astar(AstarDecoder::new(model, config)?)
            }
            Algorithm::Sdp => {
                let engine = self.engine.as_ref().map(|factory| factory());
                Decoder::Sdp(SdpDecoder::new(model, config, engine)?)
            }
        })
    }

    fn release_decoder(&mut self) {
        self.decoder = None;
        self.state = SearchState::Free;
    }

    /// Release the model and the decoder.
    pub fn unload(&mut self) {
        if self.model.is_some() {
            debug!("Transducer unloaded");
        }
        self.release_decoder();
        self.model = None;
    }

    /// Feed weights. Only TP accepts several calls; every other algorithm
    /// needs `options.last`. An empty weight matrix runs a time-invariant
    /// search in one call.
    pub fn isearch(&mut self, weights: &Weights, options: FeedOptions) -> Result<()> {
        let algorithm = match (self.state, self.decoder.as_ref()) {
            (SearchState::Free, _) | (_, None) => {
                return Err(SearchError::Sequence("load transducer first".to_string()))
            }
            (SearchState::End, _) => return Err(SearchError::Sequence("restart search first".to_string())),
            (SearchState::Searching, Some(d)) if d.algorithm() != Algorithm::Tp => {
                return Err(SearchError::Sequence(
                    "iterative decoding not implemented for that algo".to_string(),
                ))
            }
            (_, Some(d)) => d.algorithm(),
        };
        if weights.is_time_invariant() {
            if algorithm == Algorithm::Sdp {
                return Err(SearchError::Sequence(
                    "timeinvariant decoding not implemented for this algo".to_string(),
                ));
            }
            if !options.last {
                return Err(SearchError::Sequence(
                    "timeinvariant iterative decoding not possible".to_string(),
                ));
            }
        } else if !options.last && algorithm != Algorithm::Tp {
            return Err(SearchError::Sequence(
                "iterative decoding not implemented for that algo".to_string(),
            ));
        }
        if options.start && algorithm != Algorithm::Tp {
            return Err(SearchError::Sequence(
                "start option not implemented for that algo".to_string(),
            ));
        }
        if self.state == SearchState::Begin {
            self.stats = SearchStats::default();
        }

        let Some(decoder) = self.decoder.as_mut() else {
            return Err(SearchError::Sequence("load transducer first".to_string()));
        };
        self.state = SearchState::Searching;
        let started = Instant::now();
        let outcome = decoder.search(weights, options);
        self.stats.elapsed += started.elapsed();

        if let Err(e) = outcome {
            warn!(algorithm = %algorithm, error = %e, "Search failed, decoder released");
            telemetry::record_failure(algorithm.as_str(), &e);
            self.release_decoder();
            return Err(e);
        }
        let before = self.stats.expanded_states;
        self.refresh_stats();
        if options.last {
            self.state = SearchState::End;
        }
        telemetry::record_search(
            algorithm.as_str(),
            self.stats.expanded_states.saturating_sub(before),
            self.stats.memory_bytes,
            started.elapsed(),
            options.last,
        );
        debug!(
            algorithm = %algorithm,
            frames = weights.frames(),
            expanded = self.stats.expanded_states,
            memory_bytes = self.stats.memory_bytes,
            state = ?self.state,
            "Search call done"
        );
        Ok(())
    }

    fn refresh_stats(&mut self) {
        if let Some(decoder) = &self.decoder {
            self.stats.expanded_states = decoder.expanded_states();
            self.stats.memory_bytes = decoder.memory_bytes();
            self.stats.pools = decoder.pool_stats();
        }
    }

    /// Best paths found. While a TP search is running these are the paths
    /// so far; after the search the decoder is restarted.
    pub fn backtrack(&mut self) -> Result<Transducer> {
        let decoder = match (self.state, self.decoder.as_ref()) {
            (SearchState::Searching, Some(d)) if d.algorithm() != Algorithm::Tp => {
                return Err(SearchError::Sequence(
                    "backtracking while search not possible for this algo".to_string(),
                ))
            }
            (SearchState::Searching | SearchState::End, Some(d)) => d,
            _ => return Err(SearchError::Sequence("no search before backtracking".to_string())),
        };
        let started = Instant::now();
        let result = decoder.backtrack();
        self.stats.elapsed += started.elapsed();
        let result = result.map_err(|e| {
            telemetry::record_failure(decoder.algorithm().as_str(), &e);
            e
        })?;
        info!(
            paths = result.units.len(),
            weight = result.units.first().and_then(|u| u.weight),
            "Backtrack done"
        );
        if self.state == SearchState::End {
            self.restart()?;
        }
        Ok(result)
    }

    /// Load, search all of `weights`, backtrack and unload.
    pub fn search(&mut self, source: &Transducer, unit: Option<usize>, weights: &Weights) -> Result<Transducer> {
        self.load(source, unit)?;
        self.isearch(weights, FeedOptions::last())?;
        let result = self.backtrack()?;
        self.unload();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtrack::PathStep;
    use crate::fst::{ModelUnit, Transition, Unit};

    fn chain() -> Transducer {
        let mut unit = Unit::new("chain", 3);
        unit.finals = vec![2];
        unit.transitions = vec![Transition::new(0, 1, 0, 0, 1.0), Transition::new(1, 2, 1, 1, 2.0)];
        Transducer::new(vec![unit])
    }

    fn weights() -> Weights {
        Weights::from_rows(vec![vec![0.5, 9.0], vec![9.0, 0.25]]).unwrap()
    }

    fn search(algorithm: Algorithm) -> FstSearch {
        let mut config = SearchConfig::default();
        config.algorithm = algorithm;
        FstSearch::new(config).unwrap()
    }

    fn message(result: Result<impl Sized>) -> String {
        match result {
            Err(SearchError::Sequence(m)) | Err(SearchError::Config(m)) => m,
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[test]
    fn test_sequence_errors_before_load() {
        let mut search = search(Algorithm::Tp);
        assert_eq!(search.state(), SearchState::Free);
        assert_eq!(message(search.isearch(&weights(), FeedOptions::last())), "load transducer first");
        assert_eq!(message(search.backtrack()), "no search before backtracking");
        assert!(search.restart().is_ok());
        assert_eq!(search.state(), SearchState::Free);
    }

    #[test]
    fn test_full_cycle_restarts_after_backtrack() {
        let mut search = search(Algorithm::Tp);
        search.load(&chain(), None).unwrap();
        assert_eq!(search.state(), SearchState::Begin);
        assert_eq!(message(search.backtrack()), "no search before backtracking");

        search.isearch(&weights(), FeedOptions::last()).unwrap();
        assert_eq!(search.state(), SearchState::End);
        assert_eq!(message(search.isearch(&weights(), FeedOptions::last())), "restart search first");
        assert!(search.stats().expanded_states > 0);
        assert!(!search.stats().pools.is_empty());

        let result = search.backtrack().unwrap();
        assert_eq!(result.units[0].weight, Some(3.75));
        assert_eq!(search.state(), SearchState::Begin);

        search.isearch(&weights(), FeedOptions::last()).unwrap();
        assert_eq!(search.backtrack().unwrap().units[0].weight, Some(3.75));
    }

    #[test]
    fn test_iterative_tp() {
        let mut search = search(Algorithm::Tp);
        search.load(&chain(), Some(0)).unwrap();
        let rows: Vec<Vec<f64>> = weights().into();
        let first = Weights::from_rows(vec![rows[0].clone()]).unwrap();
        let second = Weights::from_rows(vec![rows[1].clone()]).unwrap();

        search.isearch(&first, FeedOptions::default()).unwrap();
        assert_eq!(search.state(), SearchState::Searching);
        let partial = search.backtrack().unwrap();
        assert_eq!(partial.units[0].output_sequence(), vec![0]);
        assert_eq!(search.state(), SearchState::Searching);

        assert_eq!(
            message(search.isearch(&Weights::empty(), FeedOptions::default())),
            "timeinvariant iterative decoding not possible"
        );
        search.isearch(&second, FeedOptions::last()).unwrap();
        assert_eq!(search.state(), SearchState::End);
        assert_eq!(search.backtrack().unwrap().units[0].weight, Some(3.75));
    }

    #[test]
    fn test_option_checks_per_algorithm() {
        let mut search = search(Algorithm::Astar);
        search.load(&chain(), None).unwrap();
        assert_eq!(
            message(search.isearch(&weights(), FeedOptions::default())),
            "iterative decoding not implemented for that algo"
        );
        let start = FeedOptions {
            last: true,
            start: true,
        };
        assert_eq!(message(search.isearch(&weights(), start)), "start option not implemented for that algo");
        assert_eq!(search.state(), SearchState::Begin);

        let mut config = search.config().clone();
        config.algorithm = Algorithm::Sdp;
        search.configure(config).unwrap();
        search.restart().unwrap();
        assert_eq!(
            message(search.isearch(&Weights::empty(), FeedOptions::last())),
            "timeinvariant decoding not implemented for this algo"
        );
    }

    #[test]
    fn test_configure_switches_algorithm_at_restart() {
        let mut search = search(Algorithm::Tp);
        search.load(&chain(), None).unwrap();
        let mut config = search.config().clone();
        config.algorithm = Algorithm::Astar;
        search.configure(config).unwrap();
        search.restart().unwrap();
        search.isearch(&weights(), FeedOptions::last()).unwrap();
        let result = search.backtrack().unwrap();
        assert_eq!(result.units[0].weight, Some(3.75));
        assert_eq!(result.units[0].output_sequence(), vec![0, 1]);

        let mut bad = search.config().clone();
        bad.tp.jobs = 3;
        assert!(search.configure(bad).is_err());
        assert_eq!(search.config().algorithm, Algorithm::Astar);
    }

    #[test]
    fn test_potential_heuristic_keeps_path_weight() {
        let mut config = SearchConfig::default();
        config.algorithm = Algorithm::Astar;
        config.astar.heuristic = Heuristic::Potential;
        let mut search = FstSearch::new(config).unwrap();
        let result = search.search(&chain(), None, &Weights::empty()).unwrap();
        assert_eq!(result.units[0].weight, Some(3.0));
        assert_eq!(search.state(), SearchState::Free);
    }

    #[test]
    fn test_composition_needs_tp() {
        let mut units = chain().units;
        units.push(Unit::new("other", 1));
        let fst = Transducer::new(units);

        let mut search = search(Algorithm::Astar);
        assert_eq!(message(search.load(&fst, None)), "on-the-fly composition only possible with tp");
        assert_eq!(search.state(), SearchState::Free);
        assert_eq!(message(search.isearch(&weights(), FeedOptions::last())), "load transducer first");
        assert!(search.load(&fst, Some(0)).is_ok());
    }

    #[test]
    fn test_decoder_failure_releases_decoder() {
        let mut search = search(Algorithm::Tp);
        search.load(&chain(), None).unwrap();
        let narrow = Weights::from_rows(vec![vec![0.0]]).unwrap();
        assert!(search.isearch(&narrow, FeedOptions::last()).is_err());
        assert_eq!(search.state(), SearchState::Free);

        search.restart().unwrap();
        search.isearch(&weights(), FeedOptions::last()).unwrap();
        assert_eq!(search.backtrack().unwrap().units[0].weight, Some(3.75));
    }

    #[test]
    fn test_one_shot_search_unloads() {
        let mut search = search(Algorithm::Sdp);
        let result = search.search(&chain(), None, &weights()).unwrap();
        assert_eq!(result.units.len(), 1);
        assert_eq!(result.units[0].weight, Some(3.75));
        assert_eq!(search.state(), SearchState::Free);
        assert_eq!(message(search.backtrack()), "no search before backtracking");
    }

    struct Fixed;

    impl ShortestDistance for Fixed {
        fn shortest_path(&self, _: &ModelUnit, _: &Weights) -> Result<Option<(f64, Vec<PathStep>)>> {
            Ok(Some((
                7.0,
                vec![PathStep {
                    id: Some(1),
                    output: 1,
                    weight: 7.0,
                }],
            )))
        }
    }

    #[test]
    fn test_custom_shortest_distance() {
        let mut search = search(Algorithm::Sdp).with_shortest_distance(|| Box::new(Fixed) as Box<dyn ShortestDistance>);
        search.load(&chain(), None).unwrap();
        search.isearch(&weights(), FeedOptions::last()).unwrap();
        let result = search.backtrack().unwrap();
        assert_eq!(result.units[0].weight, Some(7.0));
        assert_eq!(result.units[0].output_sequence(), vec![1]);

        // The restarted decoder gets a fresh engine.
        search.isearch(&weights(), FeedOptions::last()).unwrap();
        assert_eq!(search.backtrack().unwrap().units[0].weight, Some(7.0));
    }
}
