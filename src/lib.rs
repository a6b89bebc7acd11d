//! The `wfst_search` core library.
//!
//! Best-path search through weighted finite-state transducers. A transducer
//! is loaded into an [`FstSearch`], searched against a matrix of per-frame
//! input weights with one of three algorithms (time-synchronous TP, A* or a
//! shortest-distance DP), and the best paths come back as a result
//! transducer.
//!
//! ```no_run
//! use wfst_search::{FeedOptions, FstSearch, SearchConfig, Transducer, Weights};
//!
//! # fn main() -> wfst_search::Result<()> {
//! let fst = Transducer::from_json_file("model.json")?;
//! let weights = Weights::from_json_file("weights.json")?;
//! let mut search = FstSearch::new(SearchConfig::load()?)?;
//! search.load(&fst, None)?;
//! search.isearch(&weights, FeedOptions::last())?;
//! let best = search.backtrack()?;
//! println!("{}", best.to_json()?);
//! # Ok(())
//! # }
//! ```

pub mod astar;
pub mod backtrack;
pub mod config;
pub mod constants;
pub mod error;
pub mod fst;
pub mod hash;
pub mod memory;
pub mod recombine;
pub mod sdp;
pub mod search;
pub mod telemetry;
pub mod tp;
pub mod types;
pub mod weights;

pub use config::{Algorithm, BacktrackMode, SearchConfig};
pub use error::{Result, SearchError};
pub use fst::{Transducer, Transition, Unit};
pub use sdp::ShortestDistance;
pub use search::{FstSearch, SearchState, SearchStats};
pub use tp::FeedOptions;
pub use weights::Weights;
