//! Transducer input format and the decoder graph built from it.

mod model;
mod potential;
mod transducer;

pub use model::{FstModel, FstTransition, ModelUnit};
pub use potential::{potentials, push_weights};
pub use transducer::{Semiring, Transducer, Transition, Unit};
