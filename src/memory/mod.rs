//! Slab allocation for decoder structures.
//!
//! Every structure that creates and discards many small records per frame
//! (hypotheses, hash elements, backtrack nodes, lattice nodes) owns one
//! [`Pool`]. Records are addressed by [`PoolIdx`] handles instead of pointers.

mod pool;

pub use pool::{Pool, PoolIdx, PoolStats, SharedPool};
