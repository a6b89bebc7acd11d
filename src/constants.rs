//! Domain constants for the decoder.
//!
//! Compile-time limits and tuning constants. Values that a caller may want to
//! change live in [`crate::config`] instead.

/// Transducer limits checked at load time.
pub mod fst {
    /// Largest unit, state, transition or symbol count (2^31 - 2).
    pub const MAX_INDEX: u64 = 2_147_483_646;

    /// Pushdown symbols must lie in `-MAX_STACK_SYMBOL..=MAX_STACK_SYMBOL`.
    pub const MAX_STACK_SYMBOL: i32 = 65_535;

    /// Symbol value marking an epsilon input or output.
    pub const EPSILON: i32 = -1;
}

/// Per-hypothesis bounds shared by both decoders.
pub mod search {
    /// Pushdown stack slots per hypothesis. A push that would fill the last
    /// slot is an overflow.
    pub const MAX_STACK: usize = 8;

    /// Composition depth for on-the-fly composition.
    pub const MAX_LAYER: usize = 4;

    /// Upper bound for `numpaths`.
    pub const MAX_PATHS: u32 = 65_535;
}

/// Memory pool sizing.
pub mod memory {
    /// Initial element count of the backtrack node pools.
    pub const BACKTRACK_INITIAL: usize = 32_768;

    /// Initial element count of hypothesis pools.
    pub const STATE_INITIAL: usize = 32_768;

    /// Initial element count of lattice pools.
    pub const LATTICE_INITIAL: usize = 32_768;

    /// Default element limit per pool.
    pub const DEFAULT_MAX_ELEMENTS: usize = u32::MAX as usize;
}

/// Visited-state hash sizing.
pub mod hash {
    /// Number of chains of a fresh hash.
    pub const INITIAL_CHAINS: usize = 65_536;

    /// Initial element count of the element pool.
    pub const INITIAL_ELEMENTS: usize = 32_768;

    /// Resize once more than `chains << RESIZE_THRESHOLD_SHIFT` elements are used.
    pub const RESIZE_THRESHOLD_SHIFT: u32 = 0;

    /// Chain count grows by `1 << RESIZE_SHIFT` on resize.
    pub const RESIZE_SHIFT: u32 = 2;
}

/// A* open-queue tuning.
pub mod astar {
    /// Queue length used when no explicit size is configured.
    pub const DEFAULT_QUEUE_SIZE: usize = 32_767;

    /// Position of the eviction threshold between the worst and the best
    /// queued weight.
    pub const PRUNE_WEIGHT_FRACTION: f64 = 0.3;

    /// Fraction of the queue length evicted per pruning pass.
    pub const PRUNE_COUNT_FRACTION: f64 = 0.05;
}

/// TP histogram pruning.
pub mod tp {
    /// Number of histogram bins.
    pub const HISTOGRAM_BINS: usize = 128;

    /// Weight range covered by the histogram.
    pub const HISTOGRAM_RANGE: usize = 500;

    /// Bin width. Integer division is part of the pruning behaviour.
    pub const HISTOGRAM_STEP: f64 = (HISTOGRAM_RANGE / HISTOGRAM_BINS) as f64;
}

/// Backtrack chains.
pub mod backtrack {
    /// Rotation mixing the parent hash into a new chain node.
    pub const CHAIN_HASH_ROTATION: u32 = 11;
}
