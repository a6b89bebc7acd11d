//! Strong typing for small per-hypothesis values.

use std::hash::{Hash, Hasher};

use crate::constants::search::MAX_STACK;
use crate::error::{Result, SearchError};

/// Bounded pushdown stack carried by every hypothesis.
///
/// A positive transition stack symbol pushes, a negative one pops and is only
/// accepted when the top matches its absolute value, zero leaves the stack
/// untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PushdownStack {
    symbols: [u16; MAX_STACK],
    len: u8,
}

impl PushdownStack {
    /// Create an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stacked symbols.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether no symbol is stacked.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Topmost symbol.
    pub fn top(&self) -> Option<u16> {
        self.as_slice().last().copied()
    }

    /// Stacked symbols, bottom first.
    pub fn as_slice(&self) -> &[u16] {
        &self.symbols[..self.len as usize]
    }

    /// Whether a transition with this stack symbol may be taken.
    pub fn accepts(&self, symbol: i32) -> bool {
        symbol >= 0 || self.top().map(i32::from) == Some(-symbol)
    }

    /// Apply a transition stack symbol.
    pub fn apply(&mut self, symbol: i32) -> Result<()> {
        if symbol > 0 {
            if self.len() + 1 == MAX_STACK {
                return Err(SearchError::Structure("stk: out of memory".to_string()));
            }
            self.symbols[self.len()] = symbol as u16;
            self.len += 1;
        } else if symbol < 0 && self.len > 0 {
            self.len -= 1;
        }
        Ok(())
    }
}

impl PartialEq for PushdownStack {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for PushdownStack {}

impl Hash for PushdownStack {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_slice().hash(state);
    }
}

impl std::fmt::Display for PushdownStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.as_slice())
    }
}
