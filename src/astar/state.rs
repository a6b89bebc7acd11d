use crate::backtrack::History;
use crate::memory::PoolIdx;
use crate::recombine::Hypothesis;
use crate::types::PushdownStack;

/// A* hypothesis: a partial path ending in `state` after `frame` frames.
#[derive(Debug)]
pub struct AstarState {
    /// `frame * states + state`.
    pub id: u64,
    pub frame: u32,
    pub state: u32,
    pub weight: f64,
    pub stack: PushdownStack,
    pub history: History,
    pub element: Option<PoolIdx>,
    pub closed: bool,
}

impl AstarState {
    pub fn new(frame: u32, state: u32, states: u32, weight: f64, stack: PushdownStack, history: History) -> Self {
        Self {
            id: frame as u64 * states as u64 + state as u64,
            frame,
            state,
            weight,
            stack,
            history,
            element: None,
            closed: false,
        }
    }
}

impl Hypothesis for AstarState {
    fn key(&self) -> u64 {
        self.id
    }

    fn score(&self) -> f64 {
        self.weight
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

    fn is_closed(&self) -> bool {
        self.closed
    }
}
