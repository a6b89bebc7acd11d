//! Visited-state hash.
//!
//! Maps a packed state id (plus, when hypotheses with different pushdown
//! stacks are kept apart, the stack contents) to a bucket element holding up
//! to `slots` co-located hypotheses. Elements live in a [`Pool`]; chains are
//! doubly linked through pool handles. The chain table grows by
//! `1 << RESIZE_SHIFT` whenever the element count exceeds the chain count.

use crate::constants::hash::{INITIAL_CHAINS, INITIAL_ELEMENTS, RESIZE_SHIFT, RESIZE_THRESHOLD_SHIFT};
use crate::error::Result;
use crate::memory::{Pool, PoolIdx, PoolStats};
use crate::types::PushdownStack;

/// Bucket for one state id.
#[derive(Debug, Clone)]
pub struct HashElement {
    pub id: u64,
    pub stack: PushdownStack,
    /// Hypotheses stored for this id, by handle into the owner's state pool.
    pub states: Vec<PoolIdx>,
    /// Number of hypotheses already expanded.
    pub done: u32,
    next: Option<PoolIdx>,
    prev: Option<PoolIdx>,
}

#[inline]
fn chain_index(id: u64, mask: usize) -> usize {
    ((id ^ (id >> 16) ^ (id >> 32) ^ (id >> 48)) as usize) & mask
}

/// See the module documentation.
#[derive(Debug)]
pub struct VisitedHash {
    chains: Vec<Option<PoolIdx>>,
    elements: Pool<HashElement>,
    mask: usize,
    slots: u32,
    stack_sensitive: bool,
}

impl VisitedHash {
    /// # Arguments
    /// * `slots` - Hypotheses per element (`numpaths`).
    /// * `stack_sensitive` - Keep hypotheses with different stacks apart.
    /// * `limit` - Element limit of the backing pool.
    pub fn new(name: &str, slots: u32, stack_sensitive: bool, limit: usize) -> Self {
        Self::with_chains(name, INITIAL_CHAINS, slots, stack_sensitive, limit)
    }

    /// Like [`VisitedHash::new`] with an explicit initial chain count
    /// (rounded up to a power of two).
    pub fn with_chains(name: &str, chains: usize, slots: u32, stack_sensitive: bool, limit: usize) -> Self {
        let chains = chains.max(1).next_power_of_two();
        Self {
            chains: vec![None; chains],
            elements: Pool::new(format!("{}.hash", name), INITIAL_ELEMENTS, limit),
            mask: chains - 1,
            slots: slots.max(1),
            stack_sensitive,
        }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn chain_count(&self) -> usize {
        self.chains.len()
    }

    pub fn slots(&self) -> u32 {
        self.slots
    }

    fn matches(&self, e: &HashElement, id: u64, stack: &PushdownStack) -> bool {
        e.id == id && (!self.stack_sensitive || e.stack == *stack)
    }

    /// Element for `id` and `stack`.
    pub fn find(&self, id: u64, stack: &PushdownStack) -> Option<PoolIdx> {
        let mut cursor = self.chains[chain_index(id, self.mask)];
        while let Some(idx) = cursor {
            let e = &self.elements[idx];
            if self.matches(e, id, stack) {
                return Some(idx);
            }
            cursor = e.next;
        }
        None
    }

    /// Create an element holding `state`.
    pub fn insert(&mut self, id: u64, stack: PushdownStack, state: PoolIdx) -> Result<PoolIdx> {
        let idx = self.elements.insert(HashElement {
            id,
            stack,
            states: vec![state],
            done: 0,
            next: None,
            prev: None,
        })?;
        self.link(idx);
        if self.elements.len() > (self.chains.len() << RESIZE_THRESHOLD_SHIFT) {
            self.resize();
        }
        Ok(idx)
    }

    fn link(&mut self, idx: PoolIdx) {
        let chain = chain_index(self.elements[idx].id, self.mask);
        let head = self.chains[chain];
        if let Some(h) = head {
            self.elements[h].prev = Some(idx);
        }
        let e = &mut self.elements[idx];
        e.next = head;
        e.prev = None;
        self.chains[chain] = Some(idx);
    }

    fn unlink(&mut self, idx: PoolIdx) {
        let (prev, next, id) = {
            let e = &self.elements[idx];
            (e.prev, e.next, e.id)
        };
        match prev {
            Some(p) => self.elements[p].next = next,
            None => self.chains[chain_index(id, self.mask)] = next,
        }
        if let Some(n) = next {
            self.elements[n].prev = prev;
        }
    }

    fn resize(&mut self) {
        let chains = self.chains.len() << RESIZE_SHIFT;
        self.chains = vec![None; chains];
        self.mask = chains - 1;
        for idx in self.elements.handles() {
            self.link(idx);
        }
        tracing::debug!(pool = self.elements.name(), chains, "Visited hash resized");
    }

    pub fn element(&self, e: PoolIdx) -> &HashElement {
        &self.elements[e]
    }

    /// Whether every slot of the element has been expanded.
    pub fn is_closed(&self, e: PoolIdx) -> bool {
        self.elements[e].done >= self.slots
    }

    /// Add a co-located hypothesis.
    pub fn attach(&mut self, e: PoolIdx, state: PoolIdx) {
        self.elements[e].states.push(state);
    }

    /// Remove a hypothesis from its element. An element left without
    /// hypotheses and without expansions is deleted; returns whether that
    /// happened.
    pub fn detach(&mut self, e: PoolIdx, state: PoolIdx) -> bool {
        let element = &mut self.elements[e];
        element.states.retain(|&s| s != state);
        if element.states.is_empty() && element.done == 0 {
            self.remove(e);
            return true;
        }
        false
    }

    /// Count an expansion of one of the element's hypotheses, or close the
    /// element at once when the hypothesis was pruned instead.
    ///
    /// Once all slots are used up the element is closed and the hypotheses
    /// it still holds are handed back for the caller to discard. The element
    /// itself stays behind so later arrivals are rejected.
    pub fn finalize(&mut self, e: PoolIdx, expanded: bool) -> Option<Vec<PoolIdx>> {
        let slots = self.slots;
        let element = &mut self.elements[e];
        if expanded {
            element.done += 1;
            if element.done < slots {
                return None;
            }
        } else {
            element.done = slots;
        }
        Some(std::mem::take(&mut element.states))
    }

    /// Delete an element.
    pub fn remove(&mut self, e: PoolIdx) {
        self.unlink(e);
        self.elements.release(e);
    }

    /// Drop every element.
    pub fn clear(&mut self) {
        self.chains.iter_mut().for_each(|c| *c = None);
        self.elements.clear();
    }

    pub fn memory_bytes(&self) -> usize {
        self.elements.memory_bytes() + self.chains.len() * std::mem::size_of::<Option<PoolIdx>>()
    }

    pub fn stats(&self) -> PoolStats {
        self.elements.stats()
    }
}
