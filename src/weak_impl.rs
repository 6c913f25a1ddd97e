use std::sync::Arc;

use crate::{slot_visitor::SlotVisitor, value::Value};

/// Per-slot lifecycle. Within one collection a slot only moves forward;
/// reallocation puts a `Deallocated` slot back to `Live`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum WeakImplState {
    Live,
    /// The referent died; the finalizer has not run yet.
    Dead,
    Finalized,
    Deallocated,
}

/// Callbacks attached to a weak reference.
pub trait WeakHandleOwner {
    /// Keep `value` alive even though nothing strong points at it, because
    /// something the visitor already reached (an opaque root) needs it.
    fn is_reachable_from_opaque_roots(
        &self,
        value: Value,
        context: usize,
        visitor: &SlotVisitor<'_>,
    ) -> bool {
        let _ = (value, context, visitor);
        false
    }

    /// Runs once after the referent died.
    fn finalize(&self, value: Value, context: usize) {
        let _ = (value, context);
    }
}

/// One weak reference slot.
pub struct WeakImpl {
    value: Value,
    owner: Option<Arc<dyn WeakHandleOwner>>,
    context: usize,
    state: WeakImplState,
    generation: u32,
    next_free: Option<u32>,
}

impl Default for WeakImpl {
    fn default() -> Self {
        Self {
            value: Value::Empty,
            owner: None,
            context: 0,
            state: WeakImplState::Deallocated,
            generation: 0,
            next_free: None,
        }
    }
}

impl WeakImpl {
    pub(crate) fn initialize(
        &mut self,
        value: Value,
        owner: Option<Arc<dyn WeakHandleOwner>>,
        context: usize,
    ) {
        debug_assert_eq!(self.state, WeakImplState::Deallocated);
        self.value = value;
        self.owner = owner;
        self.context = context;
        self.state = WeakImplState::Live;
        self.next_free = None;
    }

    pub fn value(&self) -> Value {
        self.value
    }

    pub fn owner(&self) -> Option<&Arc<dyn WeakHandleOwner>> {
        self.owner.as_ref()
    }

    pub fn context(&self) -> usize {
        self.context
    }

    pub fn state(&self) -> WeakImplState {
        self.state
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub(crate) fn set_state(&mut self, state: WeakImplState) {
        debug_assert!(
            state >= self.state,
            "weak slot state regressed from {:?} to {:?}",
            self.state,
            state
        );
        self.state = state;
    }

    /// Clear the slot so it can go on a free list. Outstanding handles to it
    /// become stale.
    pub(crate) fn deallocate(&mut self) {
        self.value = Value::Empty;
        self.owner = None;
        self.context = 0;
        self.state = WeakImplState::Deallocated;
        self.generation = self.generation.wrapping_add(1);
    }

    pub(crate) fn next_free(&self) -> Option<u32> {
        self.next_free
    }

    pub(crate) fn set_next_free(&mut self, next: Option<u32>) {
        self.next_free = next;
    }
}
