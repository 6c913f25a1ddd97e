//! Persistent handles.
//!
//! Every allocated node sits on exactly one of three lists: strong (holds a
//! cell and is a root), immediate (holds a non-cell or nothing) or free.
//! Moving between strong and immediate only happens in
//! [`HandleSet::write_barrier`].

use std::sync::Arc;

use crate::{
    block_allocator::BlockAllocator,
    error::{HeapError, HeapResult},
    handle_block::{HandleBlock, HandleList, HandleNode, NodeRef},
    internal::{block_list::BlockList, slab::Slab},
    slot_visitor::SlotVisitor,
    value::Value,
};

/// Names one handle node. Stale once the handle is deallocated.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct HandleSlot {
    node: NodeRef,
    generation: u32,
}

#[derive(Clone, Copy, Default)]
struct NodeList {
    head: Option<NodeRef>,
    tail: Option<NodeRef>,
    len: usize,
}

fn node(blocks: &Slab<HandleBlock>, at: NodeRef) -> &HandleNode {
    match blocks.get(at.block).and_then(|block| block.node(at.index)) {
        Some(node) => node,
        None => panic!("dangling handle node {:?}", at),
    }
}

fn node_mut(blocks: &mut Slab<HandleBlock>, at: NodeRef) -> &mut HandleNode {
    match blocks.get_mut(at.block).and_then(|block| block.node_mut(at.index)) {
        Some(node) => node,
        None => panic!("dangling handle node {:?}", at),
    }
}

impl NodeList {
    fn push(&mut self, blocks: &mut Slab<HandleBlock>, at: NodeRef, list: HandleList) {
        let old_tail = self.tail;
        {
            let entry = node_mut(blocks, at);
            entry.prev = old_tail;
            entry.next = None;
            entry.list = list;
        }
        match old_tail {
            Some(tail) => node_mut(blocks, tail).next = Some(at),
            None => self.head = Some(at),
        }
        self.tail = Some(at);
        self.len += 1;
    }

    fn remove(&mut self, blocks: &mut Slab<HandleBlock>, at: NodeRef) {
        let (prev, next) = {
            let entry = node_mut(blocks, at);
            let pair = (entry.prev, entry.next);
            entry.prev = None;
            entry.next = None;
            pair
        };
        match prev {
            Some(prev) => node_mut(blocks, prev).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => node_mut(blocks, next).prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    fn for_each(&self, blocks: &Slab<HandleBlock>, mut visitor: impl FnMut(NodeRef, &HandleNode)) {
        let mut cursor = self.head;
        while let Some(at) = cursor {
            let entry = node(blocks, at);
            cursor = entry.next;
            visitor(at, entry);
        }
    }
}

pub struct HandleSet {
    block_allocator: Arc<BlockAllocator>,
    blocks: Slab<HandleBlock>,
    block_list: BlockList,
    strong_list: NodeList,
    immediate_list: NodeList,
    free_list: Option<NodeRef>,
    free_count: usize,
    is_finalizing: bool,
}

impl HandleSet {
    pub fn new(block_allocator: Arc<BlockAllocator>) -> Self {
        Self {
            block_allocator,
            blocks: Slab::new(),
            block_list: BlockList::new(),
            strong_list: NodeList::default(),
            immediate_list: NodeList::default(),
            free_list: None,
            free_count: 0,
            is_finalizing: false,
        }
    }

    fn grow(&mut self) {
        let block = HandleBlock::new(self.block_allocator.allocate::<HandleBlock>());
        let count = block.node_count() as u32;
        let id = self.blocks.insert(block);
        self.block_list.push_back(&mut self.blocks, id);
        for index in (0..count).rev() {
            self.push_free(NodeRef { block: id, index });
        }
        log::trace!("handle set grew by {} nodes", count);
    }

    fn push_free(&mut self, at: NodeRef) {
        let next = self.free_list;
        let entry = node_mut(&mut self.blocks, at);
        entry.value = Value::Empty;
        entry.prev = None;
        entry.next = next;
        entry.list = HandleList::Free;
        self.free_list = Some(at);
        self.free_count += 1;
    }

    /// A new empty handle. It starts on the immediate list.
    pub fn allocate(&mut self) -> HandleSlot {
        if self.free_list.is_none() {
            self.grow();
        }
        let at = match self.free_list {
            Some(at) => at,
            None => unreachable!("grow always adds free nodes"),
        };
        let entry = node_mut(&mut self.blocks, at);
        self.free_list = entry.next;
        self.free_count -= 1;
        entry.next = None;
        let generation = entry.generation;
        self.immediate_list
            .push(&mut self.blocks, at, HandleList::Immediate);
        HandleSlot {
            node: at,
            generation,
        }
    }

    fn resolve(&self, slot: HandleSlot) -> Option<&HandleNode> {
        self.blocks
            .get(slot.node.block)
            .and_then(|block| block.node(slot.node.index))
            .filter(|entry| entry.generation == slot.generation && entry.list != HandleList::Free)
    }

    pub fn is_live_node(&self, slot: HandleSlot) -> bool {
        self.resolve(slot).is_some()
    }

    pub fn get(&self, slot: HandleSlot) -> Option<Value> {
        self.resolve(slot).map(|entry| entry.value)
    }

    pub fn list_of(&self, slot: HandleSlot) -> Option<HandleList> {
        self.resolve(slot).map(|entry| entry.list)
    }

    /// Release a handle. Returns `false` for stale handles.
    pub fn deallocate(&mut self, slot: HandleSlot) -> bool {
        let list = match self.list_of(slot) {
            Some(list) => list,
            None => return false,
        };
        match list {
            HandleList::Strong => self.strong_list.remove(&mut self.blocks, slot.node),
            HandleList::Immediate => self.immediate_list.remove(&mut self.blocks, slot.node),
            HandleList::Free => return false,
        }
        let entry = node_mut(&mut self.blocks, slot.node);
        entry.generation = entry.generation.wrapping_add(1);
        self.push_free(slot.node);
        true
    }

    /// Move `slot` to the list matching `value`. Must run before the value
    /// is stored; use [`HandleSet::set`] to do both.
    pub fn write_barrier(&mut self, slot: HandleSlot, value: Value) -> HeapResult<()> {
        if self.is_finalizing {
            return Err(HeapError::HandleWriteDuringFinalization);
        }
        let current = match self.resolve(slot) {
            Some(entry) => entry.value,
            None => return Err(HeapError::StaleHandle),
        };
        if current.is_empty() == value.is_empty() && current.is_cell() == value.is_cell() {
            return Ok(());
        }
        match self.list_of(slot) {
            Some(HandleList::Strong) => self.strong_list.remove(&mut self.blocks, slot.node),
            Some(HandleList::Immediate) => self.immediate_list.remove(&mut self.blocks, slot.node),
            _ => return Err(HeapError::StaleHandle),
        }
        if value.is_cell() {
            self.strong_list
                .push(&mut self.blocks, slot.node, HandleList::Strong);
        } else {
            self.immediate_list
                .push(&mut self.blocks, slot.node, HandleList::Immediate);
        }
        Ok(())
    }

    pub fn set(&mut self, slot: HandleSlot, value: Value) -> HeapResult<()> {
        self.write_barrier(slot, value)?;
        node_mut(&mut self.blocks, slot.node).value = value;
        Ok(())
    }

    /// Report every strong handle to the visitor. Immediate handles cannot
    /// keep anything alive.
    pub fn visit_strong_handles(&self, visitor: &mut SlotVisitor<'_>) {
        self.strong_list
            .for_each(&self.blocks, |_, entry| visitor.append(entry.value));
    }

    pub fn for_each_strong_handle(&self, mut visitor: impl FnMut(HandleSlot, Value)) {
        self.strong_list.for_each(&self.blocks, |at, entry| {
            visitor(
                HandleSlot {
                    node: at,
                    generation: entry.generation,
                },
                entry.value,
            )
        });
    }

    pub fn begin_finalization(&mut self) {
        self.is_finalizing = true;
    }

    pub fn end_finalization(&mut self) {
        self.is_finalizing = false;
    }

    pub fn is_finalizing(&self) -> bool {
        self.is_finalizing
    }

    pub fn strong_count(&self) -> usize {
        self.strong_list.len
    }

    pub fn immediate_count(&self) -> usize {
        self.immediate_list.len
    }

    pub fn free_count(&self) -> usize {
        self.free_count
    }

    /// Handles currently handed out.
    pub fn protected_count(&self) -> usize {
        self.strong_count() + self.immediate_count()
    }

    pub fn block_count(&self) -> usize {
        self.block_list.len()
    }

    pub fn capacity(&self) -> usize {
        self.block_count() * HandleBlock::NODE_COUNT
    }
}

impl Drop for HandleSet {
    fn drop(&mut self) {
        self.block_list = BlockList::new();
        for block in self.blocks.drain() {
            self.block_allocator.deallocate(block.into_dead_block());
        }
    }
}
