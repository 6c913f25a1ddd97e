use std::{
    marker::PhantomData,
    mem::{align_of, needs_drop, size_of},
    slice,
};

use crate::{
    globals::SMALL_BLOCK_SIZE,
    internal::{
        block_list::{BlockLink, Linked},
        slab::SlabId,
    },
    region::{BlockClass, BlockType, DeadBlock},
    value::Value,
};

/// Position of a node: its block and its index there.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodeRef {
    pub block: SlabId,
    pub index: u32,
}

/// The list a handle node currently belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HandleList {
    Free,
    Immediate,
    Strong,
}

pub struct HandleNode {
    pub(crate) value: Value,
    pub(crate) prev: Option<NodeRef>,
    pub(crate) next: Option<NodeRef>,
    pub(crate) list: HandleList,
    pub(crate) generation: u32,
}

impl Default for HandleNode {
    fn default() -> Self {
        Self {
            value: Value::Empty,
            prev: None,
            next: None,
            list: HandleList::Free,
            generation: 0,
        }
    }
}

impl HandleNode {
    pub fn value(&self) -> Value {
        self.value
    }

    pub fn list(&self) -> HandleList {
        self.list
    }
}

// Blocks are handed back without visiting their nodes.
const _: () = assert!(!needs_drop::<HandleNode>());

/// A block of handle nodes carved from the 4KB block class. The nodes live
/// in the block's own memory.
pub struct HandleBlock {
    link: BlockLink,
    block: DeadBlock,
    _nodes: PhantomData<HandleNode>,
}

impl BlockType for HandleBlock {
    const CLASS: BlockClass = BlockClass::Small;
}

impl Linked for HandleBlock {
    fn link(&self) -> &BlockLink {
        &self.link
    }
    fn link_mut(&mut self) -> &mut BlockLink {
        &mut self.link
    }
}

impl HandleBlock {
    pub const NODE_COUNT: usize = SMALL_BLOCK_SIZE / size_of::<HandleNode>();

    pub fn new(block: DeadBlock) -> Self {
        debug_assert!(block.size() >= Self::NODE_COUNT * size_of::<HandleNode>());
        debug_assert_eq!(block.start() as usize % align_of::<HandleNode>(), 0);
        let start = block.start().cast::<HandleNode>();
        for index in 0..Self::NODE_COUNT {
            unsafe { start.add(index).write(HandleNode::default()) };
        }
        Self {
            link: BlockLink::default(),
            block,
            _nodes: PhantomData,
        }
    }

    pub fn into_dead_block(self) -> DeadBlock {
        self.block
    }

    fn nodes(&self) -> &[HandleNode] {
        unsafe { slice::from_raw_parts(self.block.start().cast(), Self::NODE_COUNT) }
    }

    fn nodes_mut(&mut self) -> &mut [HandleNode] {
        unsafe { slice::from_raw_parts_mut(self.block.start().cast(), Self::NODE_COUNT) }
    }

    pub fn start(&self) -> *mut u8 {
        self.block.start()
    }

    pub fn contains(&self, ptr: *const u8) -> bool {
        self.block.contains(ptr)
    }

    pub fn node_count(&self) -> usize {
        Self::NODE_COUNT
    }

    pub fn node(&self, index: u32) -> Option<&HandleNode> {
        self.nodes().get(index as usize)
    }

    pub(crate) fn node_mut(&mut self, index: u32) -> Option<&mut HandleNode> {
        self.nodes_mut().get_mut(index as usize)
    }
}
