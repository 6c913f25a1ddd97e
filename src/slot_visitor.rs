use ahash::AHashSet;

use crate::{
    copied_space::CopiedSpace,
    copy_visitor::CopyVisitor,
    copy_work_list::CopyToken,
    marked_space::MarkedSpace,
    value::{CellPtr, Value},
};

/// Describes the object graph to the collector.
pub trait CellTracer {
    /// Report every outgoing reference of `cell` to `visitor`.
    fn visit_children(&self, cell: CellPtr, visitor: &mut SlotVisitor<'_>);

    /// Evacuate the backing store of `cell` named by `token`, usually through
    /// [`CopyVisitor::copy`]. Only called for backing stores that were
    /// reported with [`SlotVisitor::copy_later`].
    fn copy_backing_store(&self, cell: CellPtr, token: CopyToken, visitor: &mut CopyVisitor<'_>) {
        let _ = (cell, token, visitor);
    }
}

/// Marking state for one collection.
pub struct SlotVisitor<'a> {
    space: &'a MarkedSpace,
    copied_space: &'a CopiedSpace,
    tracer: Option<&'a dyn CellTracer>,
    mark_stack: Vec<CellPtr>,
    opaque_roots: AHashSet<usize>,
    visit_count: usize,
}

impl<'a> SlotVisitor<'a> {
    pub fn new(
        space: &'a MarkedSpace,
        copied_space: &'a CopiedSpace,
        tracer: Option<&'a dyn CellTracer>,
    ) -> Self {
        Self {
            space,
            copied_space,
            tracer,
            mark_stack: Vec::new(),
            opaque_roots: AHashSet::new(),
            visit_count: 0,
        }
    }

    pub fn marked_space(&self) -> &MarkedSpace {
        self.space
    }

    pub fn append(&mut self, value: Value) {
        if let Some(cell) = value.as_cell() {
            self.append_cell(cell);
        }
    }

    /// Mark `cell` and queue it for tracing unless it was already marked.
    pub fn append_cell(&mut self, cell: CellPtr) {
        if self.space.test_and_set_marked(cell) {
            return;
        }
        self.visit_count += 1;
        self.mark_stack.push(cell);
    }

    /// Treat a word that may or may not be a pointer as a root. Mark bits
    /// are already cleared here, so a cell qualifies as long as it holds an
    /// object.
    pub fn append_conservative(&mut self, ptr: *const u8) {
        self.copied_space.pin_if_necessary(ptr);
        if !self.space.holds_object(ptr) {
            return;
        }
        if let Some(cell) = CellPtr::new(ptr as *mut u8) {
            self.append_cell(cell);
        }
    }

    pub fn is_marked(&self, cell: CellPtr) -> bool {
        self.space.is_marked(cell)
    }

    pub fn add_opaque_root(&mut self, root: usize) {
        self.opaque_roots.insert(root);
    }

    pub fn contains_opaque_root(&self, root: usize) -> bool {
        self.opaque_roots.contains(&root)
    }

    pub fn opaque_root_count(&self) -> usize {
        self.opaque_roots.len()
    }

    /// Number of cells newly marked by this visitor.
    pub fn visit_count(&self) -> usize {
        self.visit_count
    }

    /// Register a copied-space backing store of `owner` that is still in
    /// use.
    pub fn copy_later(&mut self, owner: CellPtr, token: CopyToken, ptr: *const u8, bytes: usize) {
        self.copied_space.report_live_bytes(ptr, owner, token, bytes);
    }

    /// Trace until the mark stack is empty.
    pub fn drain(&mut self) {
        let tracer = self.tracer;
        while let Some(cell) = self.mark_stack.pop() {
            if let Some(tracer) = tracer {
                tracer.visit_children(cell, self);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mark_stack.is_empty()
    }
}
