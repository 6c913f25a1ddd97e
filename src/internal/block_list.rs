use super::slab::{Slab, SlabId};

/// Intrusive list links stored inside a slab entry.
#[derive(Clone, Copy, Default, Debug)]
pub struct BlockLink {
    prev: Option<SlabId>,
    next: Option<SlabId>,
    linked: bool,
}

impl BlockLink {
    pub fn is_linked(&self) -> bool {
        self.linked
    }
}

pub trait Linked {
    fn link(&self) -> &BlockLink;
    fn link_mut(&mut self) -> &mut BlockLink;
}

/// Doubly linked list threaded through the entries of a slab.
///
/// An entry is on at most one list at a time; `push_*` on an entry that is
/// already linked is a bug.
#[derive(Clone, Copy, Default, Debug)]
pub struct BlockList {
    head: Option<SlabId>,
    tail: Option<SlabId>,
    len: usize,
}

impl BlockList {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn head(&self) -> Option<SlabId> {
        self.head
    }

    pub fn tail(&self) -> Option<SlabId> {
        self.tail
    }

    pub fn next<T: Linked>(slab: &Slab<T>, id: SlabId) -> Option<SlabId> {
        slab.get(id).and_then(|node| node.link().next)
    }

    pub fn push_back<T: Linked>(&mut self, slab: &mut Slab<T>, id: SlabId) {
        let old_tail = self.tail;
        {
            let link = slab[id].link_mut();
            debug_assert!(!link.linked, "{:?} is already on a list", id);
            link.prev = old_tail;
            link.next = None;
            link.linked = true;
        }
        match old_tail {
            Some(tail) => slab[tail].link_mut().next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
    }

    pub fn push_front<T: Linked>(&mut self, slab: &mut Slab<T>, id: SlabId) {
        let old_head = self.head;
        {
            let link = slab[id].link_mut();
            debug_assert!(!link.linked, "{:?} is already on a list", id);
            link.prev = None;
            link.next = old_head;
            link.linked = true;
        }
        match old_head {
            Some(head) => slab[head].link_mut().prev = Some(id),
            None => self.tail = Some(id),
        }
        self.head = Some(id);
        self.len += 1;
    }

    pub fn remove<T: Linked>(&mut self, slab: &mut Slab<T>, id: SlabId) {
        let (prev, next) = {
            let link = slab[id].link_mut();
            debug_assert!(link.linked, "{:?} is not on a list", id);
            let pair = (link.prev, link.next);
            *link = BlockLink::default();
            pair
        };
        match prev {
            Some(prev) => slab[prev].link_mut().next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => slab[next].link_mut().prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    pub fn pop_front<T: Linked>(&mut self, slab: &mut Slab<T>) -> Option<SlabId> {
        let head = self.head?;
        self.remove(slab, head);
        Some(head)
    }

    pub fn for_each<T: Linked>(&self, slab: &Slab<T>, mut visitor: impl FnMut(SlabId, &T)) {
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let node = &slab[id];
            cursor = node.link().next;
            visitor(id, node);
        }
    }

    /// Snapshot of the list's ids in order. Handy when the visitor needs to
    /// unlink entries.
    pub fn ids<T: Linked>(&self, slab: &Slab<T>) -> Vec<SlabId> {
        let mut ids = Vec::with_capacity(self.len);
        self.for_each(slab, |id, _| ids.push(id));
        ids
    }
}
