use std::fmt;

/// Generation-checked index into a [`Slab`].
///
/// A handle stays valid until the entry it names is removed; after that the
/// slot may be reused but the old handle no longer resolves.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlabId {
    index: u32,
    generation: u32,
}

impl SlabId {
    pub fn index(self) -> usize {
        self.index as usize
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for SlabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

struct Entry<T> {
    generation: u32,
    value: Option<T>,
}

/// Growable arena with O(1) insert/remove and slot reuse.
pub struct Slab<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Slab<T> {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, value: T) -> SlabId {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            debug_assert!(entry.value.is_none());
            entry.generation = entry.generation.wrapping_add(1);
            entry.value = Some(value);
            return SlabId {
                index,
                generation: entry.generation,
            };
        }
        let index = self.entries.len() as u32;
        self.entries.push(Entry {
            generation: 0,
            value: Some(value),
        });
        SlabId {
            index,
            generation: 0,
        }
    }

    /// Reserve the id the next `insert` will return.
    pub fn next_id(&self) -> SlabId {
        match self.free.last() {
            Some(&index) => SlabId {
                index,
                generation: self.entries[index as usize].generation.wrapping_add(1),
            },
            None => SlabId {
                index: self.entries.len() as u32,
                generation: 0,
            },
        }
    }

    pub fn remove(&mut self, id: SlabId) -> Option<T> {
        let entry = self.entries.get_mut(id.index as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        let value = entry.value.take()?;
        self.free.push(id.index);
        self.len -= 1;
        Some(value)
    }

    pub fn contains(&self, id: SlabId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: SlabId) -> Option<&T> {
        let entry = self.entries.get(id.index as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        entry.value.as_ref()
    }

    pub fn get_mut(&mut self, id: SlabId) -> Option<&mut T> {
        let entry = self.entries.get_mut(id.index as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        entry.value.as_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlabId, &T)> {
        self.entries.iter().enumerate().filter_map(|(index, entry)| {
            entry.value.as_ref().map(|value| {
                (
                    SlabId {
                        index: index as u32,
                        generation: entry.generation,
                    },
                    value,
                )
            })
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SlabId, &mut T)> {
        self.entries
            .iter_mut()
            .enumerate()
            .filter_map(|(index, entry)| {
                let generation = entry.generation;
                entry.value.as_mut().map(|value| {
                    (
                        SlabId {
                            index: index as u32,
                            generation,
                        },
                        value,
                    )
                })
            })
    }

    pub fn ids(&self) -> Vec<SlabId> {
        self.iter().map(|(id, _)| id).collect()
    }

    /// Remove every entry, yielding them in slot order.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if let Some(value) = entry.value.take() {
                self.free.push(index as u32);
                out.push(value);
            }
        }
        self.len = 0;
        out
    }
}

impl<T> std::ops::Index<SlabId> for Slab<T> {
    type Output = T;
    fn index(&self, id: SlabId) -> &T {
        match self.get(id) {
            Some(value) => value,
            None => panic!("stale slab id {:?}", id),
        }
    }
}

impl<T> std::ops::IndexMut<SlabId> for Slab<T> {
    fn index_mut(&mut self, id: SlabId) -> &mut T {
        match self.get_mut(id) {
            Some(value) => value,
            None => panic!("stale slab id {:?}", id),
        }
    }
}
