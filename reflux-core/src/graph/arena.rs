//! Entry Arena
//!
//! Owns every entry of a graph in a slot vector. Edges between entries are
//! [`EntryId`]s, never pointers, so a dependent edge cannot keep an entry
//! alive. Removing an entry tombstones its slot and bumps the slot's
//! generation; stale ids pointing at it simply stop resolving.

use std::sync::Arc;

use super::entry::{EntryId, EntryNode};

struct Slot {
    generation: u32,
    node: Option<Arc<EntryNode>>,
}

#[derive(Default)]
pub(crate) struct EntryArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl EntryArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a slot and build the entry for it.
    pub fn insert(&mut self, build: impl FnOnce(EntryId) -> EntryNode) -> Arc<EntryNode> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let node = Arc::new(build(EntryId::new(index, slot.generation)));
        slot.node = Some(Arc::clone(&node));
        self.live += 1;
        node
    }

    /// Live entry for `id`. Stale generations return `None`.
    pub fn get(&self, id: EntryId) -> Option<&Arc<EntryNode>> {
        self.slots
            .get(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.node.as_ref())
    }

    /// Free the slot and bump its generation.
    pub fn remove(&mut self, id: EntryId) -> Option<Arc<EntryNode>> {
        let slot = self.slots.get_mut(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index());
        self.live -= 1;
        Some(node)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EntryNode>> {
        self.slots.iter().filter_map(|slot| slot.node.as_ref())
    }

    /// Remove every entry. Slots are kept for reuse.
    pub fn clear(&mut self) -> Vec<Arc<EntryNode>> {
        let mut removed = Vec::with_capacity(self.live);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(node) = slot.node.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
                removed.push(node);
            }
        }
        self.live = 0;
        removed
    }

    pub fn len(&self) -> usize {
        self.live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::key::{ComputeKey, FunctionId};

    fn build(n: u32) -> impl FnOnce(EntryId) -> EntryNode {
        move |id| EntryNode::new(id, ComputeKey::new(FunctionId::new("f"), n))
    }

    #[test]
    fn removed_ids_stop_resolving() {
        let mut arena = EntryArena::new();
        let a = arena.insert(build(1)).id();
        assert!(arena.get(a).is_some());

        arena.remove(a);
        assert!(arena.get(a).is_none());
        assert!(arena.remove(a).is_none());
        assert_eq!(arena.len(), 0);
    }

    #[test]
    fn slots_are_reused_with_new_generation() {
        let mut arena = EntryArena::new();
        let a = arena.insert(build(1)).id();
        arena.remove(a);

        let b = arena.insert(build(2)).id();
        assert_eq!(a.index(), b.index());
        assert_ne!(a.generation(), b.generation());
        assert!(arena.get(a).is_none());
        assert_eq!(arena.get(b).map(|n| n.key().args::<u32>().copied()), Some(Some(2)));
    }

    #[test]
    fn clear_tombstones_everything() {
        let mut arena = EntryArena::new();
        let ids: Vec<_> = (0..3).map(|n| arena.insert(build(n)).id()).collect();
        assert_eq!(arena.clear().len(), 3);
        assert_eq!(arena.len(), 0);
        assert!(ids.iter().all(|id| arena.get(*id).is_none()));
        assert_eq!(arena.iter().count(), 0);
    }
}
