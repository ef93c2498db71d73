//! The classic way of keeping track of live allocations is an intrusive,
//! doubly linked list threaded through the block headers, with a static
//! head node. Here the links live in an arena of slots instead, addressed
//! by index; a slot's generation is bumped whenever it is vacated, so a
//! stale [`BlockId`] can never unlink somebody else's block.
//!
//! Slot 0 plays the part of the head node. It never holds a user
//! allocation and is never yielded by [`Registry::iter`].
use crate::block::RawBlock;
use crate::report::Leak;
use crate::utils::{NonNull, Origin};

const HEAD: u32 = 0;

/// Stable handle to a registered block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockId {
    index:      u32,
    generation: u32,
}

/// A live, registered allocation.
#[derive(Debug)]
pub struct Block {
    pub(crate) raw: RawBlock,
    origin:         Origin,
}

impl Block {
    pub fn new(raw: RawBlock, origin: Origin) -> Self {
        Self { raw, origin }
    }

    pub fn payload(&self) -> NonNull<u8> {
        self.raw.payload()
    }

    pub fn size(&self) -> usize {
        self.raw.size()
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn set_origin(&mut self, origin: Origin) {
        self.origin = origin;
    }

    pub fn leak(&self) -> Leak {
        Leak {
            origin: self.origin.clone(),
            size:   self.size(),
            ptr:    self.raw.address(),
        }
    }

    pub fn into_raw(self) -> RawBlock {
        self.raw
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    prev:       u32,
    next:       Option<u32>,
    block:      Option<Block>,
}

impl Slot {
    const fn vacant() -> Self {
        Self {
            generation: 0,
            prev:       HEAD,
            next:       None,
            block:      None,
        }
    }
}

#[derive(Debug)]
pub struct Registry {
    slots:  Vec<Slot>,
    vacant: Vec<u32>,
    len:    usize,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            slots:  vec![Slot::vacant()],
            vacant: vec![],
            len:    0,
        }
    }

    /// The origin reported for the head node.
    pub fn head_origin() -> Origin {
        Origin::noname()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Links `block` in at the front. O(1), never fails; the caller
    /// guarantees the block isn't registered already.
    pub fn register(&mut self, block: Block) -> BlockId {
        let index = match self.vacant.pop() {
            Some(idx)   => idx,
            None        => {
                self.slots.push(Slot::vacant());
                (self.slots.len() - 1) as u32
            }
        };
        let first = self.slots[HEAD as usize].next;
        {
            let slot = &mut self.slots[index as usize];
            slot.block = Some(block);
            slot.prev = HEAD;
            slot.next = first;
        }
        if let Some(n) = first {
            self.slots[n as usize].prev = index;
        }
        self.slots[HEAD as usize].next = Some(index);
        self.len += 1;

        BlockId {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    fn is_linked(&self, id: BlockId) -> bool {
        id.index != HEAD
            && self
                .slots
                .get(id.index as usize)
                .is_some_and(|s| s.generation == id.generation && s.block.is_some())
    }

    /// Unlinks the block in O(1) and hands it back. `None` if `id` is not
    /// currently linked, which is how a second free of the same block is
    /// noticed.
    pub fn unregister(&mut self, id: BlockId) -> Option<Block> {
        if !self.is_linked(id) {
            return None;
        }
        let (prev, next) = {
            let slot = &self.slots[id.index as usize];
            (slot.prev, slot.next)
        };
        self.slots[prev as usize].next = next;
        if let Some(n) = next {
            self.slots[n as usize].prev = prev;
        }

        let slot = &mut self.slots[id.index as usize];
        let block = slot.block.take();
        slot.generation = slot.generation.wrapping_add(1);
        slot.prev = HEAD;
        slot.next = None;
        self.vacant.push(id.index);
        self.len -= 1;

        block
    }

    pub fn get(&self, id: BlockId) -> Option<&Block> {
        if !self.is_linked(id) {
            return None;
        }
        self.slots[id.index as usize].block.as_ref()
    }

    pub fn get_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        if !self.is_linked(id) {
            return None;
        }
        self.slots[id.index as usize].block.as_mut()
    }

    /// Most recently registered first. Cheap to call again: every call
    /// starts over from the head.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            registry:   self,
            cursor:     self.slots[HEAD as usize].next,
        }
    }

    /// The block whose payload starts exactly at `addr`.
    pub fn find(&self, addr: usize) -> Option<BlockId> {
        self.iter()
            .find(|(_, b)| b.raw.address() == addr)
            .map(|(id, _)| id)
    }

    /// The block whose payload contains `addr`.
    pub fn find_containing(&self, addr: usize) -> Option<BlockId> {
        self.iter()
            .find(|(_, b)| b.raw.contains(addr))
            .map(|(id, _)| id)
    }

    /// Unlinks everything, most recent first.
    pub fn drain(&mut self) -> Vec<Block> {
        let ids: Vec<BlockId> = self.iter().map(|(id, _)| id).collect();
        ids.into_iter()
            .filter_map(|id| self.unregister(id))
            .collect()
    }
}

pub struct Iter<'a> {
    registry:   &'a Registry,
    cursor:     Option<u32>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (BlockId, &'a Block);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let slot = &self.registry.slots[index as usize];
        self.cursor = slot.next;
        let block = slot.block.as_ref()?;

        Some((
            BlockId {
                index,
                generation: slot.generation,
            },
            block,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{RawAlloc, SystemAlloc};

    fn block(size: usize, line: u32) -> Block {
        let base = SystemAlloc
            .alloc_zeroed(RawBlock::footprint(size).unwrap())
            .unwrap();
        Block::new(unsafe { RawBlock::format(base, size) }, Origin::new("reg.rs", line))
    }

    fn dispose(b: Block) {
        let (base, len) = b.into_raw().into_parts();
        unsafe { SystemAlloc.release(base, len) };
    }

    fn lines(reg: &Registry) -> Vec<u32> {
        reg.iter().map(|(_, b)| b.origin().line).collect()
    }

    #[test]
    fn iteration_is_most_recent_first() {
        let mut reg = Registry::new();
        for line in 1..=4 {
            reg.register(block(8, line));
        }
        assert_eq!(lines(&reg), vec![4, 3, 2, 1]);
        // Restartable.
        assert_eq!(lines(&reg), vec![4, 3, 2, 1]);
        reg.drain().into_iter().for_each(dispose);
    }

    #[test]
    fn unlink_from_middle_front_and_back() {
        let mut reg = Registry::new();
        let ids: Vec<BlockId> = (1..=5).map(|l| reg.register(block(1, l))).collect();

        dispose(reg.unregister(ids[2]).unwrap());
        assert_eq!(lines(&reg), vec![5, 4, 2, 1]);
        dispose(reg.unregister(ids[4]).unwrap());
        assert_eq!(lines(&reg), vec![4, 2, 1]);
        dispose(reg.unregister(ids[0]).unwrap());
        assert_eq!(lines(&reg), vec![4, 2]);
        assert_eq!(reg.len(), 2);
        reg.drain().into_iter().for_each(dispose);
        assert!(reg.is_empty());
    }

    #[test]
    fn stale_ids_are_rejected() {
        let mut reg = Registry::new();
        let first = reg.register(block(3, 1));
        dispose(reg.unregister(first).unwrap());
        assert!(reg.unregister(first).is_none());

        // Same slot, new generation.
        let second = reg.register(block(3, 2));
        assert_ne!(first, second);
        assert!(reg.get(first).is_none());
        assert!(reg.unregister(first).is_none());
        assert_eq!(reg.get(second).unwrap().origin().line, 2);
        dispose(reg.unregister(second).unwrap());
    }

    #[test]
    fn lookups_by_address() {
        let mut reg = Registry::new();
        let id = reg.register(block(10, 1));
        let addr = reg.get(id).unwrap().raw.address();

        assert_eq!(reg.find(addr), Some(id));
        assert_eq!(reg.find(addr + 1), None);
        assert_eq!(reg.find_containing(addr + 9), Some(id));
        assert_eq!(reg.find_containing(addr + 10), None);
        reg.drain().into_iter().for_each(dispose);
    }

    #[test]
    fn head_is_never_a_block() {
        let mut reg = Registry::new();
        let head = BlockId { index: HEAD, generation: 0 };
        assert!(reg.unregister(head).is_none());
        assert_eq!(Registry::head_origin(), Origin::new("noname", 11111));
    }
}
