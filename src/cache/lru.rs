//! Slot arena with an intrusive recency list.
//!
//! Entries live in a `Vec` of slots addressed by index. The recency list is
//! threaded through the slots with `prev`/`next` indices (head = most recently
//! used, tail = least recently used), and a `HashMap` maps keys to slot
//! indices. Freed slots are recycled through a free list; every reuse bumps the
//! slot generation so stale handles never touch a newer entry.
//!
//! Not thread-safe on its own. [`super::ResponseCache`] owns it behind the
//! structural lock.

use std::collections::{HashMap, TryReserveError};

use bytes::Bytes;

/// Stable reference to an occupied slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SlotId {
    index: usize,
    generation: u64,
}

#[derive(Debug)]
struct Node {
    key: String,
    value: Bytes,
    pins: usize,
    generation: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

/// An entry detached from the index.
#[derive(Debug)]
pub(crate) struct Removed {
    pub key: String,
    pub value: Bytes,
    pub pins: usize,
}

#[derive(Debug, Default)]
pub(crate) struct LruIndex {
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    map: HashMap<String, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    total_size: usize,
    pinned: usize,
    next_generation: u64,
}

impl LruIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Sum of value lengths over all resident entries.
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Number of resident entries with at least one pin.
    pub fn pinned(&self) -> usize {
        self.pinned
    }

    pub fn find(&self, key: &str) -> Option<SlotId> {
        let index = *self.map.get(key)?;
        self.node(index).map(|node| SlotId {
            index,
            generation: node.generation,
        })
    }

    pub fn value(&self, id: SlotId) -> Option<&Bytes> {
        self.live(id).map(|node| &node.value)
    }

    /// Pin the entry and move it to the most-recently-used position.
    pub fn pin_and_promote(&mut self, id: SlotId) -> Option<Bytes> {
        let node = self.live_mut(id)?;
        node.pins += 1;
        let first_pin = node.pins == 1;
        let value = node.value.clone();
        if first_pin {
            self.pinned += 1;
        }
        self.unlink(id.index);
        self.link_front(id.index);
        Some(value)
    }

    /// Drop one pin. Returns the remaining pin count, or `None` when the
    /// handle no longer refers to a resident entry.
    pub fn unpin(&mut self, id: SlotId) -> Option<usize> {
        let node = self.live_mut(id)?;
        if node.pins == 0 {
            return Some(0);
        }
        node.pins -= 1;
        let remaining = node.pins;
        if remaining == 0 {
            self.pinned -= 1;
        }
        Some(remaining)
    }

    /// Insert a new entry at the most-recently-used position.
    ///
    /// The caller guarantees the key is absent. Bookkeeping storage is
    /// reserved fallibly so allocation failure comes back as an error.
    pub fn push_front(&mut self, key: String, value: Bytes) -> Result<SlotId, TryReserveError> {
        self.map.try_reserve(1)?;
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.try_reserve(1)?;
                self.slots.push(None);
                self.slots.len() - 1
            }
        };

        self.next_generation += 1;
        let generation = self.next_generation;
        let size = value.len();
        self.slots[index] = Some(Node {
            key: key.clone(),
            value,
            pins: 0,
            generation,
            prev: None,
            next: None,
        });
        if let Some(stale) = self.map.insert(key, index) {
            // never orphan a slot the map no longer points at
            self.detach(stale);
        }
        self.link_front(index);
        self.total_size += size;
        Ok(SlotId { index, generation })
    }

    /// Least-recently-used entry that carries no pins.
    pub fn lru_unpinned(&self) -> Option<SlotId> {
        let mut cursor = self.tail;
        while let Some(index) = cursor {
            let node = self.node(index)?;
            if node.pins == 0 {
                return Some(SlotId {
                    index,
                    generation: node.generation,
                });
            }
            cursor = node.prev;
        }
        None
    }

    /// Detach an entry from the map and the recency list.
    pub fn remove(&mut self, id: SlotId) -> Option<Removed> {
        self.live(id)?;
        let removed = self.detach(id.index)?;
        self.map.remove(&removed.key);
        Some(removed)
    }

    /// Detach every entry. Returns the number of entries that were still
    /// pinned; their bytes stay alive through the outstanding handles.
    pub fn clear(&mut self) -> usize {
        let pinned = self.pinned;
        self.slots.clear();
        self.free.clear();
        self.map.clear();
        self.head = None;
        self.tail = None;
        self.total_size = 0;
        self.pinned = 0;
        pinned
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.map.len());
        let mut cursor = self.head;
        while let Some(node) = cursor.and_then(|index| self.node(index)) {
            keys.push(node.key.clone());
            cursor = node.next;
        }
        keys
    }

    fn node(&self, index: usize) -> Option<&Node> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, index: usize) -> Option<&mut Node> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    fn live(&self, id: SlotId) -> Option<&Node> {
        self.node(id.index).filter(|node| node.generation == id.generation)
    }

    fn live_mut(&mut self, id: SlotId) -> Option<&mut Node> {
        self.node_mut(id.index)
            .filter(|node| node.generation == id.generation)
    }

    fn detach(&mut self, index: usize) -> Option<Removed> {
        self.node(index)?;
        self.unlink(index);
        let node = self.slots[index].take()?;
        self.free.push(index);
        self.total_size -= node.value.len();
        if node.pins > 0 {
            self.pinned -= 1;
        }
        Some(Removed {
            key: node.key,
            value: node.value,
            pins: node.pins,
        })
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = match self.node_mut(index) {
            Some(node) => (node.prev.take(), node.next.take()),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(node) = self.node_mut(p) {
                    node.next = next;
                }
            }
            None if self.head == Some(index) => self.head = next,
            None => {}
        }
        match next {
            Some(n) => {
                if let Some(node) = self.node_mut(n) {
                    node.prev = prev;
                }
            }
            None if self.tail == Some(index) => self.tail = prev,
            None => {}
        }
    }

    fn link_front(&mut self, index: usize) {
        let old_head = self.head;
        if let Some(node) = self.node_mut(index) {
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(node) = self.node_mut(h) {
                node.prev = Some(index);
            }
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
    }
}
