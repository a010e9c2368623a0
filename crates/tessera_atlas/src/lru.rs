//! Intrusive LRU list over the entry arena
//!
//! Links live inside [`CacheEntry`] as arena handles, so promoting an entry
//! on every hit is a constant number of handle writes and never allocates.
//! The head is the most recently used entry.

use slotmap::SlotMap;

use crate::entry::{CacheEntry, EntryId};

#[derive(Debug, Default)]
pub(crate) struct LruList {
    head: Option<EntryId>,
    tail: Option<EntryId>,
    len: usize,
}

impl LruList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub(crate) fn head(&self) -> Option<EntryId> {
        self.head
    }

    /// Link an unlinked entry as most recently used
    pub(crate) fn push_front(&mut self, arena: &mut SlotMap<EntryId, CacheEntry>, id: EntryId) {
        let old_head = self.head;
        {
            let entry = &mut arena[id];
            entry.lru_prev = None;
            entry.lru_next = old_head;
        }
        match old_head {
            Some(head) => arena[head].lru_prev = Some(id),
            None => self.tail = Some(id),
        }
        self.head = Some(id);
        self.len += 1;
    }

    /// Remove a linked entry from the list
    pub(crate) fn unlink(&mut self, arena: &mut SlotMap<EntryId, CacheEntry>, id: EntryId) {
        let entry = &mut arena[id];
        let (prev, next) = (entry.lru_prev.take(), entry.lru_next.take());
        match prev {
            Some(prev) => arena[prev].lru_next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => arena[next].lru_prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    /// Promote a linked entry to most recently used
    pub(crate) fn touch(&mut self, arena: &mut SlotMap<EntryId, CacheEntry>, id: EntryId) {
        if self.head == Some(id) {
            return;
        }
        self.unlink(arena, id);
        self.push_front(arena, id);
    }

    /// Least recently used entry accepted by `pred`, scanning from the tail
    pub(crate) fn find_from_tail<F>(
        &self,
        arena: &SlotMap<EntryId, CacheEntry>,
        mut pred: F,
    ) -> Option<EntryId>
    where
        F: FnMut(&CacheEntry) -> bool,
    {
        let mut cursor = self.tail;
        while let Some(id) = cursor {
            let entry = &arena[id];
            if pred(entry) {
                return Some(id);
            }
            cursor = entry.lru_prev;
        }
        None
    }

    /// Entries from most to least recently used
    pub(crate) fn iter<'a>(
        &self,
        arena: &'a SlotMap<EntryId, CacheEntry>,
    ) -> impl Iterator<Item = EntryId> + 'a {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let id = cursor?;
            cursor = arena[id].lru_next;
            Some(id)
        })
    }
}
