//! Fixed-capacity, allocation-free-after-init LRU cache (`inc/cache.h`),
//! used by the volume and file caches. Storage is a `Vec` sized once at
//! construction and never grown or shrunk afterward, the idiomatic Rust
//! analogue of the original's caller-supplied memory range.

use std::collections::HashMap;

use log::trace;

struct Entry<const ITEM_SZ: usize> {
    id: u32,
    data: [u8; ITEM_SZ],
    /// Toward the LRU (oldest) end of the list.
    prev: Option<usize>,
    /// Toward the MRU (newest) end of the list.
    next: Option<usize>,
}

/// An associative fixed-capacity store indexed by a 32-bit key, with
/// strict-LRU eviction. `lookup` is O(1) expected and does not disturb LRU
/// order; `lookup_mut`/`update`/`update_mut` place their target at MRU.
pub struct BlockCache<const ITEM_SZ: usize> {
    entries: Vec<Entry<ITEM_SZ>>,
    index: HashMap<u32, usize>,
    /// Free slots, populated up front and drained as entries are inserted;
    /// once empty every `update` evicts rather than grows.
    free: Vec<usize>,
    lru_head: Option<usize>,
    lru_tail: Option<usize>,
}

impl<const ITEM_SZ: usize> BlockCache<ITEM_SZ> {
    /// Reserves `entry_cnt` entries. Mirrors `cache_init`: the returned
    /// cache's effective capacity is exactly `entry_cnt`.
    pub fn init(entry_cnt: usize) -> Self {
        let mut free = Vec::with_capacity(entry_cnt);
        let mut entries = Vec::with_capacity(entry_cnt);
        for i in 0..entry_cnt {
            entries.push(Entry {
                id: 0,
                data: [0; ITEM_SZ],
                prev: None,
                next: None,
            });
            free.push(entry_cnt - 1 - i);
        }
        Self {
            entries,
            index: HashMap::with_capacity(entry_cnt),
            free,
            lru_head: None,
            lru_tail: None,
        }
    }

    pub fn entry_cnt(&self) -> usize {
        self.entries.len()
    }

    /// Number of entries currently occupied.
    pub fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    /// Read-only lookup; does not mutate LRU position.
    pub fn lookup(&self, id: u32) -> Option<&[u8; ITEM_SZ]> {
        self.index.get(&id).map(|&slot| &self.entries[slot].data)
    }

    /// Lookup that promotes the entry to MRU on a hit.
    pub fn lookup_mut(&mut self, id: u32) -> Option<&mut [u8; ITEM_SZ]> {
        let slot = *self.index.get(&id)?;
        self.touch_mru(slot);
        Some(&mut self.entries[slot].data)
    }

    /// Inserts or overwrites `id` with `data`, always placing it at MRU.
    /// Evicts the LRU entry if the cache is full and `id` was absent.
    pub fn update(&mut self, id: u32, data: &[u8; ITEM_SZ]) {
        let (slot, _created) = self.slot_for(id);
        self.entries[slot].data = *data;
    }

    /// Like [`Self::update`] but hands back a mutable reference to the
    /// (possibly freshly-created, uninitialized) entry instead of copying
    /// data in, plus whether the entry was newly created.
    pub fn update_mut(&mut self, id: u32) -> (&mut [u8; ITEM_SZ], bool) {
        let (slot, created) = self.slot_for(id);
        (&mut self.entries[slot].data, created)
    }

    /// The entry that would be evicted by the next `update` of an absent
    /// id, i.e. the current LRU end. `None` if the cache holds no entries.
    pub fn lru(&self) -> Option<(u32, &[u8; ITEM_SZ])> {
        let slot = self.lru_head?;
        Some((self.entries[slot].id, &self.entries[slot].data))
    }

    /// The entry one step closer to MRU than `id`, or `None` if `id` is the
    /// most-recently-used entry (or not present).
    pub fn lru_next(&self, id: u32) -> Option<(u32, &[u8; ITEM_SZ])> {
        let slot = *self.index.get(&id)?;
        let next = self.entries[slot].next?;
        Some((self.entries[next].id, &self.entries[next].data))
    }

    /// Full scan of the LRU order from the oldest end; equivalent to
    /// [`Self::lru`] for this implementation, which always knows its LRU
    /// head exactly rather than approximating it.
    pub fn lru_search(&self) -> Option<(u32, &[u8; ITEM_SZ])> {
        self.lru()
    }

    fn slot_for(&mut self, id: u32) -> (usize, bool) {
        if let Some(&slot) = self.index.get(&id) {
            self.touch_mru(slot);
            return (slot, false);
        }
        let slot = if let Some(slot) = self.free.pop() {
            slot
        } else {
            let victim = self.lru_head.expect("full cache has an LRU head");
            trace!("cache: evicting id {} for id {id}", self.entries[victim].id);
            self.unlink(victim);
            self.index.remove(&self.entries[victim].id);
            victim
        };
        self.entries[slot].id = id;
        self.index.insert(id, slot);
        self.push_mru(slot);
        (slot, true)
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.entries[slot].prev, self.entries[slot].next);
        match prev {
            Some(p) => self.entries[p].next = next,
            None => self.lru_head = next,
        }
        match next {
            Some(n) => self.entries[n].prev = prev,
            None => self.lru_tail = prev,
        }
        self.entries[slot].prev = None;
        self.entries[slot].next = None;
    }

    fn push_mru(&mut self, slot: usize) {
        self.entries[slot].prev = self.lru_tail;
        self.entries[slot].next = None;
        match self.lru_tail {
            Some(t) => self.entries[t].next = Some(slot),
            None => self.lru_head = Some(slot),
        }
        self.lru_tail = Some(slot);
    }

    fn touch_mru(&mut self, slot: usize) {
        if self.lru_tail == Some(slot) {
            return;
        }
        self.unlink(slot);
        self.push_mru(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_lookup_roundtrip() {
        let mut c: BlockCache<4> = BlockCache::init(2);
        c.update(1, &[1, 2, 3, 4]);
        assert_eq!(c.lookup(1), Some(&[1, 2, 3, 4]));
        assert_eq!(c.lookup(2), None);
    }

    #[test]
    fn no_eviction_within_capacity() {
        let mut c: BlockCache<1> = BlockCache::init(3);
        c.update(1, &[1]);
        c.update(2, &[2]);
        c.update(3, &[3]);
        assert_eq!(c.lookup(1), Some(&[1]));
        assert_eq!(c.lookup(2), Some(&[2]));
        assert_eq!(c.lookup(3), Some(&[3]));
    }

    #[test]
    fn evicts_least_recently_touched() {
        let mut c: BlockCache<1> = BlockCache::init(2);
        c.update(1, &[1]);
        c.update(2, &[2]);
        // Touch 1 so 2 becomes the LRU entry.
        c.lookup_mut(1);
        c.update(3, &[3]);
        assert_eq!(c.lookup(2), None);
        assert_eq!(c.lookup(1), Some(&[1]));
        assert_eq!(c.lookup(3), Some(&[3]));
    }

    #[test]
    fn read_only_lookup_does_not_disturb_order() {
        let mut c: BlockCache<1> = BlockCache::init(2);
        c.update(1, &[1]);
        c.update(2, &[2]);
        // Plain lookup must not promote 1 to MRU.
        c.lookup(1);
        c.update(3, &[3]);
        assert_eq!(c.lookup(1), None);
        assert_eq!(c.lookup(2), Some(&[2]));
    }

    #[test]
    fn lru_and_lru_next_walk_oldest_to_newest() {
        let mut c: BlockCache<1> = BlockCache::init(3);
        c.update(1, &[1]);
        c.update(2, &[2]);
        c.update(3, &[3]);
        let (oldest, _) = c.lru().unwrap();
        assert_eq!(oldest, 1);
        let (mid, _) = c.lru_next(oldest).unwrap();
        assert_eq!(mid, 2);
        let (newest, _) = c.lru_next(mid).unwrap();
        assert_eq!(newest, 3);
        assert!(c.lru_next(newest).is_none());
    }

    #[test]
    fn update_mut_reports_creation() {
        let mut c: BlockCache<2> = BlockCache::init(1);
        let (data, created) = c.update_mut(5);
        assert!(created);
        data.copy_from_slice(&[9, 9]);
        let (_, created_again) = c.update_mut(5);
        assert!(!created_again);
        assert_eq!(c.lookup(5), Some(&[9, 9]));
    }
}
