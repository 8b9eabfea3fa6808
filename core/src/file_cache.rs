//! Per-open-file caching layer over the volume cache (`spec.md` §4.2,
//! grounded in `src/file_cache.c`). Batches reads, coalesces writes, and
//! exposes try-read/try-write that never block plus a read-ahead window.
//!
//! Backing storage is any [`SectorFile`] (the hosted equivalent of FatFs's
//! `FIL`). Each [`crate::cache::BlockCache`] entry holds
//! [`SECTORS_PER_ENTRY`] contiguous 512-byte sectors; the first two bytes
//! of the entry's backing array are repurposed as the per-sector `unread`
//! and `dirty` bitfields (one bit per sector in the entry) so the whole
//! entry (bitfields and sector bytes) lives in a single cache slot
//! without a parallel metadata map to keep in sync on eviction.
//!
//! [`FileCache::progress_with`] takes a [`crate::time::Scheduler`], called
//! first on every tick, standing in for `thread_yield()` at the top of the
//! source's `progress_io`.

use ff_floppy::SECTOR_SIZE;

use crate::cache::BlockCache;
use crate::time::{NullScheduler, Scheduler};

/// Outcome of a backing-store operation, reusing the block-device taxonomy.
pub use crate::volume_cache::IoStatus;

pub const SUBKEY_BITS: u32 = 3;
pub const SECTORS_PER_ENTRY: usize = 1 << SUBKEY_BITS;
const ENTRY_DATA_SIZE: usize = SECTORS_PER_ENTRY * SECTOR_SIZE;
const ENTRY_SIZE: usize = ENTRY_DATA_SIZE + 2;
const UNREAD_IDX: usize = 0;
const DIRTY_IDX: usize = 1;

/// The backing file a [`FileCache`] layers over. Each call is a single
/// synchronous transfer; the file cache itself enforces the "at most one
/// outstanding operation" contract by only ever calling one of these per
/// [`FileCache::progress`] tick, the hosted analogue of the source's
/// async `F_read`/`F_write`/`F_sync` plus `F_async_wait`.
pub trait SectorFile {
    fn read_sectors(&mut self, sector: u32, count: u8, buf: &mut [u8]) -> IoStatus;
    fn write_sectors(&mut self, sector: u32, count: u8, buf: &[u8]) -> IoStatus;
    fn sync(&mut self) -> IoStatus;
}

/// What `progress()` last did, exposed mainly so tests can assert the
/// scheduler picked the right step of the five-step priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoOp {
    #[default]
    Idle,
    Read,
    Write,
    Sync,
}

/// `run` contiguous bits starting at `first`, as an 8-bit mask.
fn run_mask(first: usize, run: usize) -> u8 {
    ((((1u16 << run) - 1) << first) & 0xff) as u8
}

fn block_of(sector: u32) -> u32 {
    sector >> SUBKEY_BITS
}

fn subidx_of(sector: u32) -> usize {
    (sector & (SECTORS_PER_ENTRY as u32 - 1)) as usize
}

fn sector_of(block: u32, sub: usize) -> u32 {
    (block << SUBKEY_BITS) | sub as u32
}

pub struct FileCache<F: SectorFile> {
    file: F,
    cache: BlockCache<ENTRY_SIZE>,
    cur_sector: u32,
    io_max: u8,
    /// Hint pointing at a known-dirty entry, to avoid a full LRU scan on
    /// every schedule tick (the source's `dirty_val`/`dirty_key` pair).
    dirty_hint: Option<u32>,
    readahead_start: u32,
    readahead_end: u32,
    /// Sectors within `[cur_sector, cur_sector + readahead_prio_sectors)`
    /// are prefetched eagerly (step 2); the rest of the declared window is
    /// only scanned opportunistically (step 5).
    readahead_prio_sectors: u32,
    sync_needed: bool,
    sync_requested: bool,
    pub last_op: IoOp,
}

impl<F: SectorFile> FileCache<F> {
    pub fn new(file: F, entry_cnt: usize) -> Self {
        Self {
            file,
            cache: BlockCache::init(entry_cnt),
            cur_sector: 0,
            io_max: 255,
            dirty_hint: None,
            readahead_start: 0,
            readahead_end: 0,
            readahead_prio_sectors: 0,
            sync_needed: false,
            sync_requested: false,
            last_op: IoOp::Idle,
        }
    }

    /// Caps I/O granularity at `n` sectors per transfer. `0` means
    /// unlimited, represented internally as 255 (the format's own cap).
    pub fn io_limit(&mut self, n: u8) {
        self.io_max = if n == 0 { 255 } else { n };
    }

    /// Declares a window of interest starting at `offset` (bytes) for
    /// `length` bytes, of which `priority_bytes` worth immediately past
    /// the cursor is prefetched eagerly.
    pub fn readahead(&mut self, offset: u32, length: u32, priority_bytes: u32) {
        let start = offset / SECTOR_SIZE as u32;
        let sectors = length.div_ceil(SECTOR_SIZE as u32);
        self.readahead_start = start;
        self.readahead_end = start + sectors;
        self.readahead_prio_sectors = priority_bytes.div_ceil(SECTOR_SIZE as u32);
    }

    /// Returns the cached 512-byte sector at `offset` if populated;
    /// otherwise starts a read (or joins one already in flight) and
    /// returns `None`. `offset` must be sector-aligned.
    pub fn peek_read(&mut self, offset: u32) -> Option<&[u8; SECTOR_SIZE]> {
        debug_assert_eq!(offset % SECTOR_SIZE as u32, 0);
        let sector = offset / SECTOR_SIZE as u32;
        self.cur_sector = sector;
        let block = block_of(sector);
        let sub = subidx_of(sector);

        if self.cache.lookup(block).is_none() {
            self.ensure_room_for(block);
            let (raw, _created) = self.cache.update_mut(block);
            raw[UNREAD_IDX] = 0xff;
            raw[DIRTY_IDX] = 0;
        }
        let raw = self.cache.lookup(block).expect("just inserted");
        if raw[UNREAD_IDX] & (1 << sub) != 0 {
            return None;
        }
        let start = 2 + sub * SECTOR_SIZE;
        Some(array_ref(&raw[start..start + SECTOR_SIZE]))
    }

    /// Like [`Self::peek_read`] but hands back a mutable borrow and marks
    /// the sector dirty. If the sector is absent it is allocated and a
    /// read is initiated so a sub-sector write can be merged in once the
    /// read lands; `None` is returned until then.
    pub fn peek_write(&mut self, offset: u32) -> Option<&mut [u8; SECTOR_SIZE]> {
        debug_assert_eq!(offset % SECTOR_SIZE as u32, 0);
        let sector = offset / SECTOR_SIZE as u32;
        self.cur_sector = sector;
        let block = block_of(sector);
        let sub = subidx_of(sector);

        if self.cache.lookup(block).is_none() {
            self.ensure_room_for(block);
            let (raw, _created) = self.cache.update_mut(block);
            raw[UNREAD_IDX] = 0xff;
            raw[DIRTY_IDX] = 0;
            return None;
        }
        let raw = self.cache.lookup_mut(block).expect("checked present");
        if raw[UNREAD_IDX] & (1 << sub) != 0 {
            return None;
        }
        raw[DIRTY_IDX] |= 1 << sub;
        self.dirty_hint.get_or_insert(block);
        self.sync_needed = true;
        let start = 2 + sub * SECTOR_SIZE;
        Some(array_mut_ref(&mut raw[start..start + SECTOR_SIZE]))
    }

    /// Sub-sector read. Returns `true` only if the backing sector is
    /// cached and populated; `n` must not cross a sector boundary.
    pub fn try_read(&mut self, buf: &mut [u8], offset: u32, n: usize) -> bool {
        let sector_off = offset / SECTOR_SIZE as u32 * SECTOR_SIZE as u32;
        let within = (offset - sector_off) as usize;
        assert!(within + n <= SECTOR_SIZE, "try_read must not cross a sector");
        let Some(sector) = self.peek_read(sector_off) else {
            return false;
        };
        buf[..n].copy_from_slice(&sector[within..within + n]);
        true
    }

    /// Sub-sector write via read-modify-write, with a fast path for
    /// exact 512-byte aligned writes that skips the read entirely, unless
    /// a read for that sector is already in flight, in which case
    /// the caller must retry.
    pub fn try_write(&mut self, buf: &[u8], offset: u32, n: usize) -> bool {
        if n == SECTOR_SIZE && offset % SECTOR_SIZE as u32 == 0 {
            let sector = offset / SECTOR_SIZE as u32;
            self.cur_sector = sector;
            let block = block_of(sector);
            let sub = subidx_of(sector);
            if self.cache.lookup(block).is_none() {
                self.ensure_room_for(block);
                let (raw, _created) = self.cache.update_mut(block);
                raw[UNREAD_IDX] = 0xff & !(1 << sub);
                raw[DIRTY_IDX] = 1 << sub;
                let start = 2 + sub * SECTOR_SIZE;
                raw[start..start + SECTOR_SIZE].copy_from_slice(buf);
                self.dirty_hint.get_or_insert(block);
                self.sync_needed = true;
                return true;
            }
            let raw = self.cache.lookup_mut(block).expect("checked present");
            if raw[UNREAD_IDX] & (1 << sub) != 0 {
                // A read for this sector is already in flight: the fast
                // path would stomp on data the read hasn't populated yet.
                return false;
            }
            raw[DIRTY_IDX] |= 1 << sub;
            let start = 2 + sub * SECTOR_SIZE;
            raw[start..start + SECTOR_SIZE].copy_from_slice(buf);
            self.dirty_hint.get_or_insert(block);
            self.sync_needed = true;
            return true;
        }

        let sector_off = offset / SECTOR_SIZE as u32 * SECTOR_SIZE as u32;
        let within = (offset - sector_off) as usize;
        assert!(within + n <= SECTOR_SIZE, "try_write must not cross a sector");
        let Some(sector) = self.peek_write(sector_off) else {
            return false;
        };
        sector[within..within + n].copy_from_slice(buf);
        true
    }

    /// Requests all dirty entries be flushed and the backing file synced;
    /// returns immediately.
    pub fn sync(&mut self) {
        self.sync_requested = true;
    }

    /// Blocks (calling `progress` repeatedly) until every dirty sector and
    /// a file-level sync have landed.
    pub fn sync_wait(&mut self) {
        self.sync();
        let budget = self.cache.entry_cnt() * SECTORS_PER_ENTRY + 16;
        for _ in 0..budget {
            if !self.sync_needed && !self.sync_requested {
                return;
            }
            self.progress();
        }
        debug_assert!(!self.sync_needed, "sync_wait exceeded its I/O budget");
    }

    /// [`Self::progress_with`] against a [`NullScheduler`], for a caller
    /// with nothing else to yield to.
    pub fn progress(&mut self) -> IoOp {
        self.progress_with(&mut NullScheduler)
    }

    /// Pumps one unit of outstanding I/O per the five-step scheduler and
    /// returns what it did. Calls `scheduler.yield_now()` first, mirroring
    /// `progress_io`'s `thread_yield()` as the very first action of every
    /// tick.
    pub fn progress_with(&mut self, scheduler: &mut impl Scheduler) -> IoOp {
        scheduler.yield_now();
        self.last_op = IoOp::Idle;

        // Keep the current-cursor entry at MRU before any readahead insert
        // might evict from a full cache, so it is never the eviction
        // candidate while still in use (testable property: readahead bound).
        let cur_block = block_of(self.cur_sector);
        self.cache.lookup_mut(cur_block);

        // Step 1: the high-priority current sector, if unread.
        if let Some(raw) = self.cache.lookup(cur_block) {
            let sub = subidx_of(self.cur_sector);
            if raw[UNREAD_IDX] & (1 << sub) != 0 {
                self.issue_read(cur_block);
                return self.last_op;
            }
        }

        // Step 2: eager readahead window.
        let prio_end = self
            .cur_sector
            .saturating_add(self.readahead_prio_sectors)
            .min(self.readahead_end);
        if let Some(sector) = self.find_or_alloc_unread_in(self.cur_sector, prio_end) {
            self.issue_read(block_of(sector));
            return self.last_op;
        }

        // Step 3: dirty writeback.
        if let Some(block) = self.find_dirty() {
            self.issue_write(block);
            return self.last_op;
        }

        // Step 4: file-level sync.
        if self.sync_requested {
            self.file.sync();
            self.sync_requested = false;
            self.sync_needed = false;
            self.last_op = IoOp::Sync;
            return self.last_op;
        }

        // Step 5: opportunistic scan of the rest of the declared window.
        if let Some(sector) = self.find_or_alloc_unread_in(self.readahead_start, self.readahead_end)
        {
            self.issue_read(block_of(sector));
        }
        self.last_op
    }

    /// Finds the first unread sector in `[start, end)`, allocating a fresh
    /// (all-unread) cache entry for any block in the window that isn't
    /// cached yet at all: a block the cursor has never visited is exactly
    /// as "unread" as one that's cached but flagged unread.
    fn find_or_alloc_unread_in(&mut self, start: u32, end: u32) -> Option<u32> {
        if start >= end {
            return None;
        }
        let cur_block = block_of(self.cur_sector);
        let mut sector = start;
        while sector < end {
            let block = block_of(sector);
            if self.cache.lookup(block).is_none() {
                if block == cur_block {
                    // Already handled by step 1; skip past this block's
                    // sectors rather than double-allocating it here.
                    sector = sector_of(block + 1, 0);
                    continue;
                }
                self.ensure_room_for(block);
                let (raw, _created) = self.cache.update_mut(block);
                raw[UNREAD_IDX] = 0xff;
                raw[DIRTY_IDX] = 0;
                return Some(sector);
            }
            let raw = self.cache.lookup(block).expect("checked present");
            let sub = subidx_of(sector);
            if raw[UNREAD_IDX] & (1 << sub) != 0 {
                return Some(sector);
            }
            sector += 1;
        }
        None
    }

    fn find_dirty(&self) -> Option<u32> {
        if let Some(hint) = self.dirty_hint {
            if self.cache.lookup(hint).is_some_and(|raw| raw[DIRTY_IDX] != 0) {
                return Some(hint);
            }
        }
        self.scan_for_dirty(self.dirty_hint)
            .or_else(|| self.scan_for_dirty(None))
    }

    /// Walks LRU order strictly after `after` (or from the LRU head if
    /// `None`) toward MRU, returning the first dirty entry found.
    fn scan_for_dirty(&self, after: Option<u32>) -> Option<u32> {
        let mut cur = after;
        loop {
            let next = match cur {
                Some(id) => self.cache.lru_next(id),
                None => self.cache.lru(),
            };
            let (id, raw) = next?;
            if raw[DIRTY_IDX] != 0 {
                return Some(id);
            }
            cur = Some(id);
        }
    }

    fn issue_read(&mut self, block: u32) {
        let raw = self.cache.lookup(block).expect("block present");
        let unread = raw[UNREAD_IDX];
        let first = unread.trailing_zeros() as usize;
        let mut run = 1usize;
        while run < SECTORS_PER_ENTRY - first
            && run < self.io_max as usize
            && unread & (1 << (first + run)) != 0
        {
            run += 1;
        }
        let base_sector = sector_of(block, first);
        let mut buf = vec![0u8; run * SECTOR_SIZE];
        let status = self.file.read_sectors(base_sector, run as u8, &mut buf);
        if status == IoStatus::Ok {
            let raw = self.cache.lookup_mut(block).expect("block present");
            let start = 2 + first * SECTOR_SIZE;
            raw[start..start + run * SECTOR_SIZE].copy_from_slice(&buf);
            raw[UNREAD_IDX] &= !run_mask(first, run);
        }
        self.last_op = IoOp::Read;
    }

    fn issue_write(&mut self, block: u32) {
        let raw = self.cache.lookup_mut(block).expect("dirty block present");
        let dirty = raw[DIRTY_IDX];
        let first = dirty.trailing_zeros() as usize;
        let mut run = 1usize;
        while run < SECTORS_PER_ENTRY - first
            && run < self.io_max as usize
            && dirty & (1 << (first + run)) != 0
        {
            run += 1;
        }
        let start = 2 + first * SECTOR_SIZE;
        let buf = raw[start..start + run * SECTOR_SIZE].to_vec();
        // Clear dirty bits before the transfer completes so a write that
        // arrives mid-transfer to the same sector is not silently lost.
        raw[DIRTY_IDX] &= !run_mask(first, run);
        if raw[DIRTY_IDX] == 0 && self.dirty_hint == Some(block) {
            self.dirty_hint = None;
        }
        let base_sector = sector_of(block, first);
        self.file.write_sectors(base_sector, run as u8, &buf);
        self.last_op = IoOp::Write;
    }

    fn ensure_room_for(&mut self, incoming: u32) {
        if !self.cache.is_full() || self.cache.lookup(incoming).is_some() {
            return;
        }
        let cur_block = block_of(self.cur_sector);
        let Some((mut victim, _)) = self.cache.lru() else {
            return;
        };
        // Never pick the entry the cursor is currently parked on; walk
        // forward through LRU order until a safe victim is found.
        while victim == cur_block {
            let Some((next_id, _)) = self.cache.lru_next(victim) else {
                break;
            };
            victim = next_id;
        }
        let dirty = self.cache.lookup(victim).map(|r| r[DIRTY_IDX]).unwrap_or(0);
        if dirty != 0 {
            self.issue_write(victim);
            // A single coalesced run may not clear every dirty bit; flush
            // until the victim is clean so eviction never drops writes.
            while self.cache.lookup(victim).map(|r| r[DIRTY_IDX]).unwrap_or(0) != 0 {
                self.issue_write(victim);
            }
        }
    }
}

fn array_ref(s: &[u8]) -> &[u8; SECTOR_SIZE] {
    s.try_into().expect("sector-sized slice")
}

fn array_mut_ref(s: &mut [u8]) -> &mut [u8; SECTOR_SIZE] {
    s.try_into().expect("sector-sized slice")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemFile {
        sectors: Vec<[u8; SECTOR_SIZE]>,
        synced: bool,
    }

    impl MemFile {
        fn new(n: usize) -> Self {
            Self {
                sectors: vec![[0u8; SECTOR_SIZE]; n],
                synced: false,
            }
        }
    }

    impl SectorFile for MemFile {
        fn read_sectors(&mut self, sector: u32, count: u8, buf: &mut [u8]) -> IoStatus {
            for i in 0..count as usize {
                let s = &self.sectors[sector as usize + i];
                buf[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(s);
            }
            IoStatus::Ok
        }
        fn write_sectors(&mut self, sector: u32, count: u8, buf: &[u8]) -> IoStatus {
            for i in 0..count as usize {
                self.sectors[sector as usize + i]
                    .copy_from_slice(&buf[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
            }
            IoStatus::Ok
        }
        fn sync(&mut self) -> IoStatus {
            self.synced = true;
            IoStatus::Ok
        }
    }

    #[test]
    fn write_then_sync_wait_lands_in_backing_file() {
        let mut fc = FileCache::new(MemFile::new(64), 4);
        let data = [0xa5u8; SECTOR_SIZE];
        assert!(fc.try_write(&data, 3 * SECTOR_SIZE as u32, SECTOR_SIZE));
        fc.sync_wait();
        assert_eq!(fc.file.sectors[3], data);
        assert!(fc.file.synced);
    }

    #[test]
    fn read_then_write_then_reread_sees_new_data() {
        let mut fc = FileCache::new(MemFile::new(64), 4);
        fc.file.sectors[5] = [0x11; SECTOR_SIZE];
        assert!(fc.peek_read(5 * SECTOR_SIZE as u32).is_none());
        fc.progress();
        assert_eq!(fc.peek_read(5 * SECTOR_SIZE as u32).unwrap()[0], 0x11);

        let patch = [0x22u8; SECTOR_SIZE];
        assert!(fc.try_write(&patch, 5 * SECTOR_SIZE as u32, SECTOR_SIZE));
        assert_eq!(fc.peek_read(5 * SECTOR_SIZE as u32).unwrap()[0], 0x22);
        fc.sync_wait();
        assert_eq!(fc.file.sectors[5][0], 0x22);
    }

    #[test]
    fn write_while_read_in_flight_then_retry_succeeds() {
        let mut fc = FileCache::new(MemFile::new(64), 4);
        // Start a read for sector 2 and leave it unresolved.
        assert!(fc.peek_read(2 * SECTOR_SIZE as u32).is_none());
        let attempt = [0x33u8; SECTOR_SIZE];
        assert!(!fc.try_write(&attempt, 2 * SECTOR_SIZE as u32, SECTOR_SIZE));
        fc.progress();
        assert!(fc.try_write(&attempt, 2 * SECTOR_SIZE as u32, SECTOR_SIZE));
        assert_eq!(fc.peek_read(2 * SECTOR_SIZE as u32).unwrap(), &attempt);
    }

    #[test]
    fn current_sector_survives_readahead_eviction_pressure() {
        // Cache holds 2 entries (2 * 8 = 16 sectors); read a wide window.
        let mut fc = FileCache::new(MemFile::new(256), 2);
        fc.readahead(0, 64 * SECTOR_SIZE as u32, 0);
        assert!(fc.peek_read(10 * SECTOR_SIZE as u32).is_none());
        for _ in 0..64 {
            fc.progress();
            // cur_sector's block must always still resolve without
            // triggering a fresh read once it has landed once.
        }
        assert!(fc.peek_read(10 * SECTOR_SIZE as u32).is_some());
    }

    #[test]
    fn scheduler_prefers_dirty_writeback_over_low_priority_readahead() {
        let mut fc = FileCache::new(MemFile::new(64), 4);
        fc.try_write(&[0x7u8; SECTOR_SIZE], 0, SECTOR_SIZE);
        fc.readahead(8 * SECTOR_SIZE as u32, 8 * SECTOR_SIZE as u32, 0);
        // cur_sector tracks the last peek_read/peek_write/try_* call;
        // force it away from the dirty sector so step 1 doesn't also match.
        fc.cur_sector = 20;
        let op = fc.progress();
        assert_eq!(op, IoOp::Write);
    }

    #[derive(Default)]
    struct CountingScheduler(u32);

    impl Scheduler for CountingScheduler {
        fn yield_now(&mut self) {
            self.0 += 1;
        }
    }

    #[test]
    fn progress_with_yields_exactly_once_per_tick() {
        let mut fc = FileCache::new(MemFile::new(64), 4);
        let mut sched = CountingScheduler::default();
        fc.progress_with(&mut sched);
        fc.progress_with(&mut sched);
        assert_eq!(sched.0, 2);
    }
}
