//! Block-device transport and the sector-granularity cache in front of it
//! (`spec.md` §2's "volume cache"/§6's block-device interface).

use ff_floppy::SECTOR_SIZE;

use crate::cache::BlockCache;

/// Outcome of a `BlockDevice` read/write, matching the four-way result the
/// source's storage layer returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    Ok,
    Error,
    WriteProtect,
    NotReady,
    ParamError,
}

/// The transport the core consumes: USB mass-storage or SD-SPI, each
/// presenting 512-byte-sector block I/O. LBA 0 (the volume boot sector) is
/// never touched by the core; callers assert this at the one call site
/// that would otherwise allow it.
pub trait BlockDevice {
    fn read(&mut self, lba: u32, count: u32, buf: &mut [u8]) -> IoStatus;
    fn write(&mut self, lba: u32, count: u32, buf: &[u8]) -> IoStatus;
    fn connected(&self) -> bool;
    fn readonly(&self) -> bool;
}

/// Latches reads from a [`BlockDevice`] into a small LRU of 512-byte
/// sectors so producers (the file cache) can issue a read and yield
/// without blocking on the transport.
pub struct VolumeCache {
    cache: BlockCache<SECTOR_SIZE>,
    pending: Option<u32>,
}

impl VolumeCache {
    pub fn new(entry_cnt: usize) -> Self {
        Self {
            cache: BlockCache::init(entry_cnt),
            pending: None,
        }
    }

    /// Returns the cached sector if present; otherwise kicks off a read on
    /// `dev` and returns `None` until `progress` lands it.
    pub fn peek(&mut self, dev: &mut impl BlockDevice, lba: u32) -> Option<&[u8; SECTOR_SIZE]> {
        assert_ne!(lba, 0, "LBA 0 is never touched by the core");
        if self.cache.lookup(lba).is_some() {
            return self.cache.lookup_mut(lba).map(|d| &*d);
        }
        if self.pending.is_none() {
            self.pending = Some(lba);
            let (data, _) = self.cache.update_mut(lba);
            let mut buf = [0u8; SECTOR_SIZE];
            if dev.read(lba, 1, &mut buf) == IoStatus::Ok {
                *data = buf;
                self.pending = None;
                return self.cache.lookup(lba);
            }
        }
        None
    }

    /// Drives an outstanding read to completion; call from the foreground
    /// yield loop.
    pub fn progress(&mut self, dev: &mut impl BlockDevice) {
        let Some(lba) = self.pending else { return };
        let mut buf = [0u8; SECTOR_SIZE];
        if dev.read(lba, 1, &mut buf) == IoStatus::Ok {
            self.cache.update(lba, &buf);
            self.pending = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemDevice {
        sectors: Vec<[u8; SECTOR_SIZE]>,
    }

    impl BlockDevice for MemDevice {
        fn read(&mut self, lba: u32, count: u32, buf: &mut [u8]) -> IoStatus {
            for i in 0..count as usize {
                let sec = &self.sectors[lba as usize + i];
                buf[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(sec);
            }
            IoStatus::Ok
        }
        fn write(&mut self, lba: u32, count: u32, buf: &[u8]) -> IoStatus {
            for i in 0..count as usize {
                self.sectors[lba as usize + i]
                    .copy_from_slice(&buf[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
            }
            IoStatus::Ok
        }
        fn connected(&self) -> bool {
            true
        }
        fn readonly(&self) -> bool {
            false
        }
    }

    #[test]
    fn peek_latches_a_read() {
        let mut dev = MemDevice {
            sectors: vec![[0u8; SECTOR_SIZE]; 4],
        };
        dev.sectors[1][0] = 0xaa;
        let mut vc = VolumeCache::new(2);
        let sector = vc.peek(&mut dev, 1).copied();
        assert_eq!(sector.unwrap()[0], 0xaa);
    }
}
