//! On-disk/on-wire floppy image formats.
//!
//! This crate is the image/format layer of the FlashFloppy core: it knows
//! how to turn bytes sitting in an image file into a stream of bitcells (and
//! ultimately flux-interval samples for the RDATA pin), and how to turn
//! WDATA-decoded bitcells back into bytes to persist. It does not know
//! anything about timers, DMA, or interrupts; that is `ff_core`'s job.

pub mod bitcell;
pub mod flux;
pub mod format;
pub mod mfm;

use std::fmt;

use thiserror::Error;

/// A tick of the sample clock used for flux-interval timing (high-MHz).
///
/// This is distinct from `ff_core::time::Ticks`, which runs at the coarse
/// scheduling clock; the conversion factor between the two is a compile-time
/// constant owned by `ff_core`.
pub type SampleTicks = u32;

/// Number of bitcells making up one full revolution of a track.
pub type BitcellCount = u32;

/// A single decoded 512-byte sector.
pub const SECTOR_SIZE: usize = 512;

/// Errors a format handler can report while validating or decoding an image.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("file size {size} does not match any known geometry for this format")]
    UnrecognisedGeometry { size: u64 },
    #[error("bad format signature")]
    BadSignature,
    #[error("geometry out of bounds: {0}")]
    GeometryOutOfBounds(String),
    #[error("track index {0} out of range")]
    TrackOutOfRange(u16),
    #[error("I/O error reading image: {0}")]
    Io(String),
}

pub type FormatResult<T> = Result<T, FormatError>;

/// Encoding used on a track (or a whole disk, for single-encoding formats).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Mfm,
    Fm,
    /// Raw bitstream already encoded in the image file (HFE).
    RawBitstream,
}

/// Static geometry of a mounted image, computed once by `open`.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub nr_cyls: u16,
    pub nr_sides: u8,
    /// Bitcells in one full revolution of any track (tracks may differ for
    /// variable-geometry formats; this is the handler's declared nominal).
    pub tracklen_bc: BitcellCount,
    /// Sample-clock ticks per bitcell period, as a 16.16 fixed-point value
    /// (i.e. already multiplied by 16 per `spec.md` §4.3's encoding note).
    pub ticks_per_cell_x16: u32,
    /// Sample-clock ticks for one full revolution.
    pub stk_per_rev: SampleTicks,
}

impl Geometry {
    pub fn track_index(&self, cyl: u16, side: u8) -> u16 {
        cyl * self.nr_sides as u16 + side as u16
    }

    pub fn nr_tracks(&self) -> u16 {
        self.nr_cyls * self.nr_sides as u16
    }
}

/// A fixed-capacity ring buffer of raw 32-bit MFM/FM words, shared between a
/// handler's `read_track`/`write_track` and the bitcell-level codec.
///
/// Mirrors `struct image_buf` in `original_source/inc/floppy.h`-adjacent
/// code (`im->bufs.read_bc`/`write_bc`): a power-of-two-length buffer with
/// 16-bit wrapping producer/consumer indices.
#[derive(Debug)]
pub struct RingBuf {
    pub data: Vec<u8>,
    pub prod: u32,
    pub cons: u32,
}

impl RingBuf {
    pub fn new(len: usize) -> Self {
        assert!(len.is_power_of_two(), "ring buffer length must be power of two");
        Self {
            data: vec![0u8; len],
            prod: 0,
            cons: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prod == self.cons
    }

    pub fn mask(&self) -> u32 {
        (self.data.len() as u32) - 1
    }

    pub fn space(&self) -> u32 {
        self.mask() - self.prod.wrapping_sub(self.cons)
    }

    pub fn filled(&self) -> u32 {
        self.prod.wrapping_sub(self.cons)
    }
}

/// One format handler per supported on-disk format (`spec.md` §4.3).
///
/// Implementors own all per-track decode state; `setup_track` repositions
/// the logical head, `read_track`/`write_track` pump bitcells to/from the
/// shared rings, and `rdata_flux` turns queued bitcells into sample-clock
/// reload values for the hardware timer DMA.
pub trait ImageHandler: fmt::Debug {
    /// Validate the backing bytes and compute geometry. Returns `false` (via
    /// `FormatError`) if this handler does not recognise the image.
    fn open(&mut self, data: &[u8]) -> FormatResult<Geometry>;

    /// Position the logical head at `track`. `restart_bc`, if supplied, is
    /// the bitcell offset within the revolution to resume reading from
    /// (post-seek resync); `None` means "start of revolution" (a write).
    fn setup_track(&mut self, data: &[u8], track: u16, restart_bc: Option<BitcellCount>);

    /// Produce more bitcells into `bc_ring`. Returns `false` when the ring
    /// has no more room (caller should retry after draining `rdata_flux`).
    fn read_track(&mut self, data: &[u8], bc_ring: &mut bitcell::BitRing) -> bool;

    /// Consume bitcells from `bc_ring`, decoding sectors into `out` (an
    /// in-memory mirror of the image bytes belonging to the current track).
    /// Returns `true` when the in-flight write is fully drained.
    fn write_track(&mut self, bc_ring: &mut bitcell::BitRing, out: &mut [u8]) -> bool;

    /// Convert queued bitcells into sample-clock interval reload values.
    /// Returns the number of entries written to `out` (`<= out.len()`).
    fn rdata_flux(&mut self, bc_ring: &mut bitcell::BitRing, out: &mut [SampleTicks]) -> usize;

    /// Flush any deferred write state (called at track-change / unmount).
    fn sync(&mut self) {}

    /// Whether the mounted image is considered read-only by the handler
    /// itself (independent of the write-protect pin).
    fn read_only(&self) -> bool {
        false
    }
}
