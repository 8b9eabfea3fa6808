//! Sample-clock constants shared by every format's geometry calculation.

use crate::SampleTicks;

/// Nanoseconds per sample-clock tick.
pub const NS_PER_TICK: i16 = 125;

/// Nominal revolution time for a 300 RPM drive, in sample-clock ticks
/// (200 ms / 125 ns).
pub const NOMINAL_STK_PER_REV: SampleTicks = 1_600_000;

/// Ticks per MFM double-density bitcell (2 us), fixed-point x16.
pub const MFM_DD_TICKS_PER_CELL_X16: u32 = 16 * 16;

/// Ticks per MFM high-density bitcell (1 us), fixed-point x16.
pub const MFM_HD_TICKS_PER_CELL_X16: u32 = 8 * 16;

/// Ticks per FM single-density bitcell (4 us), fixed-point x16.
pub const FM_TICKS_PER_CELL_X16: u32 = 32 * 16;
