//! Ties the drive/step state machine, the DMA rings, the write PLL and a
//! mounted [`ImageHandler`] together, grounded end to end in
//! `original_source/src/floppy_generic.c` (`floppy_handle`,
//! `rdata_start`/`rdata_stop`, `wdata_start`/`wdata_stop`) and
//! `original_source/src/floppy.c` (`IRQ_input_changed`, `index_pulse`,
//! the per-drive step debounce loop in `floppy_handle`).
//!
//! This crate is hosted library code with no interrupt controller, so the
//! ISR-priority structure of the source becomes a documented calling
//! contract instead: [`FluxEngine::input_changed`] models the
//! high-priority EXTI handler (must run before any lower-priority method
//! observes a stale step/side/select state); [`FluxEngine::service`] is
//! the cooperative, lowest-priority `floppy_handle` body a driving loop
//! calls whenever it has spare cycles.

use log::{info, warn};

use ff_floppy::bitcell::{bc_rdata_flux, BitRing, FluxAccumulator};
use ff_floppy::{Geometry, ImageHandler, SampleTicks};

use crate::config::WriteDrain;
use crate::dma_ring::{DmaRing, DmaState, WriteQueue};
use crate::drive::{Drive, StepState};
use crate::host::HostSignals;
use crate::pll::Pll;
use crate::error::{CoreError, CoreResult};
use crate::time::Ticks;

const STEP_LATCH_TICKS: Ticks = 2_000; // 2ms, `stk_ms(2)` in floppy_handle's debounce
const HEAD_SETTLE_DEFAULT_TICKS: Ticks = 15_000; // DRIVE_SETTLE_MS in the source
const MAX_CYL_DEFAULT: u8 = 84;
const WRITE_DRAIN_EOT_MARGIN: u32 = 20_000; // stk_ms(20)
/// Index period assumed before any image is mounted (no `stk_per_rev` to
/// read yet) or before the first rdata refill has resynced it; ~200ms at a
/// 300 RPM drive's nominal rate.
const DEFAULT_REV_TICKS: Ticks = 200_000;

/// Bitcell ring capacity; matches `dma_ring::RING_LEN`'s order of
/// magnitude for the bit-addressed rings the handler reads/writes.
const BC_RING_BITS: usize = 1 << 15;

/// Index-pulse phase tracking (`original_source/src/floppy.c`'s `index`
/// struct, generalized away from the register-level detail it doesn't
/// need: `fake_fired`'s IRQ-softirq dance is a hosted no-op here).
#[derive(Debug, Clone, Copy, Default)]
struct IndexTiming {
    prev_time: Ticks,
    next_deadline: Option<Ticks>,
}

/// The real-time engine for one mounted image on one drive slot. A second
/// drive slot shares `rdata`/`wdata`/`pll` state only implicitly (the
/// source's `struct drive drive[2]` each step independently but only
/// drive 0 drives RDATA/WDATA; this mirrors that by engine-per-drive).
pub struct FluxEngine {
    pub drive: Drive,
    handler: Option<Box<dyn ImageHandler>>,
    geometry: Option<Geometry>,
    image_data: Vec<u8>,

    rdata: DmaRing,
    wdata: DmaRing,
    pll: Pll,
    writes: WriteQueue<4>,

    bc_read: BitRing,
    bc_write: BitRing,
    flux_acc: Option<FluxAccumulator>,

    index: IndexTiming,
    max_cyl: u8,
    head_settle_ticks: Ticks,
    write_drain: WriteDrain,
    index_suppression_cfg: bool,
}

impl FluxEngine {
    pub fn new() -> Self {
        Self {
            drive: Drive::new(),
            handler: None,
            geometry: None,
            image_data: Vec::new(),
            rdata: DmaRing::new(),
            wdata: DmaRing::new(),
            pll: Pll::new(),
            writes: WriteQueue::new(),
            bc_read: BitRing::new(BC_RING_BITS),
            bc_write: BitRing::new(BC_RING_BITS),
            flux_acc: None,
            index: IndexTiming::default(),
            max_cyl: MAX_CYL_DEFAULT,
            head_settle_ticks: HEAD_SETTLE_DEFAULT_TICKS,
            write_drain: WriteDrain::Instant,
            index_suppression_cfg: false,
        }
    }

    pub fn configure(&mut self, max_cyl: u8, head_settle_ticks: Ticks, write_drain: WriteDrain, index_suppression: bool) {
        self.max_cyl = max_cyl;
        self.head_settle_ticks = head_settle_ticks;
        self.write_drain = write_drain;
        self.index_suppression_cfg = index_suppression;
    }

    /// Mounts an image: validates it via the handler's `open` and resets
    /// all pipeline state, matching `image_open` + the zeroed `struct
    /// image` the source starts from on mount.
    pub fn mount(&mut self, mut handler: Box<dyn ImageHandler>, data: Vec<u8>) -> CoreResult<()> {
        let geometry = handler.open(&data).map_err(|e| {
            warn!("mount: image rejected: {e}");
            CoreError::FormatInvalid { reason: e.to_string() }
        })?;
        info!(
            "mount: {} cyls x {} sides, {} bc/track",
            geometry.nr_cyls, geometry.nr_sides, geometry.tracklen_bc
        );
        self.handler = Some(handler);
        self.image_data = data;
        self.geometry = Some(geometry);
        self.drive.image_nr_sides = Some(geometry.nr_sides);
        self.drive.restart_pos = 0;
        self.drive.index_suppressed = self.index_suppression_cfg;
        self.bc_read.reset();
        self.bc_write.reset();
        self.flux_acc = Some(FluxAccumulator::new(geometry.ticks_per_cell_x16, geometry.tracklen_bc));
        self.rdata.quiesce();
        self.wdata.quiesce();
        Ok(())
    }

    pub fn unmount(&mut self) {
        if self.handler.is_some() {
            info!("unmount");
        }
        self.handler = None;
        self.geometry = None;
        self.image_data.clear();
        self.rdata.quiesce();
        self.wdata.quiesce();
        self.drive = Drive::new();
    }

    pub fn is_mounted(&self) -> bool {
        self.handler.is_some()
    }

    /// Models `IRQ_input_changed`: applies a fresh `HostSignals` snapshot,
    /// updating drive select, starting a step pulse on a rising STEP edge,
    /// and handling a SIDE change. Both step and side changes stop RDATA
    /// immediately (`rddat_stop` + `cancel_call`), matching the source's
    /// "any head motion invalidates the in-flight read" rule.
    pub fn input_changed(&mut self, prev: HostSignals, now_signals: HostSignals, now: Ticks) {
        self.drive.sel = now_signals.sel0 || now_signals.sel1;

        let step_rising = now_signals.step && !prev.step;
        if step_rising && self.drive.sel && self.drive.step.state == StepState::Idle {
            let inward = !now_signals.dir;
            let at_rail = if inward { self.drive.cyl >= self.max_cyl } else { self.drive.cyl == 0 };
            if !at_rail {
                self.drive.step_start(inward, now);
                self.rdata_stop();
            }
        }

        if now_signals.side != prev.side {
            self.drive.head = now_signals.side as u8;
            self.rdata_stop();
        }

        if now_signals.wgate && !prev.wgate {
            self.wdata_start(now);
        } else if !now_signals.wgate && prev.wgate {
            self.wdata_stop();
        };
    }

    /// Per-tick step/settle debounce, the per-drive loop at the top of
    /// `floppy_handle`: a step latches after `STEP_LATCH_TICKS`, then
    /// settles for `head_settle_ticks` before the head is usable again.
    pub fn tick_step_debounce(&mut self, now: Ticks) {
        match self.drive.step.state {
            StepState::Started | StepState::Active => {
                if crate::time::time_diff(self.drive.step.start, now) >= STEP_LATCH_TICKS as i32 {
                    // /TRK0 is surfaced via HostOutputs by the caller reading `drive.is_track0()`.
                    self.drive.step_latch(self.max_cyl);
                    self.drive.step_settle();
                }
            }
            StepState::Settling => {
                if crate::time::time_diff(self.drive.step.start, now) >= self.head_settle_ticks as i32 {
                    self.drive.step_finish();
                }
            }
            StepState::Idle | StepState::Latched => {}
        };
    }

    /// Starts the read (RDATA) stream. A no-op if a step just invalidated
    /// it (the source's `rdata_start`'s "raced rdata_stop" bail).
    pub fn rdata_start(&mut self) {
        if self.rdata.state == DmaState::Stopping {
            return;
        }
        self.rdata.state = DmaState::Active;
        if self.drive.step.state == StepState::Settling {
            self.drive.step_finish();
        };
    }

    pub fn rdata_stop(&mut self) {
        let prev = self.rdata.stop();
        if prev == DmaState::Active && !self.drive.index_suppressed {
            self.drive.restart_pos = self.ticks_since_index_estimate();
        };
    }

    /// Refills the read bitcell ring from the mounted image and converts
    /// newly available bitcells into flux intervals, writing them into
    /// `out` (the RDATA DMA ring's backing buffer). Returns the number of
    /// intervals produced.
    ///
    /// If this refill carries the accumulator past the image's declared
    /// `tracklen_bc`, resyncs the index timer: sums the ticks of every
    /// interval just queued, subtracts the ticks the accumulator's
    /// post-wrap cursor already represents, and arms the index deadline
    /// that many ticks from `now` (`IRQ_rdata_dma`'s index-resync step).
    pub fn rdata_refill(&mut self, now: Ticks, out: &mut [SampleTicks]) -> CoreResult<usize> {
        let handler = self.handler.as_mut().ok_or(CoreError::MediaAbsent)?;
        handler.read_track(&self.image_data, &mut self.bc_read);
        let acc = self.flux_acc.as_mut().ok_or(CoreError::MediaAbsent)?;
        let n = bc_rdata_flux(&mut self.bc_read, acc, out);
        if acc.take_wrapped() {
            if let Some(geometry) = self.geometry {
                let queued_ticks: u32 = out[..n].iter().fold(0u32, |a, &b| a.wrapping_add(b));
                let ticks_per_cell = (geometry.ticks_per_cell_x16 / 16).max(1);
                let post_wrap_ticks = acc.bc_since_index().wrapping_mul(ticks_per_cell);
                let ticks_until_index = queued_ticks.saturating_sub(post_wrap_ticks);
                self.index.prev_time = self.index.next_deadline.unwrap_or(now);
                self.index.next_deadline = Some(now.wrapping_add(ticks_until_index));
            }
        }
        Ok(n)
    }

    /// Starts the write (WDATA) pipeline; a WGATE glitch while already
    /// active is silently ignored, matching `wdata_start`'s `DMA_starting
    /// | DMA_active` early-return.
    pub fn wdata_start(&mut self, now: Ticks) -> bool {
        if !self.wdata.start() {
            return false;
        }
        self.pll.reset();
        self.drive.writing = false;
        self.drive.index_suppressed = false;
        if self.drive.step.state == StepState::Settling {
            self.drive.step_finish();
        }
        let slot = self.writes.next_slot();
        slot.start_sample_time = now;
        slot.track = self.drive.track_index().unwrap_or(0) as u16;
        true
    }

    /// Stops the write pipeline, applying the configured write-drain
    /// policy to `drive.restart_pos`/`index_suppressed` exactly as
    /// `wdata_stop` does per `WriteDrain` variant.
    pub fn wdata_stop(&mut self) {
        let prev = self.wdata.stop();
        if matches!(prev, DmaState::Inactive | DmaState::Stopping) {
            return;
        }
        match self.write_drain {
            WriteDrain::Instant => {
                self.drive.restart_pos = self.ticks_since_index_estimate();
                self.drive.index_suppressed = true;
            }
            WriteDrain::Realtime => {}
            WriteDrain::Eot => {
                let rev = self.geometry.map(|g| g.stk_per_rev).unwrap_or(0);
                self.drive.restart_pos = rev.saturating_sub(WRITE_DRAIN_EOT_MARGIN);
                self.drive.index_suppressed = true;
            }
        }
        self.writes.push();
    }

    /// Feeds one batch of captured WDATA falling-edge timestamps through
    /// the PLL and the mounted handler's `write_track`, in that order,
    /// mirroring `IRQ_wdata_dma` followed by `dma_wr_handle`.
    pub fn wdata_ingest(&mut self, edges: &[u32], bc_ticks: u32) -> CoreResult<bool> {
        let geometry = self.geometry.ok_or(CoreError::MediaAbsent)?;
        let mut bits = Vec::new();
        for &edge in edges {
            self.pll.feed_edge(edge, bc_ticks, &mut bits);
        }
        for bit in bits {
            if !self.bc_write.push(bit) {
                return Err(CoreError::RingOverrun);
            }
        }
        let handler = self.handler.as_mut().ok_or(CoreError::MediaAbsent)?;
        let mut scratch = vec![0u8; geometry.tracklen_bc as usize / 8 + 1];
        Ok(handler.write_track(&mut self.bc_write, &mut scratch))
    }

    /// The lowest-priority cooperative body, `floppy_handle`: services
    /// the write pipeline if a write is in flight, otherwise the read
    /// pipeline. Returns `true` if it made progress.
    pub fn service(&mut self, now: Ticks, rdata_out: &mut [SampleTicks]) -> CoreResult<bool> {
        if self.wdata.state != DmaState::Inactive {
            Ok(!self.writes.is_empty())
        } else {
            let n = self.rdata_refill(now, rdata_out)?;
            Ok(n > 0)
        }
    }

    /// Rough rotational position estimate used by the write-drain and
    /// track-change restart logic; a hosted stand-in for the source's
    /// `time_diff(index.prev_time, time_now()) % stk_per_rev`.
    fn ticks_since_index_estimate(&self) -> u32 {
        let Some(now) = self.index.next_deadline else { return 0 };
        let since = crate::time::time_diff(self.index.prev_time, now).max(0) as u32;
        match self.geometry {
            Some(g) if g.stk_per_rev > 0 => since % g.stk_per_rev,
            _ => since,
        }
    }

    /// Advances the index-pulse phase, called from the coarse tick timer;
    /// returns `true` the tick an INDEX pulse should be asserted. Re-arms
    /// using the mounted image's own `stk_per_rev` (falling back to
    /// [`DEFAULT_REV_TICKS`] before an image declares one); precise
    /// mid-revolution resync happens in [`Self::rdata_refill`] instead.
    pub fn index_tick(&mut self, now: Ticks) -> bool {
        let period = self
            .geometry
            .map(|g| g.stk_per_rev)
            .filter(|&p| p > 0)
            .unwrap_or(DEFAULT_REV_TICKS);
        let Some(deadline) = self.index.next_deadline else {
            self.index.next_deadline = Some(now.wrapping_add(period));
            return false;
        };
        if crate::time::time_diff(deadline, now) < 0 {
            return false;
        }
        self.index.prev_time = deadline;
        self.index.next_deadline = Some(now.wrapping_add(period));
        !self.drive.index_suppressed
    }
}

impl Default for FluxEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ff_floppy::FormatResult;

    #[derive(Debug)]
    struct StubHandler {
        geometry: Geometry,
    }

    impl ImageHandler for StubHandler {
        fn open(&mut self, _data: &[u8]) -> FormatResult<Geometry> {
            Ok(self.geometry)
        }
        fn setup_track(&mut self, _data: &[u8], _track: u16, _restart_bc: Option<u32>) {}
        fn read_track(&mut self, _data: &[u8], bc_ring: &mut BitRing) -> bool {
            while bc_ring.push(false) {}
            true
        }
        fn write_track(&mut self, bc_ring: &mut BitRing, _out: &mut [u8]) -> bool {
            while bc_ring.pop().is_some() {}
            true
        }
        fn rdata_flux(&mut self, _bc_ring: &mut BitRing, _out: &mut [SampleTicks]) -> usize {
            0
        }
    }

    fn stub_geometry() -> Geometry {
        Geometry {
            nr_cyls: 80,
            nr_sides: 2,
            tracklen_bc: 100_000,
            ticks_per_cell_x16: 16 * 16,
            stk_per_rev: 200_000,
        }
    }

    #[test]
    fn mount_resets_pipeline_state() {
        let mut engine = FluxEngine::new();
        engine
            .mount(Box::new(StubHandler { geometry: stub_geometry() }), vec![0u8; 16])
            .unwrap();
        assert!(engine.is_mounted());
        assert_eq!(engine.drive.image_nr_sides, Some(2));
    }

    #[test]
    fn step_edge_stops_rdata_and_starts_stepping() {
        let mut engine = FluxEngine::new();
        engine
            .mount(Box::new(StubHandler { geometry: stub_geometry() }), vec![0u8; 16])
            .unwrap();
        engine.rdata.state = DmaState::Active;
        let mut signals = HostSignals { sel0: true, ..Default::default() };
        engine.input_changed(signals, signals, 0);
        signals.step = true;
        engine.input_changed(HostSignals { sel0: true, ..Default::default() }, signals, 10);
        assert_eq!(engine.drive.step.state, StepState::Started);
        assert_eq!(engine.rdata.state, DmaState::Stopping);
    }

    #[test]
    fn step_debounce_latches_then_settles_then_idles() {
        let mut engine = FluxEngine::new();
        engine.configure(82, 1_000, WriteDrain::Instant, false);
        engine.drive.step_start(true, 0);
        engine.tick_step_debounce(STEP_LATCH_TICKS);
        assert_eq!(engine.drive.step.state, StepState::Settling);
        engine.tick_step_debounce(STEP_LATCH_TICKS + 1_000);
        assert_eq!(engine.drive.step.state, StepState::Idle);
        assert_eq!(engine.drive.cyl, 1);
    }

    #[test]
    fn wgate_glitch_while_active_is_ignored() {
        let mut engine = FluxEngine::new();
        engine
            .mount(Box::new(StubHandler { geometry: stub_geometry() }), vec![0u8; 16])
            .unwrap();
        assert!(engine.wdata_start(0));
        assert!(!engine.wdata_start(1), "second WGATE assert while active must be a no-op");
    }

    #[test]
    fn write_drain_eot_positions_near_end_of_revolution() {
        let mut engine = FluxEngine::new();
        engine.configure(82, 1_000, WriteDrain::Eot, false);
        engine
            .mount(Box::new(StubHandler { geometry: stub_geometry() }), vec![0u8; 16])
            .unwrap();
        engine.wdata_start(0);
        engine.wdata_stop();
        assert_eq!(engine.drive.restart_pos, 200_000 - WRITE_DRAIN_EOT_MARGIN);
        assert!(engine.drive.index_suppressed);
    }

    #[test]
    fn rdata_refill_without_mount_reports_media_absent() {
        let mut engine = FluxEngine::new();
        let mut out = [0u32; 4];
        assert_eq!(engine.rdata_refill(0, &mut out), Err(CoreError::MediaAbsent));
    }

    /// Pushes exactly one revolution's worth of 1-bits per `read_track`
    /// call, so each `rdata_refill` call wraps the accumulator exactly once.
    #[derive(Debug)]
    struct RevolutionHandler {
        geometry: Geometry,
    }

    impl ImageHandler for RevolutionHandler {
        fn open(&mut self, _data: &[u8]) -> FormatResult<Geometry> {
            Ok(self.geometry)
        }
        fn setup_track(&mut self, _data: &[u8], _track: u16, _restart_bc: Option<u32>) {}
        fn read_track(&mut self, _data: &[u8], bc_ring: &mut BitRing) -> bool {
            for _ in 0..self.geometry.tracklen_bc {
                if !bc_ring.push(true) {
                    break;
                }
            }
            true
        }
        fn write_track(&mut self, bc_ring: &mut BitRing, _out: &mut [u8]) -> bool {
            while bc_ring.pop().is_some() {}
            true
        }
        fn rdata_flux(&mut self, _bc_ring: &mut BitRing, _out: &mut [SampleTicks]) -> usize {
            0
        }
    }

    #[test]
    fn index_resync_tracks_stk_per_rev_over_many_revolutions() {
        // Deliberately not 200_000, so a hardcoded re-arm period would
        // immediately drift out of phase (testable property 7).
        let geometry = Geometry {
            nr_cyls: 80,
            nr_sides: 2,
            tracklen_bc: 16,
            ticks_per_cell_x16: 64, // 4 ticks/cell, divides evenly
            stk_per_rev: 64,
        };
        let mut engine = FluxEngine::new();
        engine
            .mount(Box::new(RevolutionHandler { geometry }), vec![0u8; 16])
            .unwrap();

        let mut out = [0u32; 16];
        let mut prev_edge: Option<Ticks> = None;
        let mut now: Ticks = 0;
        let mut edges_observed = 0;
        for _ in 0..100 {
            if engine.index_tick(now) {
                if let Some(prev) = prev_edge {
                    let delta = crate::time::time_diff(prev, now);
                    assert!(
                        (delta - geometry.stk_per_rev as i32).abs() <= 1,
                        "index edge spacing {delta} drifted from stk_per_rev {}",
                        geometry.stk_per_rev
                    );
                }
                prev_edge = Some(now);
                edges_observed += 1;
            }
            engine.rdata_refill(now, &mut out).unwrap();
            now = now.wrapping_add(geometry.stk_per_rev);
        }
        assert!(edges_observed > 50, "expected roughly one index edge per revolution");
    }
}
