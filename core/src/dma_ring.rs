//! DMA ring buffers to/from the RDATA/WDATA hardware timers
//! (`original_source/src/floppy_generic.c`'s `struct dma_ring`) and the
//! write-record queue the write-back pipeline drains
//! (`spec.md` §3's "Write record").
//!
//! The original buffer is filled by a literal DMA engine and consumed by
//! an ISR; here both producer and consumer are plain method calls, with
//! the caller (`flux_engine`) responsible for driving them at the right
//! points, matching the cooperative-scheduling translation documented in
//! `SPEC_FULL.md` §5.

pub const RING_LEN: usize = 1024;

/// `DMA_inactive -> {starting, active}`, `DMA_starting -> {active,
/// stopping}`, `DMA_active -> {stopping}`, `DMA_stopping -> {inactive}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DmaState {
    #[default]
    Inactive,
    Starting,
    Active,
    Stopping,
}

/// A power-of-two ring of raw timer reload/capture values, shared shape
/// between the RDATA (read-flux) and WDATA (write-flux) directions; which
/// one it is only matters for how the caller interprets `buf`.
#[derive(Debug)]
pub struct DmaRing {
    pub state: DmaState,
    /// Set when the read side ran dry and needs a refill kick, mirroring
    /// the source's `kick_dma_irq`.
    pub kick: bool,
    pub cons: u16,
    pub prod: u16,
    pub buf: Vec<u16>,
}

impl DmaRing {
    pub fn new() -> Self {
        Self {
            state: DmaState::Inactive,
            kick: false,
            cons: 0,
            prod: 0,
            buf: vec![0u16; RING_LEN],
        }
    }

    fn mask(&self) -> u16 {
        (self.buf.len() as u16).wrapping_sub(1)
    }

    /// Contiguous room available to the producer before it must wrap,
    /// bounded so it never catches up with `cons`.
    pub fn space_to_wrap(&self) -> u16 {
        (self.buf.len() as u16).wrapping_sub(self.prod)
    }

    pub fn space_to_cons(&self) -> u16 {
        self.cons.wrapping_sub(self.prod).wrapping_sub(1) & self.mask()
    }

    pub fn filled(&self) -> u16 {
        self.prod.wrapping_sub(self.cons) & self.mask()
    }

    pub fn is_full(&self) -> bool {
        self.space_to_cons() == 0
    }

    /// Starts this ring (`DMA_inactive`/`DMA_stopping` -> `starting`),
    /// clearing indices. Returns `false` if a write pipeline would
    /// overflow (`Starting`/`Active` already, i.e. a WGATE glitch).
    pub fn start(&mut self) -> bool {
        if matches!(self.state, DmaState::Starting | DmaState::Active) {
            return false;
        }
        self.state = DmaState::Starting;
        self.cons = 0;
        self.prod = 0;
        self.kick = false;
        true
    }

    pub fn activate(&mut self) {
        if self.state == DmaState::Starting {
            self.state = DmaState::Active;
        }
    }

    /// Moves to `stopping`; returns the previous state so the caller can
    /// skip redundant teardown work (`wdata_stop`'s early-return for
    /// `inactive`/`stopping`).
    pub fn stop(&mut self) -> DmaState {
        let prev = self.state;
        if !matches!(prev, DmaState::Inactive | DmaState::Stopping) {
            self.state = DmaState::Stopping;
        }
        prev
    }

    pub fn quiesce(&mut self) {
        self.state = DmaState::Inactive;
        self.cons = 0;
        self.prod = 0;
    }
}

impl Default for DmaRing {
    fn default() -> Self {
        Self::new()
    }
}

/// One sector-range write currently being ingested or drained
/// (`spec.md` §3's "Write record"). A small circular queue of these
/// lives alongside the mounted image.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteRecord {
    pub start_sample_time: u32,
    pub track: u16,
    pub dma_end: u16,
    pub bc_end: u32,
}

/// Fixed-capacity circular queue of in-flight write records, consumed in
/// order by the image handler's `write_track`.
#[derive(Debug)]
pub struct WriteQueue<const N: usize> {
    records: [WriteRecord; N],
    prod: u32,
    cons: u32,
}

impl<const N: usize> WriteQueue<N> {
    pub fn new() -> Self {
        Self {
            records: [WriteRecord::default(); N],
            prod: 0,
            cons: 0,
        }
    }

    pub fn is_full(&self) -> bool {
        self.prod.wrapping_sub(self.cons) as usize >= N
    }

    pub fn is_empty(&self) -> bool {
        self.prod == self.cons
    }

    /// Reserves the next slot for the write currently being ingested,
    /// returning its index so the caller can finish filling it in
    /// (`get_write(image, image->wr_prod)` in the source) before calling
    /// [`Self::push`].
    pub fn next_slot(&mut self) -> &mut WriteRecord {
        let idx = (self.prod as usize) % N;
        &mut self.records[idx]
    }

    /// Commits the slot [`Self::next_slot`] filled in.
    pub fn push(&mut self) {
        self.prod = self.prod.wrapping_add(1);
    }

    pub fn pop(&mut self) -> Option<WriteRecord> {
        if self.is_empty() {
            return None;
        }
        let idx = (self.cons as usize) % N;
        self.cons = self.cons.wrapping_add(1);
        Some(self.records[idx])
    }
}

impl<const N: usize> Default for WriteQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_rejects_already_active_ring() {
        let mut ring = DmaRing::new();
        assert!(ring.start());
        ring.activate();
        assert!(!ring.start(), "WGATE glitch while already active must be rejected");
    }

    #[test]
    fn stop_from_inactive_is_a_noop_and_reports_prior_state() {
        let mut ring = DmaRing::new();
        assert_eq!(ring.stop(), DmaState::Inactive);
        assert_eq!(ring.state, DmaState::Inactive);
    }

    #[test]
    fn full_lifecycle_returns_to_inactive() {
        let mut ring = DmaRing::new();
        assert!(ring.start());
        ring.activate();
        assert_eq!(ring.state, DmaState::Active);
        ring.stop();
        assert_eq!(ring.state, DmaState::Stopping);
        ring.quiesce();
        assert_eq!(ring.state, DmaState::Inactive);
    }

    #[test]
    fn write_queue_is_fifo_and_reports_full() {
        let mut q: WriteQueue<2> = WriteQueue::new();
        q.next_slot().track = 1;
        q.push();
        q.next_slot().track = 2;
        q.push();
        assert!(q.is_full());
        assert_eq!(q.pop().unwrap().track, 1);
        assert!(!q.is_full());
        assert_eq!(q.pop().unwrap().track, 2);
        assert!(q.pop().is_none());
    }
}
