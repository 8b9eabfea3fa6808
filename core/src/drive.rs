//! Per-drive head/motor/step state, grounded in
//! `original_source/src/floppy_generic.c`'s `static struct drive drive`
//! and `original_source/inc/floppy.h`'s `struct drive`, expressed with the
//! typed-state-enum idiom `examples/twvd-snow/core/src/mac/swim/drive.rs`
//! uses for its own drive model (`num-derive`/`strum` on small C-style
//! enums rather than raw integer state).

use num_derive::{FromPrimitive, ToPrimitive};
use strum::Display;

use crate::time::Ticks;

/// Bits of the source's `step.state`: `STEP_started` is set by the
/// high-priority step-edge interrupt, `STEP_latched` by the low-priority
/// handler that actually moves the head; `Active` is both set at once,
/// and `Settling` replaces both once the head-settle timer is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromPrimitive, ToPrimitive)]
pub enum StepState {
    Idle = 0,
    Started = 1,
    Latched = 2,
    Active = 3,
    Settling = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepMotion {
    pub state: StepState,
    pub inward: bool,
    pub start: Ticks,
}

impl Default for StepState {
    fn default() -> Self {
        StepState::Idle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Motor {
    pub on: bool,
    pub changed: bool,
}

/// One physical drive slot. Head position and selection are tracked even
/// with no image mounted, matching the source's "statically-allocated...
/// tracks head movements... even when the drive is empty" comment.
#[derive(Debug, Clone, Default)]
pub struct Drive {
    pub cyl: u8,
    pub head: u8,
    pub sel: bool,
    pub writing: bool,
    /// Disables the synthesized INDEX pulse while a deferred write is
    /// being drained to mass storage (`WDRAIN_eot`'s restart-position
    /// trick; see `SPEC_FULL.md`'s Open Question decision).
    pub index_suppressed: bool,
    pub inserted: bool,
    pub motor: Motor,
    pub step: StepMotion,
    /// Flux-ring offset the read pipeline should resume from after a
    /// deferred-write restart, in source ticks since the last index.
    pub restart_pos: u32,
    /// `None` when no image is mounted.
    pub image_nr_sides: Option<u8>,
}

impl Drive {
    pub fn new() -> Self {
        Self::default()
    }

    /// The 0-based track index into a per-side image layout:
    /// `cyl * nr_sides + (head & (nr_sides - 1))`, taken verbatim from
    /// `drive_->cyl*2 + (drv->head & (drv->image->nr_sides - 1))`; the
    /// mask handles single-sided images where `head` must fold to 0.
    pub fn track_index(&self) -> Option<u32> {
        let sides = self.image_nr_sides?;
        Some(self.cyl as u32 * sides as u32 + (self.head as u32 & (sides as u32 - 1)))
    }

    /// Begins a step pulse; called from the high-priority edge handler.
    pub fn step_start(&mut self, inward: bool, now: Ticks) {
        if self.step.state == StepState::Idle {
            self.step.inward = inward;
            self.step.start = now;
            self.step.state = StepState::Started;
        }
    }

    /// Latches a started step, moving the head. Called from the
    /// low-priority handler once the step pulse has been observed.
    pub fn step_latch(&mut self, max_cyl: u8) {
        if self.step.state != StepState::Started {
            return;
        }
        if self.step.inward {
            if self.cyl < max_cyl {
                self.cyl += 1;
            }
        } else if self.cyl > 0 {
            self.cyl -= 1;
        }
        self.step.state = StepState::Active;
    }

    /// Moves the step state machine into settling, started by the
    /// head-settle timer once a step has latched.
    pub fn step_settle(&mut self) {
        if self.step.state == StepState::Active {
            self.step.state = StepState::Settling;
        }
    }

    /// Clears settling once the head-settle timer fires.
    pub fn step_finish(&mut self) {
        if self.step.state == StepState::Settling {
            self.step.state = StepState::Idle;
        }
    }

    pub fn is_track0(&self) -> bool {
        self.cyl == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_inward_and_outward_clamp_at_rails() {
        let mut d = Drive::new();
        d.step_start(false, 0);
        d.step_latch(82);
        assert_eq!(d.cyl, 0); // clamped at track 0
        d.step.state = StepState::Idle;
        d.step_start(true, 0);
        d.step_latch(82);
        assert_eq!(d.cyl, 1);
    }

    #[test]
    fn step_does_not_start_while_already_active() {
        let mut d = Drive::new();
        d.step_start(true, 10);
        d.step_start(false, 20);
        assert_eq!(d.step.start, 10);
        assert!(d.step.inward);
    }

    #[test]
    fn track_index_folds_head_for_single_sided_image() {
        let mut d = Drive::new();
        d.image_nr_sides = Some(1);
        d.cyl = 5;
        d.head = 1;
        assert_eq!(d.track_index(), Some(5));
    }

    #[test]
    fn track_index_none_without_image() {
        let d = Drive::new();
        assert_eq!(d.track_index(), None);
    }

    #[test]
    fn settle_lifecycle_returns_to_idle() {
        let mut d = Drive::new();
        d.step_start(true, 0);
        d.step_latch(82);
        d.step_settle();
        assert_eq!(d.step.state, StepState::Settling);
        d.step_finish();
        assert_eq!(d.step.state, StepState::Idle);
    }
}
