//! Wire-level signal model for the 34-pin Shugart interface and its
//! variants, grounded in `original_source/src/floppy.c`'s
//! `input_update_default`/`input_update_tb160`/`floppy_init` pin tables.
//! The original reads these straight off GPIO registers; this crate is
//! hosted library code, so a caller owns the actual pin hardware and
//! hands the core a snapshot (`HostSignals`) each poll, receiving back
//! the core's desired output levels (`HostOutputs`).

use crate::config::Interface;

/// Input pin states sampled from the host at a point in time. Field names
/// follow the source's `inp_*` bit offsets rather than the STM32 GPIO
/// layout they were packed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostSignals {
    pub dir: bool,
    pub step: bool,
    pub sel0: bool,
    pub sel1: bool,
    pub wgate: bool,
    pub side: bool,
    pub motor: bool,
    pub reset: bool,
}

impl HostSignals {
    /// True for the drive this side of the interface addresses, given the
    /// two select lines. Shugart wiring treats `sel0`/`sel1` as a one-hot
    /// drive select; anything else (both or neither asserted) selects
    /// neither drive, matching the source leaving `cur_drive` unchanged
    /// in that case.
    pub fn selected_drive(&self) -> Option<usize> {
        match (self.sel0, self.sel1) {
            (true, false) => Some(0),
            (false, true) => Some(1),
            _ => None,
        }
    }
}

/// Output pin states the core wants driven onto the interface. Active-low
/// signals (`/INDEX`, `/TRK0`, `/WRPROT`, `/DSKCHG`, `/RDY`) are named
/// without the slash but modelled as "asserted" booleans; a caller
/// mapping this onto real open-drain outputs inverts as needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostOutputs {
    pub index: bool,
    pub trk0: bool,
    pub wrprot: bool,
    pub dskchg: bool,
    pub rdy: bool,
    pub hdout: bool,
}

/// A pin whose function can be remapped via configuration (pin 2 and pin
/// 34 on the 34-pin header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemappablePin {
    /// Follow the interface's default wiring for this pin.
    Auto,
    High,
    Low,
    Ready,
    DensitySelect,
    DiskChange,
}

impl RemappablePin {
    /// Resolves a remappable pin's level given the outputs it would
    /// otherwise carry and the currently-fitted density (true = high
    /// density). `inverted` applies after resolution, matching the
    /// source's separate invert flag per pin. `Auto` has no fixed meaning
    /// of its own (the caller substitutes the interface's wired-in
    /// default for this pin), so it resolves to `None`.
    pub fn resolve(self, outputs: &HostOutputs, high_density: bool, inverted: bool) -> Option<bool> {
        let level = match self {
            RemappablePin::Auto => return None,
            RemappablePin::High => true,
            RemappablePin::Low => false,
            RemappablePin::Ready => outputs.rdy,
            RemappablePin::DensitySelect => high_density,
            RemappablePin::DiskChange => outputs.dskchg,
        };
        Some(level ^ inverted)
    }
}

/// Per-`Interface` input pin layout, used only to document which physical
/// signals map onto `HostSignals`' fields for a given wiring; the core
/// itself is wiring-agnostic once a `HostSignals` snapshot is in hand.
pub fn describes_head_select(interface: Interface) -> bool {
    matches!(
        interface,
        Interface::IbmPcHdOut | Interface::JpPcHdOut | Interface::Amiga
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selected_drive_is_one_hot() {
        let mut s = HostSignals::default();
        assert_eq!(s.selected_drive(), None);
        s.sel0 = true;
        assert_eq!(s.selected_drive(), Some(0));
        s.sel1 = true;
        assert_eq!(s.selected_drive(), None);
        s.sel0 = false;
        assert_eq!(s.selected_drive(), Some(1));
    }

    #[test]
    fn remappable_pin_resolves_and_inverts() {
        let outputs = HostOutputs {
            rdy: true,
            dskchg: false,
            ..Default::default()
        };
        assert_eq!(RemappablePin::Ready.resolve(&outputs, false, false), Some(true));
        assert_eq!(RemappablePin::Ready.resolve(&outputs, false, true), Some(false));
        assert_eq!(RemappablePin::High.resolve(&outputs, false, false), Some(true));
        assert_eq!(RemappablePin::DiskChange.resolve(&outputs, false, false), Some(false));
        assert_eq!(RemappablePin::Auto.resolve(&outputs, false, false), None);
    }

    #[test]
    fn hdout_interfaces_are_identified() {
        assert!(describes_head_select(Interface::Amiga));
        assert!(!describes_head_select(Interface::Shugart));
    }
}
