//! Persistent configuration record (`inc/config.h`'s `struct ff_cfg`):
//! a versioned, fixed-layout record with a `version`/`size` header used
//! for forward compatibility exactly as the source does it: a newer
//! build reading an older, shorter blob defaults the fields it doesn't
//! find; an older build reading a newer, longer blob doesn't understand
//! the trailing bytes but keeps them verbatim so a later read-modify-write
//! by the newer build doesn't lose them.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

/// Bump for every incompatible change to field *meaning* or ordering.
/// Fields appended at the tail don't need a bump.
pub const CONFIG_VERSION: u8 = 2;

macro_rules! byte_enum {
    ($(#[$meta:meta])* $vis:vis enum $name:ident { $($variant:ident = $val:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter,
            Serialize, Deserialize, FromPrimitive, ToPrimitive,
        )]
        $vis enum $name {
            $($variant = $val),+
        }
    };
}

byte_enum! {
    pub enum Interface {
        Shugart = 0,
        IbmPc = 1,
        IbmPcHdOut = 2,
        JpPc = 3,
        JpPcHdOut = 4,
        Amiga = 5,
    }
}

byte_enum! {
    pub enum Host {
        Unspecified = 0,
        Akai = 1,
        Gem = 2,
        Ensoniq = 3,
        Acorn = 4,
        Ti99 = 5,
        Pc98 = 6,
    }
}

byte_enum! {
    /// Reconfigurable pin 2 / pin 34 function.
    pub enum PinFunction {
        Auto = 0,
        High = 1,
        Low = 2,
        Ready = 3,
        DensitySelect = 4,
        DiskChange = 5,
    }
}

byte_enum! {
    pub enum TrackChange {
        Instant = 0,
        Realtime = 1,
    }
}

byte_enum! {
    pub enum WriteDrain {
        Instant = 0,
        Realtime = 1,
        Eot = 2,
    }
}

byte_enum! {
    pub enum TwoButtonAction {
        Zero = 0,
        Eject = 1,
        Rotary = 2,
        RotaryFast = 3,
        HoldToUnmount = 4,
    }
}

/// A pin's function plus its polarity-invert flag, packed as two bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinConfig {
    pub function: PinFunction,
    pub inverted: bool,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            function: PinFunction::Auto,
            inverted: false,
        }
    }
}

/// The persistent configuration record. `display_*`/`nav_*`/`oled_*`/
/// `rotary`/`twobutton_action`/`indexed_prefix` are opaque to the core: it
/// stores and round-trips them for the UI layer without interpreting them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub interface: Interface,
    pub host: Host,
    pub pin02: PinConfig,
    pub pin34: PinConfig,
    pub write_protect: bool,
    pub max_cyl: u8,
    pub side_select_glitch_filter: u8,
    pub track_change: TrackChange,
    pub write_drain: WriteDrain,
    pub index_suppression: bool,
    pub head_settle_ms: u16,
    pub motor_delay: u16,
    pub chgrst: bool,

    pub display_off_secs: u8,
    pub display_on_activity: u8,
    pub display_scroll_rate: u16,
    pub display_probe_ms: u16,

    pub nav_loop: bool,
    pub nav_mode: u8,

    pub twobutton_action: TwoButtonAction,
    pub rotary: u8,
    pub indexed_prefix: bool,

    pub oled_font: u8,

    pub step_volume: u8,
    pub extend_image: bool,
    pub da_report_version: [u8; Self::DA_VERSION_LEN],
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: Interface::Shugart,
            host: Host::Unspecified,
            pin02: PinConfig::default(),
            pin34: PinConfig::default(),
            write_protect: false,
            max_cyl: 83,
            side_select_glitch_filter: 0,
            track_change: TrackChange::Instant,
            write_drain: WriteDrain::Instant,
            index_suppression: false,
            head_settle_ms: 12,
            motor_delay: 0,
            chgrst: false,
            display_off_secs: 0,
            display_on_activity: 0,
            display_scroll_rate: 0,
            display_probe_ms: 0,
            nav_loop: false,
            nav_mode: 0,
            twobutton_action: TwoButtonAction::Eject,
            rotary: 0,
            indexed_prefix: false,
            oled_font: 0,
            step_volume: 0,
            extend_image: false,
            da_report_version: [0; Self::DA_VERSION_LEN],
        }
    }
}

/// Field order for the fixed-width on-disk layout. Appending a field here
/// is backward compatible (old blobs simply end before it, and it takes
/// its default); reordering or resizing an existing field is not, and
/// must bump [`CONFIG_VERSION`].
impl Config {
    const DA_VERSION_LEN: usize = 16;
    /// Size of the payload this build knows how to interpret, not
    /// counting the two-byte `version`/`size` header.
    const KNOWN_SIZE: usize = 2 // interface, host
        + 2 // pin02
        + 2 // pin34
        + 1 // write_protect
        + 1 // max_cyl
        + 1 // side_select_glitch_filter
        + 1 // track_change
        + 1 // write_drain
        + 1 // index_suppression
        + 2 // head_settle_ms
        + 2 // motor_delay
        + 1 // chgrst
        + 1 // display_off_secs
        + 1 // display_on_activity
        + 2 // display_scroll_rate
        + 2 // display_probe_ms
        + 1 // nav_loop
        + 1 // nav_mode
        + 1 // twobutton_action
        + 1 // rotary
        + 1 // indexed_prefix
        + 1 // oled_font
        + 1 // step_volume
        + 1 // extend_image
        + Self::DA_VERSION_LEN;

    /// Serialises to the fixed-width on-disk layout: `[version, size,
    /// ...fields..., tail]`, where `tail` is whatever bytes beyond
    /// `KNOWN_SIZE` were present when this record was loaded (empty for a
    /// record built fresh via `Config::default()`).
    pub fn to_bytes(&self, tail: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + Self::KNOWN_SIZE + tail.len());
        buf.push(CONFIG_VERSION);
        buf.push(Self::KNOWN_SIZE as u8);
        buf.push(self.interface.to_u8().expect("Interface fits in u8"));
        buf.push(self.host.to_u8().expect("Host fits in u8"));
        buf.push(self.pin02.function.to_u8().expect("PinFunction fits in u8"));
        buf.push(self.pin02.inverted as u8);
        buf.push(self.pin34.function.to_u8().expect("PinFunction fits in u8"));
        buf.push(self.pin34.inverted as u8);
        buf.push(self.write_protect as u8);
        buf.push(self.max_cyl);
        buf.push(self.side_select_glitch_filter);
        buf.push(self.track_change.to_u8().expect("TrackChange fits in u8"));
        buf.push(self.write_drain.to_u8().expect("WriteDrain fits in u8"));
        buf.push(self.index_suppression as u8);
        buf.extend_from_slice(&self.head_settle_ms.to_le_bytes());
        buf.extend_from_slice(&self.motor_delay.to_le_bytes());
        buf.push(self.chgrst as u8);
        buf.push(self.display_off_secs);
        buf.push(self.display_on_activity);
        buf.extend_from_slice(&self.display_scroll_rate.to_le_bytes());
        buf.extend_from_slice(&self.display_probe_ms.to_le_bytes());
        buf.push(self.nav_loop as u8);
        buf.push(self.nav_mode);
        buf.push(
            self.twobutton_action
                .to_u8()
                .expect("TwoButtonAction fits in u8"),
        );
        buf.push(self.rotary);
        buf.push(self.indexed_prefix as u8);
        buf.push(self.oled_font);
        buf.push(self.step_volume);
        buf.push(self.extend_image as u8);
        buf.extend_from_slice(&self.da_report_version);
        debug_assert_eq!(buf.len(), 2 + Self::KNOWN_SIZE);
        buf.extend_from_slice(tail);
        buf
    }

    /// Parses a possibly older-or-newer blob. Fields this build doesn't
    /// find (old, shorter blob) take their default; bytes past this
    /// build's known layout (newer blob, written by a future version) are
    /// returned as `tail` so a caller round-tripping the record through
    /// `to_bytes` doesn't truncate a field it doesn't understand.
    pub fn merge_forward_compatible(bytes: &[u8]) -> (Self, Vec<u8>) {
        if bytes.len() < 2 {
            return (Self::default(), Vec::new());
        }
        let declared_size = bytes[1] as usize;
        let payload = &bytes[2..];
        let known_len = declared_size.min(payload.len()).min(Self::KNOWN_SIZE);
        let mut cfg = Self::default();
        let mut r = Reader(&payload[..known_len]);

        if let Some(v) = r.u8().and_then(Interface::from_u8) {
            cfg.interface = v;
        }
        if let Some(v) = r.u8().and_then(Host::from_u8) {
            cfg.host = v;
        }
        if let Some(v) = r.u8().and_then(PinFunction::from_u8) {
            cfg.pin02.function = v;
        }
        if let Some(v) = r.u8() {
            cfg.pin02.inverted = v != 0;
        }
        if let Some(v) = r.u8().and_then(PinFunction::from_u8) {
            cfg.pin34.function = v;
        }
        if let Some(v) = r.u8() {
            cfg.pin34.inverted = v != 0;
        }
        if let Some(v) = r.u8() {
            cfg.write_protect = v != 0;
        }
        if let Some(v) = r.u8() {
            cfg.max_cyl = v;
        }
        if let Some(v) = r.u8() {
            cfg.side_select_glitch_filter = v;
        }
        if let Some(v) = r.u8().and_then(TrackChange::from_u8) {
            cfg.track_change = v;
        }
        if let Some(v) = r.u8().and_then(WriteDrain::from_u8) {
            cfg.write_drain = v;
        }
        if let Some(v) = r.u8() {
            cfg.index_suppression = v != 0;
        }
        if let Some(v) = r.u16() {
            cfg.head_settle_ms = v;
        }
        if let Some(v) = r.u16() {
            cfg.motor_delay = v;
        }
        if let Some(v) = r.u8() {
            cfg.chgrst = v != 0;
        }
        if let Some(v) = r.u8() {
            cfg.display_off_secs = v;
        }
        if let Some(v) = r.u8() {
            cfg.display_on_activity = v;
        }
        if let Some(v) = r.u16() {
            cfg.display_scroll_rate = v;
        }
        if let Some(v) = r.u16() {
            cfg.display_probe_ms = v;
        }
        if let Some(v) = r.u8() {
            cfg.nav_loop = v != 0;
        }
        if let Some(v) = r.u8() {
            cfg.nav_mode = v;
        }
        if let Some(v) = r.u8().and_then(TwoButtonAction::from_u8) {
            cfg.twobutton_action = v;
        }
        if let Some(v) = r.u8() {
            cfg.rotary = v;
        }
        if let Some(v) = r.u8() {
            cfg.indexed_prefix = v != 0;
        }
        if let Some(v) = r.u8() {
            cfg.oled_font = v;
        }
        if let Some(v) = r.u8() {
            cfg.step_volume = v;
        }
        if let Some(v) = r.u8() {
            cfg.extend_image = v != 0;
        }
        if let Some(v) = r.bytes(Self::DA_VERSION_LEN) {
            cfg.da_report_version.copy_from_slice(v);
        }

        let tail = if payload.len() > Self::KNOWN_SIZE {
            payload[Self::KNOWN_SIZE..].to_vec()
        } else {
            Vec::new()
        };
        (cfg, tail)
    }
}

struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.0.len() < n {
            return None;
        }
        let (head, rest) = self.0.split_at(n);
        self.0 = rest;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.bytes(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.bytes(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let mut cfg = Config::default();
        cfg.max_cyl = 82;
        cfg.write_drain = WriteDrain::Eot;
        let bytes = cfg.to_bytes(&[]);
        let (back, tail) = Config::merge_forward_compatible(&bytes);
        assert_eq!(back.max_cyl, 82);
        assert_eq!(back.write_drain, WriteDrain::Eot);
        assert!(tail.is_empty());
    }

    #[test]
    fn short_older_blob_defaults_missing_tail_fields() {
        let full = Config::default().to_bytes(&[]);
        // Truncate to just past `max_cyl`, simulating an older, shorter
        // record written before later fields existed.
        let short = &full[..2 + 10];
        let (cfg, tail) = Config::merge_forward_compatible(short);
        assert_eq!(cfg.max_cyl, 83);
        assert_eq!(cfg.write_drain, WriteDrain::Instant);
        assert!(tail.is_empty());
    }

    #[test]
    fn unknown_trailing_bytes_survive_a_round_trip() {
        let mut bytes = Config::default().to_bytes(&[]);
        bytes.push(0xaa);
        bytes.push(0xbb);
        let (cfg, tail) = Config::merge_forward_compatible(&bytes);
        assert_eq!(tail, vec![0xaa, 0xbb]);
        let rewritten = cfg.to_bytes(&tail);
        assert_eq!(&rewritten[rewritten.len() - 2..], &[0xaa, 0xbb]);
    }
}
