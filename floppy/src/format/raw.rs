//! Raw sector images (IMG/ST and the family of host-specific sector images
//! that share the same IBM-style IDAM/DAM framing), grounded in
//! `original_source/src/image/img.c`.

use strum::{Display, EnumIter};

use crate::bitcell::BitRing;
use crate::flux::{FM_TICKS_PER_CELL_X16, MFM_DD_TICKS_PER_CELL_X16, MFM_HD_TICKS_PER_CELL_X16};
use crate::mfm::{crc16_ccitt, fm_encode_byte, mfm_decode_byte, mfm_encode_byte, MFM_SYNC};
use crate::{BitcellCount, FormatError, FormatResult, Geometry, ImageHandler};

/// Host layouts recognised by file-size matching, per `img.c`'s geometry
/// table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
pub enum Host {
    PcDd720,
    PcHd1440,
    AcornAdfsD800,
    AcornAdfsE1600,
    Trd,
    AcornSsd,
    AcornDsd,
    Ti99Sssd,
}

#[derive(Debug, Clone, Copy)]
pub struct HostGeometry {
    pub host: Host,
    pub nr_sec: u8,
    pub nr_sides: u8,
    pub gap3: u8,
    pub sec_sz: u16,
    pub interleave: u8,
    pub skew: u8,
    pub base_sec_nr: u8,
    pub cyls: u16,
    pub no_iam: bool,
    pub fm: bool,
}

impl HostGeometry {
    fn image_size(&self) -> u64 {
        u64::from(self.cyls) * u64::from(self.nr_sides) * u64::from(self.nr_sec) * u64::from(self.sec_sz)
    }
}

pub const GEOMETRY_TABLE: &[HostGeometry] = &[
    HostGeometry {
        host: Host::PcDd720,
        nr_sec: 9,
        nr_sides: 2,
        gap3: 84,
        sec_sz: 512,
        interleave: 1,
        skew: 0,
        base_sec_nr: 1,
        cyls: 80,
        no_iam: false,
        fm: false,
    },
    HostGeometry {
        host: Host::PcHd1440,
        nr_sec: 18,
        nr_sides: 2,
        gap3: 108,
        sec_sz: 512,
        interleave: 1,
        skew: 0,
        base_sec_nr: 1,
        cyls: 80,
        no_iam: false,
        fm: false,
    },
    HostGeometry {
        host: Host::AcornAdfsD800,
        nr_sec: 5,
        nr_sides: 2,
        gap3: 116,
        sec_sz: 1024,
        interleave: 1,
        skew: 0,
        base_sec_nr: 0,
        cyls: 80,
        no_iam: false,
        fm: false,
    },
    HostGeometry {
        host: Host::AcornAdfsE1600,
        nr_sec: 10,
        nr_sides: 2,
        gap3: 116,
        sec_sz: 1024,
        interleave: 1,
        skew: 0,
        base_sec_nr: 0,
        cyls: 80,
        no_iam: false,
        fm: false,
    },
    HostGeometry {
        host: Host::Trd,
        nr_sec: 16,
        nr_sides: 2,
        gap3: 57,
        sec_sz: 256,
        interleave: 1,
        skew: 0,
        base_sec_nr: 1,
        cyls: 80,
        no_iam: false,
        fm: false,
    },
    HostGeometry {
        host: Host::AcornSsd,
        nr_sec: 10,
        nr_sides: 1,
        gap3: 39,
        sec_sz: 256,
        interleave: 1,
        skew: 0,
        base_sec_nr: 0,
        cyls: 80,
        no_iam: true,
        fm: true,
    },
    HostGeometry {
        host: Host::AcornDsd,
        nr_sec: 10,
        nr_sides: 2,
        gap3: 39,
        sec_sz: 256,
        interleave: 1,
        skew: 0,
        base_sec_nr: 0,
        cyls: 80,
        no_iam: true,
        fm: true,
    },
    HostGeometry {
        host: Host::Ti99Sssd,
        nr_sec: 9,
        nr_sides: 1,
        gap3: 27,
        sec_sz: 256,
        interleave: 1,
        skew: 0,
        base_sec_nr: 1,
        cyls: 40,
        no_iam: true,
        fm: true,
    },
];

/// Matches an image's byte size against [`GEOMETRY_TABLE`]. TRD images are
/// additionally distinguished from Acorn DSD by the geometry byte at
/// `0x8E3` when present, per `spec.md` §6.
pub fn identify(data: &[u8]) -> Option<&'static HostGeometry> {
    let size = data.len() as u64;
    if data.len() > 0x8e3 && matches!(data[0x8e3], 0x16..=0x19) {
        if let Some(g) = GEOMETRY_TABLE.iter().find(|g| g.host == Host::Trd) {
            if g.image_size() == size {
                return Some(g);
            }
        }
    }
    GEOMETRY_TABLE.iter().find(|g| g.image_size() == size && g.host != Host::Trd)
}

/// Rotational (physical) order of logical sector numbers for `track_idx`,
/// applying interleave within the track and a skew that rotates the mapping
/// by `skew * track_idx` sectors, `img_seek_track`'s algorithm.
pub fn rotational_order(geom: &HostGeometry, track_idx: u16) -> Vec<u8> {
    let n = u32::from(geom.nr_sec);
    if n == 0 {
        return Vec::new();
    }
    let shift = (u32::from(geom.skew) * u32::from(track_idx)) % n;
    (0..n)
        .map(|p| {
            let logical = (p * u32::from(geom.interleave)) % n;
            let rotated = (logical + shift) % n;
            geom.base_sec_nr.wrapping_add(rotated as u8)
        })
        .collect()
}

const SYNC_LEN_MFM: usize = 12;
const SYNC_LEN_FM: usize = 6;
const GAP2_LEN_MFM: usize = 22;
const GAP2_LEN_FM: usize = 11;
const IAM_PREGAP_MFM: usize = 50;
const IAM_PREGAP_FM: usize = 26;

const IDAM_MARK: u8 = 0xfe;
const DAM_MARK: u8 = 0xfb;
const IAM_MARK: u8 = 0xfc;

#[derive(Debug, Default)]
pub struct RawHandler {
    geom: Option<HostGeometry>,
    cur_track: u16,
    track_bits: Vec<bool>,
    read_cursor: usize,
    write_decode: WriteDecoder,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    #[default]
    SeekSync,
    Mark,
    Chrn,
    DamData,
}

#[derive(Debug, Default)]
struct WriteDecoder {
    state: DecodeState,
    shift: u32,
    nbits: u32,
    field: Vec<u8>,
    want: usize,
    chrn: Option<[u8; 4]>,
}

impl WriteDecoder {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

fn push_byte_mfm(bits: &mut Vec<bool>, byte: u8, prev_bit: &mut bool) {
    let (cells, last) = mfm_encode_byte(byte, *prev_bit);
    bits.extend_from_slice(&cells);
    *prev_bit = last;
}

fn push_byte_fm(bits: &mut Vec<bool>, byte: u8) {
    bits.extend_from_slice(&fm_encode_byte(byte));
}

/// Pushes a data byte using whichever encoding the host track uses.
fn push_byte(bits: &mut Vec<bool>, fm: bool, byte: u8, prev_bit: &mut bool) {
    if fm {
        push_byte_fm(bits, byte);
    } else {
        push_byte_mfm(bits, byte, prev_bit);
    }
}

/// Pushes the 32-bit sync pattern as two 16-bit halves.
fn push_sync_word(bits: &mut Vec<bool>, fm: bool) {
    let word = if fm { crate::mfm::FM_SYNC } else { MFM_SYNC };
    for half_shift in [16u32, 0u32] {
        let half = ((word >> half_shift) & 0xffff) as u16;
        for b in (0..16).rev() {
            bits.push((half >> b) & 1 != 0);
        }
    }
}

impl RawHandler {
    fn geom(&self) -> &HostGeometry {
        self.geom.as_ref().expect("open() called before use")
    }

    fn build_track(&self, data: &[u8], track_idx: u16) -> Vec<bool> {
        let geom = self.geom();
        let crc = crc16_ccitt();
        let mut bits = Vec::new();
        let mut prev = false;
        let sync_len = if geom.fm { SYNC_LEN_FM } else { SYNC_LEN_MFM };
        let gap2_len = if geom.fm { GAP2_LEN_FM } else { GAP2_LEN_MFM };

        if !geom.no_iam {
            let pregap = if geom.fm { IAM_PREGAP_FM } else { IAM_PREGAP_MFM };
            for _ in 0..pregap {
                push_byte(&mut bits, geom.fm, 0x4e, &mut prev);
            }
            for _ in 0..sync_len {
                push_byte(&mut bits, geom.fm, 0x00, &mut prev);
            }
            push_sync_word(&mut bits, geom.fm);
            push_byte(&mut bits, geom.fm, IAM_MARK, &mut prev);
        }

        let order = rotational_order(geom, track_idx);
        let track_off = Self::track_byte_offset(geom, track_idx);

        for &sector_id in &order {
            for _ in 0..sync_len {
                push_byte(&mut bits, geom.fm, 0x00, &mut prev);
            }
            push_sync_word(&mut bits, geom.fm);
            push_byte(&mut bits, geom.fm, IDAM_MARK, &mut prev);
            let cyl = (track_idx / u16::from(geom.nr_sides)) as u8;
            let head = (track_idx % u16::from(geom.nr_sides)) as u8;
            let size_code = sector_size_code(geom.sec_sz);
            let chrn = [cyl, head, sector_id, size_code];
            for &b in &chrn {
                push_byte(&mut bits, geom.fm, b, &mut prev);
            }
            let id_crc = crc.checksum(&chrn);
            push_byte(&mut bits, geom.fm, (id_crc >> 8) as u8, &mut prev);
            push_byte(&mut bits, geom.fm, id_crc as u8, &mut prev);

            for _ in 0..gap2_len {
                push_byte(&mut bits, geom.fm, 0x4e, &mut prev);
            }
            for _ in 0..sync_len {
                push_byte(&mut bits, geom.fm, 0x00, &mut prev);
            }
            push_sync_word(&mut bits, geom.fm);
            push_byte(&mut bits, geom.fm, DAM_MARK, &mut prev);

            let sec_off = track_off + sector_data_offset(geom, &order, sector_id) as usize;
            let payload = data.get(sec_off..sec_off + geom.sec_sz as usize).unwrap_or(&[0u8; 0]);
            let mut data_crc_buf = Vec::with_capacity(geom.sec_sz as usize + 1);
            data_crc_buf.push(DAM_MARK);
            for &b in payload {
                push_byte(&mut bits, geom.fm, b, &mut prev);
                data_crc_buf.push(b);
            }
            let data_crc = crc.checksum(&data_crc_buf);
            push_byte(&mut bits, geom.fm, (data_crc >> 8) as u8, &mut prev);
            push_byte(&mut bits, geom.fm, data_crc as u8, &mut prev);

            for _ in 0..geom.gap3 {
                push_byte(&mut bits, geom.fm, 0x4e, &mut prev);
            }
        }
        bits
    }

    fn track_byte_offset(geom: &HostGeometry, track_idx: u16) -> usize {
        track_idx as usize * geom.nr_sec as usize * geom.sec_sz as usize
    }
}

fn sector_data_offset(geom: &HostGeometry, order: &[u8], sector_id: u8) -> u32 {
    let logical = sector_id.wrapping_sub(geom.base_sec_nr);
    let _ = order;
    u32::from(logical) * u32::from(geom.sec_sz)
}

fn sector_size_code(sec_sz: u16) -> u8 {
    match sec_sz {
        128 => 0,
        256 => 1,
        512 => 2,
        1024 => 3,
        2048 => 4,
        _ => 2,
    }
}

impl ImageHandler for RawHandler {
    fn open(&mut self, data: &[u8]) -> FormatResult<Geometry> {
        let geom = *identify(data).ok_or(FormatError::UnrecognisedGeometry { size: data.len() as u64 })?;
        self.geom = Some(geom);
        let ticks_per_cell_x16 = if geom.fm {
            FM_TICKS_PER_CELL_X16
        } else if geom.sec_sz >= 512 && geom.nr_sec >= 15 {
            MFM_HD_TICKS_PER_CELL_X16
        } else {
            MFM_DD_TICKS_PER_CELL_X16
        };
        // Measured rather than hand-summed from field lengths: the sync
        // words each cost bits the byte-counting formula can't see cleanly,
        // so building track 0 once and taking its length is the only way to
        // be sure tracklen_bc matches what build_track actually produces.
        let track0 = self.build_track(data, 0);
        let tracklen_bc = track0.len() as u32;
        let stk_per_rev = (u64::from(tracklen_bc) * u64::from(ticks_per_cell_x16) / 16) as u32;
        Ok(Geometry {
            nr_cyls: geom.cyls,
            nr_sides: geom.nr_sides,
            tracklen_bc,
            ticks_per_cell_x16,
            stk_per_rev,
        })
    }

    fn setup_track(&mut self, data: &[u8], track: u16, restart_bc: Option<BitcellCount>) {
        self.cur_track = track;
        self.track_bits = self.build_track(data, track);
        self.read_cursor = restart_bc.unwrap_or(0) as usize % self.track_bits.len().max(1);
        self.write_decode.reset();
    }

    fn read_track(&mut self, _data: &[u8], bc_ring: &mut BitRing) -> bool {
        if bc_ring.space() == 0 {
            return false;
        }
        let len = self.track_bits.len();
        if len == 0 {
            return false;
        }
        while bc_ring.space() > 0 {
            let bit = self.track_bits[self.read_cursor];
            if !bc_ring.push(bit) {
                break;
            }
            self.read_cursor = (self.read_cursor + 1) % len;
        }
        true
    }

    fn write_track(&mut self, bc_ring: &mut BitRing, out: &mut [u8]) -> bool {
        let geom = *self.geom();
        let sync_word = if geom.fm { crate::mfm::FM_SYNC } else { MFM_SYNC };
        let mut progressed = false;
        while let Some(bit) = bc_ring.pop() {
            progressed = true;
            let wd = &mut self.write_decode;
            wd.shift = (wd.shift << 1) | u32::from(bit);
            match wd.state {
                DecodeState::SeekSync => {
                    if wd.shift == sync_word {
                        wd.state = DecodeState::Mark;
                        wd.nbits = 0;
                    }
                }
                DecodeState::Mark => {
                    wd.nbits += 1;
                    if wd.nbits == 16 {
                        let byte = mfm_decode_byte(&last16_as_bits(wd.shift));
                        wd.nbits = 0;
                        match byte {
                            IDAM_MARK => {
                                wd.field.clear();
                                wd.want = 6;
                                wd.state = DecodeState::Chrn;
                            }
                            DAM_MARK => {
                                wd.field.clear();
                                wd.field.push(byte);
                                wd.want = 1 + geom.sec_sz as usize + 2;
                                wd.state = DecodeState::DamData;
                            }
                            _ => wd.state = DecodeState::SeekSync,
                        }
                    }
                }
                DecodeState::Chrn => {
                    wd.nbits += 1;
                    if wd.nbits == 16 {
                        let byte = mfm_decode_byte(&last16_as_bits(wd.shift));
                        wd.nbits = 0;
                        wd.field.push(byte);
                        if wd.field.len() == wd.want {
                            self.finish_chrn();
                            self.write_decode.state = DecodeState::SeekSync;
                        }
                    }
                }
                DecodeState::DamData => {
                    wd.nbits += 1;
                    if wd.nbits == 16 {
                        let byte = mfm_decode_byte(&last16_as_bits(wd.shift));
                        wd.nbits = 0;
                        wd.field.push(byte);
                        if wd.field.len() == wd.want {
                            self.finish_dam(out, geom.sec_sz, geom.base_sec_nr);
                            self.write_decode.state = DecodeState::SeekSync;
                        }
                    }
                }
            }
        }
        !progressed
    }

    fn rdata_flux(&mut self, bc_ring: &mut BitRing, out: &mut [crate::SampleTicks]) -> usize {
        let geom = *self.geom();
        let ticks_per_cell_x16 = if geom.fm {
            FM_TICKS_PER_CELL_X16
        } else if geom.sec_sz >= 512 && geom.nr_sec >= 15 {
            MFM_HD_TICKS_PER_CELL_X16
        } else {
            MFM_DD_TICKS_PER_CELL_X16
        };
        let tracklen_bc = (self.track_bits.len().max(1)) as u32;
        let mut acc = crate::bitcell::FluxAccumulator::new(ticks_per_cell_x16, tracklen_bc);
        crate::bitcell::bc_rdata_flux(bc_ring, &mut acc, out)
    }
}

fn last16_as_bits(shift: u32) -> [bool; 16] {
    let mut bits = [false; 16];
    for i in 0..16 {
        bits[15 - i] = (shift >> i) & 1 != 0;
    }
    bits
}

impl RawHandler {
    fn finish_chrn(&mut self) {
        let bytes = &self.write_decode.field;
        let chrn = [bytes[0], bytes[1], bytes[2], bytes[3]];
        let crc = crc16_ccitt();
        let expect = (u16::from(bytes[4]) << 8) | u16::from(bytes[5]);
        if crc.checksum(&chrn) == expect {
            self.write_decode.chrn = Some(chrn);
        } else {
            self.write_decode.chrn = None;
        }
    }

    fn finish_dam(&mut self, out: &mut [u8], sec_sz: u16, base_sec_nr: u8) {
        let bytes = std::mem::take(&mut self.write_decode.field);
        let Some(chrn) = self.write_decode.chrn.take() else {
            return;
        };
        let payload_len = sec_sz as usize;
        if bytes.len() != 1 + payload_len + 2 {
            return;
        }
        let crc = crc16_ccitt();
        let digest = crc.checksum(&bytes[..1 + payload_len]);
        let expect = (u16::from(bytes[1 + payload_len]) << 8) | u16::from(bytes[2 + payload_len]);
        if digest != expect {
            return;
        }
        let sector_id = chrn[2];
        let logical = sector_id.wrapping_sub(base_sec_nr);
        let off = usize::from(logical) * payload_len;
        if off + payload_len <= out.len() {
            out[off..off + payload_len].copy_from_slice(&bytes[1..1 + payload_len]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifies_pc_720k_by_size() {
        let data = vec![0u8; 737_280];
        let g = identify(&data).expect("should match PC 720K");
        assert_eq!(g.host, Host::PcDd720);
        assert_eq!(g.cyls, 80);
        assert_eq!(g.nr_sides, 2);
        assert_eq!(g.nr_sec, 9);
    }

    #[test]
    fn rotational_order_applies_skew() {
        let geom = HostGeometry {
            host: Host::PcDd720,
            nr_sec: 4,
            nr_sides: 2,
            gap3: 10,
            sec_sz: 512,
            interleave: 1,
            skew: 1,
            base_sec_nr: 1,
            cyls: 80,
            no_iam: false,
            fm: false,
        };
        let t0 = rotational_order(&geom, 0);
        let t1 = rotational_order(&geom, 1);
        assert_eq!(t0, vec![1, 2, 3, 4]);
        assert_eq!(t1, vec![2, 3, 4, 1]);
    }

    #[test]
    fn raw_st_write_then_reread_round_trips() {
        let mut data = vec![0u8; 737_280];
        let mut handler = RawHandler::default();
        let geom = handler.open(&data).unwrap();

        let track = geom.track_index(40, 1);
        handler.setup_track(&data, track, None);
        let mut ring = BitRing::new(1 << 20);
        while handler.read_track(&data, &mut ring) && ring.space() > 0 {}

        // consume and re-decode the track to locate sector 3's data offset,
        // then simulate a host write of 0xA5 by writing directly into the
        // image and re-encoding/decoding through the bitcell path.
        let sec_geom = *handler.geom.as_ref().unwrap();
        let track_off = RawHandler::track_byte_offset(&sec_geom, track);
        let sec_off = track_off + usize::from(3u8.wrapping_sub(sec_geom.base_sec_nr)) * sec_geom.sec_sz as usize;
        data[sec_off] = 0xa5;

        handler.setup_track(&data, track, None);
        let mut ring2 = BitRing::new(1 << 20);
        handler.read_track(&data, &mut ring2);
        let mut out = vec![0u8; sec_geom.nr_sec as usize * sec_geom.sec_sz as usize];
        handler.write_track(&mut ring2, &mut out);
        assert_eq!(out[usize::from(3u8.wrapping_sub(sec_geom.base_sec_nr)) * sec_geom.sec_sz as usize], 0xa5);
    }
}
