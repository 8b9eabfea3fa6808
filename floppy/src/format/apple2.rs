//! Apple II 5.25" DOS-order sector images (.dsk/.do), GCR 6-and-2
//! nibblized, grounded in the same address/data-field + prologue/epilogue
//! structure `raw.rs` and `dsk.rs` use for IBM framing, substituted for
//! Apple II's self-clocking disk-byte alphabet in place of MFM/FM.

use crate::bitcell::BitRing;
use crate::flux::FM_TICKS_PER_CELL_X16;
use crate::{BitcellCount, FormatError, FormatResult, Geometry, ImageHandler};

const NR_TRACKS: u16 = 35;
const SECTORS_PER_TRACK: usize = 16;
const SECTOR_SIZE: usize = 256;
const IMAGE_SIZE: usize = NR_TRACKS as usize * SECTORS_PER_TRACK * SECTOR_SIZE;

const ADDR_PROLOGUE: [u8; 3] = [0xd5, 0xaa, 0x96];
const DATA_PROLOGUE: [u8; 3] = [0xd5, 0xaa, 0xad];
const EPILOGUE: [u8; 3] = [0xde, 0xaa, 0xeb];

/// DOS 3.3's standard logical-to-physical sector interleave.
const DOS_SKEW: [usize; 16] = [0, 13, 11, 9, 7, 5, 3, 1, 14, 12, 10, 8, 6, 4, 2, 15];

/// The 64-entry "6-and-2" disk-byte alphabet: every value has its high bit
/// set and no more than one consecutive zero bit, so it stays self-clocking
/// with no merge bits required.
const GCR62_ENCODE: [u8; 64] = [
    0x96, 0x97, 0x9a, 0x9b, 0x9d, 0x9e, 0x9f, 0xa6, 0xa7, 0xab, 0xac, 0xad, 0xae, 0xaf, 0xb2, 0xb3,
    0xb4, 0xb5, 0xb6, 0xb7, 0xb9, 0xba, 0xbb, 0xbc, 0xbd, 0xbe, 0xbf, 0xcb, 0xcd, 0xce, 0xcf, 0xd3,
    0xd6, 0xd7, 0xd9, 0xda, 0xdb, 0xdc, 0xdd, 0xde, 0xdf, 0xe5, 0xe6, 0xe7, 0xe9, 0xea, 0xeb, 0xec,
    0xed, 0xee, 0xef, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf9, 0xfa, 0xfb, 0xfc, 0xfd, 0xfe, 0xff,
];

fn gcr62_decode(byte: u8) -> Option<u8> {
    GCR62_ENCODE.iter().position(|&v| v == byte).map(|v| v as u8)
}

fn encode_4and4(byte: u8) -> (u8, u8) {
    (0xaa | (byte >> 1), 0xaa | byte)
}

fn decode_4and4(odd: u8, even: u8) -> u8 {
    ((odd << 1) | 1) & even
}

/// Packs a 256-byte sector payload into 342 six-bit groups, MSB-first, with
/// a running XOR-chain checksum appended as a final 343rd group.
fn pack_6bit(data: &[u8]) -> Vec<u8> {
    let mut bits = Vec::with_capacity(data.len() * 8);
    for &b in data {
        for i in (0..8).rev() {
            bits.push((b >> i) & 1);
        }
    }
    while bits.len() % 6 != 0 {
        bits.push(0);
    }
    let mut groups: Vec<u8> = bits.chunks(6).map(|c| c.iter().fold(0u8, |acc, &b| (acc << 1) | b)).collect();
    let mut chk = 0u8;
    for g in &groups {
        chk ^= g;
    }
    groups.push(chk);
    groups
}

fn unpack_6bit(groups: &[u8]) -> Option<Vec<u8>> {
    let (chk, body) = groups.split_last()?;
    let mut running = 0u8;
    for g in body {
        running ^= g;
    }
    if running != *chk {
        return None;
    }
    let mut bits = Vec::with_capacity(body.len() * 6);
    for &g in body {
        for i in (0..6).rev() {
            bits.push((g >> i) & 1);
        }
    }
    bits.truncate(SECTOR_SIZE * 8);
    Some(bits.chunks(8).map(|c| c.iter().fold(0u8, |acc, &b| (acc << 1) | b)).collect())
}

fn push_byte(bits: &mut Vec<bool>, byte: u8) {
    for i in (0..8).rev() {
        bits.push((byte >> i) & 1 != 0);
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    #[default]
    SeekMark,
    Address,
    Data,
}

#[derive(Debug, Default)]
struct WriteDecoder {
    state: DecodeState,
    shift: u32,
    nbits: u32,
    field: Vec<u8>,
    want: usize,
    target_sector: Option<u8>,
}

impl WriteDecoder {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Default)]
pub struct Apple2Handler {
    volume: u8,
    cur_track: u16,
    track_bits: Vec<bool>,
    read_cursor: usize,
    write_decode: WriteDecoder,
}

impl Apple2Handler {
    fn track_offset(track: u16) -> usize {
        track as usize * SECTORS_PER_TRACK * SECTOR_SIZE
    }

    fn build_track(&self, data: &[u8], track: u16) -> Vec<bool> {
        let mut bits = Vec::new();
        let base = Self::track_offset(track);
        for phys in 0..SECTORS_PER_TRACK {
            let logical = DOS_SKEW[phys];
            for _ in 0..8 {
                push_byte(&mut bits, 0xff);
            }
            for &b in &ADDR_PROLOGUE {
                push_byte(&mut bits, b);
            }
            let (vo, ve) = encode_4and4(self.volume);
            let (to, te) = encode_4and4(track as u8);
            let (so, se) = encode_4and4(logical as u8);
            let chk = self.volume ^ (track as u8) ^ (logical as u8);
            let (co, ce) = encode_4and4(chk);
            for b in [vo, ve, to, te, so, se, co, ce] {
                push_byte(&mut bits, b);
            }
            for &b in &EPILOGUE {
                push_byte(&mut bits, b);
            }
            for _ in 0..5 {
                push_byte(&mut bits, 0xff);
            }
            for &b in &DATA_PROLOGUE {
                push_byte(&mut bits, b);
            }
            let off = base + logical * SECTOR_SIZE;
            let sector = data.get(off..off + SECTOR_SIZE).unwrap_or(&[0u8; SECTOR_SIZE]);
            let groups = pack_6bit(sector);
            for g in groups {
                push_byte(&mut bits, GCR62_ENCODE[g as usize]);
            }
            for &b in &EPILOGUE {
                push_byte(&mut bits, b);
            }
        }
        bits
    }

    fn finish_address(&mut self) {
        let f = &self.write_decode.field;
        if f.len() != 8 {
            return;
        }
        let vol = decode_4and4(f[0], f[1]);
        let trk = decode_4and4(f[2], f[3]);
        let sec = decode_4and4(f[4], f[5]);
        let chk = decode_4and4(f[6], f[7]);
        if vol ^ trk ^ sec == chk && trk == self.cur_track as u8 {
            self.write_decode.target_sector = Some(sec);
        }
    }

    fn finish_data(&mut self, out: &mut [u8]) {
        let bytes = std::mem::take(&mut self.write_decode.field);
        let Some(sector) = self.write_decode.target_sector.take() else {
            return;
        };
        let Some(groups): Option<Vec<u8>> = bytes.iter().map(|&b| gcr62_decode(b)).collect() else {
            return;
        };
        let Some(payload) = unpack_6bit(&groups) else {
            return;
        };
        let off = Self::track_offset(self.cur_track) + sector as usize * SECTOR_SIZE;
        if off + SECTOR_SIZE <= out.len() {
            out[off..off + SECTOR_SIZE].copy_from_slice(&payload);
        }
    }
}

impl ImageHandler for Apple2Handler {
    fn open(&mut self, data: &[u8]) -> FormatResult<Geometry> {
        if data.len() != IMAGE_SIZE {
            return Err(FormatError::UnrecognisedGeometry { size: data.len() as u64 });
        }
        self.volume = 254;
        let track0 = self.build_track(data, 0);
        let tracklen_bc = track0.len() as u32;
        let ticks_per_cell_x16 = FM_TICKS_PER_CELL_X16;
        let stk_per_rev = (u64::from(tracklen_bc) * u64::from(ticks_per_cell_x16) / 16) as u32;
        Ok(Geometry {
            nr_cyls: NR_TRACKS,
            nr_sides: 1,
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
        if bc_ring.space() == 0 || self.track_bits.is_empty() {
            return false;
        }
        let len = self.track_bits.len();
        while bc_ring.space() > 0 {
            if !bc_ring.push(self.track_bits[self.read_cursor]) {
                break;
            }
            self.read_cursor = (self.read_cursor + 1) % len;
        }
        true
    }

    fn write_track(&mut self, bc_ring: &mut BitRing, out: &mut [u8]) -> bool {
        let mut progressed = false;
        while let Some(bit) = bc_ring.pop() {
            progressed = true;
            let wd = &mut self.write_decode;
            wd.shift = (wd.shift << 1) | u32::from(bit);
            wd.nbits += 1;
            match wd.state {
                DecodeState::SeekMark => {
                    if wd.nbits >= 24 {
                        let window = wd.shift & 0xff_ffff;
                        let addr = (u32::from(ADDR_PROLOGUE[0]) << 16) | (u32::from(ADDR_PROLOGUE[1]) << 8) | u32::from(ADDR_PROLOGUE[2]);
                        let dat = (u32::from(DATA_PROLOGUE[0]) << 16) | (u32::from(DATA_PROLOGUE[1]) << 8) | u32::from(DATA_PROLOGUE[2]);
                        if window == addr {
                            wd.field.clear();
                            wd.want = 8;
                            wd.nbits = 0;
                            wd.state = DecodeState::Address;
                        } else if window == dat {
                            wd.field.clear();
                            wd.want = 343;
                            wd.nbits = 0;
                            wd.state = DecodeState::Data;
                        }
                    }
                }
                DecodeState::Address => {
                    if wd.nbits == 8 {
                        wd.field.push(wd.shift as u8);
                        wd.nbits = 0;
                        if wd.field.len() == wd.want {
                            self.finish_address();
                            self.write_decode.state = DecodeState::SeekMark;
                            self.write_decode.nbits = 0;
                        }
                    }
                }
                DecodeState::Data => {
                    if wd.nbits == 8 {
                        wd.field.push(wd.shift as u8);
                        wd.nbits = 0;
                        if wd.field.len() == wd.want {
                            self.finish_data(out);
                            self.write_decode.state = DecodeState::SeekMark;
                            self.write_decode.nbits = 0;
                        }
                    }
                }
            }
        }
        !progressed
    }

    fn rdata_flux(&mut self, bc_ring: &mut BitRing, out: &mut [crate::SampleTicks]) -> usize {
        let tracklen_bc = (self.track_bits.len().max(1)) as u32;
        let mut acc = crate::bitcell::FluxAccumulator::new(FM_TICKS_PER_CELL_X16, tracklen_bc);
        crate::bitcell::bc_rdata_flux(bc_ring, &mut acc, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_image() -> Vec<u8> {
        vec![0u8; IMAGE_SIZE]
    }

    #[test]
    fn rejects_wrong_size() {
        let mut h = Apple2Handler::default();
        assert!(h.open(&[0u8; 10]).is_err());
    }

    #[test]
    fn opens_143360_byte_image_as_35_tracks() {
        let data = blank_image();
        let mut h = Apple2Handler::default();
        let geom = h.open(&data).unwrap();
        assert_eq!(geom.nr_cyls, 35);
        assert_eq!(geom.nr_sides, 1);
    }

    #[test]
    fn six_and_two_round_trips() {
        let mut payload = [0u8; SECTOR_SIZE];
        for (i, b) in payload.iter_mut().enumerate() {
            *b = (i * 7) as u8;
        }
        let groups = pack_6bit(&payload);
        let decoded = unpack_6bit(&groups).unwrap();
        assert_eq!(&decoded[..], &payload[..]);
    }

    #[test]
    fn write_then_reread_round_trips_a_sector() {
        let mut data = blank_image();
        let off = 3 * SECTORS_PER_TRACK * SECTOR_SIZE + 5 * SECTOR_SIZE;
        data[off..off + SECTOR_SIZE].fill(0xa5);
        let mut h = Apple2Handler::default();
        h.open(&data).unwrap();
        h.setup_track(&data, 3, None);
        let mut ring = BitRing::new(1 << 17);
        h.read_track(&data, &mut ring);
        let mut out = vec![0u8; data.len()];
        h.write_track(&mut ring, &mut out);
        assert_eq!(&out[off..off + SECTOR_SIZE], &data[off..off + SECTOR_SIZE]);
    }
}
