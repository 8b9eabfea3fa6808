//! Direct-Access: a synthetic "drive" parked at a dedicated cylinder so host
//! selector software can issue commands and read status without physical
//! drive semantics. Sector 0 of the synthetic track carries a command/status
//! block; the remaining sectors tunnel block I/O against whichever image is
//! currently selected.

use log::{debug, warn};

use crate::bitcell::BitRing;
use crate::flux::MFM_DD_TICKS_PER_CELL_X16;
use crate::mfm::{crc16_ccitt, mfm_decode_byte, mfm_encode_byte, MFM_SYNC};
use crate::{BitcellCount, FormatResult, Geometry, ImageHandler};

pub const DA_CYL: u16 = 254;
pub const SIGNATURE: &[u8; 8] = b"HxCFEDA\0";
const NR_SECTORS: u8 = 9;
const SECTOR_SIZE: usize = 512;
const FW_VERSION: &[u8] = b"flashfloppy-rs-1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Nop = 0,
    SetLba = 1,
    SetCyl = 2,
    SetRpm = 3,
    SelectImage = 4,
}

impl Command {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Nop),
            1 => Some(Self::SetLba),
            2 => Some(Self::SetCyl),
            3 => Some(Self::SetRpm),
            4 => Some(Self::SelectImage),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct DaState {
    lba_base: u32,
    cyl: u16,
    rpm: u16,
    selected_image: u8,
    cmd_cnt: u32,
    last_cmd_status: u8,
}

impl DaState {
    fn apply(&mut self, payload: &[u8]) {
        self.cmd_cnt = self.cmd_cnt.wrapping_add(1);
        if &payload[0..8] != SIGNATURE {
            warn!("da: command block with bad signature");
            self.last_cmd_status = 0xff;
            return;
        }
        let cmd = payload[8];
        let param = [payload[12], payload[13], payload[14], payload[15]];
        match Command::from_u8(cmd) {
            Some(Command::Nop) => self.last_cmd_status = 0,
            Some(Command::SetLba) => {
                self.lba_base = u32::from_le_bytes(param);
                self.last_cmd_status = 0;
            }
            Some(Command::SetCyl) => {
                self.cyl = u16::from_le_bytes([param[0], param[1]]);
                self.last_cmd_status = 0;
            }
            Some(Command::SetRpm) => {
                self.rpm = u16::from_le_bytes([param[0], param[1]]);
                self.last_cmd_status = 0;
            }
            Some(Command::SelectImage) => {
                self.selected_image = param[0];
                self.last_cmd_status = 0;
            }
            None => {
                debug!("da: unknown command byte {cmd}");
                self.last_cmd_status = 1;
            }
        }
    }

    fn status_sector(&self, nr_tunnel_sectors: u32) -> [u8; SECTOR_SIZE] {
        let mut buf = [0u8; SECTOR_SIZE];
        buf[0..8].copy_from_slice(SIGNATURE);
        buf[8..12].copy_from_slice(&self.cmd_cnt.to_le_bytes());
        buf[12] = self.last_cmd_status;
        buf[16..20].copy_from_slice(&self.lba_base.to_le_bytes());
        buf[20..22].copy_from_slice(&self.cyl.to_le_bytes());
        buf[22..24].copy_from_slice(&self.rpm.to_le_bytes());
        buf[24] = self.selected_image;
        buf[28..32].copy_from_slice(&nr_tunnel_sectors.to_le_bytes());
        buf[32..32 + FW_VERSION.len()].copy_from_slice(FW_VERSION);
        buf
    }
}

fn push_byte(bits: &mut Vec<bool>, byte: u8, prev: &mut bool) {
    let (cells, last) = mfm_encode_byte(byte, *prev);
    bits.extend_from_slice(&cells);
    *prev = last;
}

fn push_sync(bits: &mut Vec<bool>) {
    for half_shift in [16u32, 0u32] {
        let half = ((MFM_SYNC >> half_shift) & 0xffff) as u16;
        for b in (0..16).rev() {
            bits.push((half >> b) & 1 != 0);
        }
    }
}

const IDAM_MARK: u8 = 0xfe;
const DAM_MARK: u8 = 0xfb;

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

#[derive(Debug, Default)]
pub struct DaHandler {
    state: DaState,
    blocks: Vec<u8>,
    cur_track: u16,
    track_bits: Vec<bool>,
    read_cursor: usize,
    write_decode: WriteDecoder,
}

impl DaHandler {
    fn nr_tunnel_sectors() -> u32 {
        u32::from(NR_SECTORS) - 1
    }

    fn build_track(&mut self) -> Vec<bool> {
        if self.blocks.is_empty() {
            self.blocks = vec![0u8; Self::nr_tunnel_sectors() as usize * SECTOR_SIZE];
        }
        let mut bits = Vec::new();
        let mut prev = false;
        for _ in 0..40 {
            push_byte(&mut bits, 0x4e, &mut prev);
        }
        let status = self.state.status_sector(Self::nr_tunnel_sectors());
        for sector in 0..NR_SECTORS {
            for _ in 0..12 {
                push_byte(&mut bits, 0x00, &mut prev);
            }
            push_sync(&mut bits);
            push_byte(&mut bits, IDAM_MARK, &mut prev);
            let chrn = [DA_CYL as u8, 0, sector, 2];
            for &b in &chrn {
                push_byte(&mut bits, b, &mut prev);
            }
            let crc = crc16_ccitt();
            let id_crc = crc.checksum(&chrn);
            push_byte(&mut bits, (id_crc >> 8) as u8, &mut prev);
            push_byte(&mut bits, id_crc as u8, &mut prev);

            for _ in 0..22 {
                push_byte(&mut bits, 0x4e, &mut prev);
            }
            for _ in 0..12 {
                push_byte(&mut bits, 0x00, &mut prev);
            }
            push_sync(&mut bits);
            push_byte(&mut bits, DAM_MARK, &mut prev);

            let payload: &[u8] = if sector == 0 {
                &status
            } else {
                let off = (sector as usize - 1) * SECTOR_SIZE;
                &self.blocks[off..off + SECTOR_SIZE]
            };
            let mut crc_buf = Vec::with_capacity(SECTOR_SIZE + 1);
            crc_buf.push(DAM_MARK);
            for &b in payload {
                push_byte(&mut bits, b, &mut prev);
                crc_buf.push(b);
            }
            let data_crc = crc.checksum(&crc_buf);
            push_byte(&mut bits, (data_crc >> 8) as u8, &mut prev);
            push_byte(&mut bits, data_crc as u8, &mut prev);

            for _ in 0..80 {
                push_byte(&mut bits, 0x4e, &mut prev);
            }
        }
        bits
    }

    fn finish_chrn(&mut self) {
        let bytes = &self.write_decode.field;
        let chrn = [bytes[0], bytes[1], bytes[2], bytes[3]];
        let crc = crc16_ccitt();
        let expect = (u16::from(bytes[4]) << 8) | u16::from(bytes[5]);
        self.write_decode.chrn = (crc.checksum(&chrn) == expect).then_some(chrn);
    }

    fn finish_dam(&mut self) {
        let bytes = std::mem::take(&mut self.write_decode.field);
        let Some(chrn) = self.write_decode.chrn.take() else { return };
        if bytes.len() != 1 + SECTOR_SIZE + 2 {
            return;
        }
        let crc = crc16_ccitt();
        let expect_crc = (u16::from(bytes[1 + SECTOR_SIZE]) << 8) | u16::from(bytes[2 + SECTOR_SIZE]);
        if crc.checksum(&bytes[..1 + SECTOR_SIZE]) != expect_crc {
            return;
        }
        let payload = &bytes[1..1 + SECTOR_SIZE];
        let sector = chrn[2];
        if sector == 0 {
            self.state.apply(payload);
        } else if self.blocks.is_empty() {
            self.blocks = vec![0u8; Self::nr_tunnel_sectors() as usize * SECTOR_SIZE];
        }
        if sector != 0 {
            let off = (sector as usize - 1) * SECTOR_SIZE;
            if off + SECTOR_SIZE <= self.blocks.len() {
                self.blocks[off..off + SECTOR_SIZE].copy_from_slice(payload);
            }
        }
    }
}

fn decode16(shift: u32) -> u8 {
    let mut cells = [false; 16];
    for i in 0..16 {
        cells[15 - i] = (shift >> i) & 1 != 0;
    }
    mfm_decode_byte(&cells)
}

impl ImageHandler for DaHandler {
    fn open(&mut self, _data: &[u8]) -> FormatResult<Geometry> {
        self.blocks = vec![0u8; Self::nr_tunnel_sectors() as usize * SECTOR_SIZE];
        let track0 = self.build_track();
        let tracklen_bc = track0.len() as u32;
        let ticks_per_cell_x16 = MFM_DD_TICKS_PER_CELL_X16;
        let stk_per_rev = (u64::from(tracklen_bc) * u64::from(ticks_per_cell_x16) / 16) as u32;
        Ok(Geometry {
            nr_cyls: DA_CYL + 2,
            nr_sides: 1,
            tracklen_bc,
            ticks_per_cell_x16,
            stk_per_rev,
        })
    }

    fn setup_track(&mut self, _data: &[u8], track: u16, restart_bc: Option<BitcellCount>) {
        self.cur_track = track;
        self.track_bits = self.build_track();
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

    fn write_track(&mut self, bc_ring: &mut BitRing, _out: &mut [u8]) -> bool {
        let mut progressed = false;
        while let Some(bit) = bc_ring.pop() {
            progressed = true;
            let wd = &mut self.write_decode;
            wd.shift = (wd.shift << 1) | u32::from(bit);
            match wd.state {
                DecodeState::SeekSync => {
                    if wd.shift == MFM_SYNC {
                        wd.state = DecodeState::Mark;
                        wd.nbits = 0;
                    }
                }
                DecodeState::Mark => {
                    wd.nbits += 1;
                    if wd.nbits == 16 {
                        let byte = decode16(wd.shift);
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
                                wd.want = 1 + SECTOR_SIZE + 2;
                                wd.state = DecodeState::DamData;
                            }
                            _ => wd.state = DecodeState::SeekSync,
                        }
                    }
                }
                DecodeState::Chrn => {
                    wd.nbits += 1;
                    if wd.nbits == 16 {
                        let byte = decode16(wd.shift);
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
                        let byte = decode16(wd.shift);
                        wd.nbits = 0;
                        wd.field.push(byte);
                        if wd.field.len() == wd.want {
                            self.finish_dam();
                            self.write_decode.state = DecodeState::SeekSync;
                        }
                    }
                }
            }
        }
        !progressed
    }

    fn rdata_flux(&mut self, bc_ring: &mut BitRing, out: &mut [crate::SampleTicks]) -> usize {
        let tracklen_bc = (self.track_bits.len().max(1)) as u32;
        let mut acc = crate::bitcell::FluxAccumulator::new(MFM_DD_TICKS_PER_CELL_X16, tracklen_bc);
        crate::bitcell::bc_rdata_flux(bc_ring, &mut acc, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_command(cmd: Command, param: [u8; 4]) -> [u8; SECTOR_SIZE] {
        let mut buf = [0u8; SECTOR_SIZE];
        buf[0..8].copy_from_slice(SIGNATURE);
        buf[8] = cmd as u8;
        buf[12..16].copy_from_slice(&param);
        buf
    }

    fn write_sector_bits(bits: &mut Vec<bool>, prev: &mut bool, track: u8, sector: u8, payload: &[u8]) {
        push_sync(bits);
        push_byte(bits, IDAM_MARK, prev);
        let chrn = [track, 0, sector, 2];
        for &b in &chrn {
            push_byte(bits, b, prev);
        }
        let crc = crc16_ccitt();
        let id_crc = crc.checksum(&chrn);
        push_byte(bits, (id_crc >> 8) as u8, prev);
        push_byte(bits, id_crc as u8, prev);
        push_sync(bits);
        push_byte(bits, DAM_MARK, prev);
        let mut crc_buf = vec![DAM_MARK];
        for &b in payload {
            push_byte(bits, b, prev);
            crc_buf.push(b);
        }
        let data_crc = crc.checksum(&crc_buf);
        push_byte(bits, (data_crc >> 8) as u8, prev);
        push_byte(bits, data_crc as u8, prev);
    }

    #[test]
    fn set_lba_command_round_trips_through_status_sector() {
        let mut h = DaHandler::default();
        h.open(&[]).unwrap();
        h.setup_track(&[], DA_CYL, None);

        let cmd = encode_command(Command::SetLba, [0x00, 0x20, 0x00, 0x00]);
        let mut bits = Vec::new();
        let mut prev = false;
        write_sector_bits(&mut bits, &mut prev, DA_CYL as u8, 0, &cmd);

        let mut ring = BitRing::new(1 << 16);
        for b in bits {
            ring.push(b);
        }
        let mut scratch = vec![0u8; 0];
        h.write_track(&mut ring, &mut scratch);

        assert_eq!(h.state.lba_base, 0x0000_2000);
        assert_eq!(h.state.cmd_cnt, 1);
        assert_eq!(h.state.last_cmd_status, 0);

        h.setup_track(&[], DA_CYL, None);
        let mut read_ring = BitRing::new(1 << 16);
        h.read_track(&[], &mut read_ring);
        assert!(read_ring.filled() > 0);
    }
}
