//! MFM/FM bit-level framing helpers shared by the raw-sector, ADF and DSK
//! handlers: sync words, CRC-16/CCITT, and odd/even "long" encoding.

use crc::{Algorithm, Crc};

/// MFM sync word marking the start of an IDAM/DAM (after 3 `0xA1`-pattern
/// sync bytes encoded with missing clock bits).
pub const MFM_SYNC: u32 = 0x4489_4489;

/// FM sync approximation: five clock bits derived from the `0xC7` clock
/// pattern used by single-density marks.
pub const FM_SYNC: u32 = 0x5555_5015;

/// CRC-16/CCITT (poly 0x1021) as used for IDAM/DAM/IAM framing, seeded with
/// the mark bytes the caller has already fed through `crc_feed_mark`.
const CRC16_CCITT: Algorithm<u16> = Algorithm {
    width: 16,
    poly: 0x1021,
    init: 0xffff,
    refin: false,
    refout: false,
    xorout: 0x0000,
    check: 0x29b1,
    residue: 0x0000,
};

pub fn crc16_ccitt() -> Crc<u16> {
    Crc::<u16>::new(&CRC16_CCITT)
}

/// Amiga-style "odd/even" long encoding: 32 data bits are split into an odd
/// half (bits 1,3,5,...) and an even half (bits 0,2,4,...), each stored as
/// its own 32-bit MFM long, odd half first. Mirrors `adf.c`'s `emit_long`.
pub fn encode_long_odd_even(value: u32) -> (u32, u32) {
    let odd = compress_odd_bits(value >> 1);
    let even = compress_odd_bits(value);
    (odd, even)
}

/// Inverse of [`encode_long_odd_even`]: recombine odd/even halves into the
/// original 32-bit value.
pub fn decode_long_odd_even(odd: u32, even: u32) -> u32 {
    (expand_to_odd_bits(odd) << 1) | expand_to_odd_bits(even)
}

/// Extracts bits 0,2,4,...,30 of `v` and packs them contiguously into the
/// low 16 bits of the result.
fn compress_odd_bits(v: u32) -> u32 {
    let mut out = 0u32;
    for i in 0..16 {
        out |= ((v >> (i * 2)) & 1) << i;
    }
    out
}

/// Inverse of [`compress_odd_bits`]: spreads the low 16 bits of `v` back out
/// to every other bit position.
fn expand_to_odd_bits(v: u32) -> u32 {
    let mut out = 0u32;
    for i in 0..16 {
        out |= ((v >> i) & 1) << (i * 2);
    }
    out
}

/// AmigaDOS checksum: XOR of all 32-bit longs with the two top bits masked
/// off, per `adf.c`'s `amigados_checksum`.
pub fn amigados_checksum(longs: &[u32]) -> u32 {
    let mut csum = 0u32;
    for &l in longs {
        csum ^= l;
    }
    csum & 0x5555_5555
}

/// Encodes one data byte (MSB first) to 16 MFM bitcells (clock, data
/// interleaved), given the last data bit emitted by the previous byte.
/// Returns the bitcells and the new last-data-bit state.
pub fn mfm_encode_byte(byte: u8, mut prev_bit: bool) -> ([bool; 16], bool) {
    let mut out = [false; 16];
    for i in 0..8 {
        let data_bit = (byte >> (7 - i)) & 1 != 0;
        let clock_bit = !(prev_bit || data_bit);
        out[i * 2] = clock_bit;
        out[i * 2 + 1] = data_bit;
        prev_bit = data_bit;
    }
    (out, prev_bit)
}

/// Decodes 16 MFM bitcells (as produced by [`mfm_encode_byte`]) back to a
/// data byte, ignoring the clock bits.
pub fn mfm_decode_byte(bits: &[bool; 16]) -> u8 {
    let mut byte = 0u8;
    for i in 0..8 {
        byte = (byte << 1) | (bits[i * 2 + 1] as u8);
    }
    byte
}

/// FM-encodes one byte: the clock pattern is always `0xff` for a data byte
/// (the all-ones clock, contrasted with marks which use a missing-clock
/// sentinel), interleaved with data bits.
pub fn fm_encode_byte(byte: u8) -> [bool; 16] {
    let mut out = [false; 16];
    for i in 0..8 {
        out[i * 2] = true;
        out[i * 2 + 1] = (byte >> (7 - i)) & 1 != 0;
    }
    out
}

pub fn fm_decode_byte(bits: &[bool; 16]) -> u8 {
    mfm_decode_byte(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn odd_even_round_trip() {
        for v in [0u32, 1, 0xdead_beef, 0xffff_ffff, 0x1234_5678] {
            let (odd, even) = encode_long_odd_even(v);
            assert_eq!(decode_long_odd_even(odd, even), v);
        }
    }

    #[test]
    fn checksum_is_xor_of_masked_longs() {
        let longs = [0x5555_5555u32, 0xaaaa_aaaa, 0x1111_1111];
        let expect = (longs[0] ^ longs[1] ^ longs[2]) & 0x5555_5555;
        assert_eq!(amigados_checksum(&longs), expect);
    }

    #[test]
    fn crc_matches_check_value() {
        let crc = crc16_ccitt();
        assert_eq!(crc.checksum(b"123456789"), 0x29b1);
    }

    #[test]
    fn mfm_byte_round_trips() {
        let mut prev = false;
        for b in [0x00u8, 0xff, 0xa5, 0x5a, 0xfe] {
            let (bits, last) = mfm_encode_byte(b, prev);
            assert_eq!(mfm_decode_byte(&bits), b);
            prev = last;
        }
    }
}
