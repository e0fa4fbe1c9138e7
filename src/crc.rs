//! The checksum used on Pico frames.
//!
//! CRC-16 with generator polynomial 0x11189 (top bit implied, so 0x1189),
//! initial value 0, no reflection and no output XOR. None of the catalogued
//! algorithms in `crc16` match, so it is plugged in as a custom `CrcType`.

use crc16::{CrcType, State};

/// The Pico CRC-16 variant.
pub enum PICO {}

const POLY: u16 = 0x1189;

const TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ POLY } else { crc << 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

impl CrcType for PICO {
    fn init() -> u16 {
        0x0000
    }

    fn update(crc: u16, msg: &[u8]) -> u16 {
        msg.iter().fold(crc, |crc, &byte| {
            (crc << 8) ^ TABLE[usize::from((crc >> 8) as u8 ^ byte)]
        })
    }

    fn get(crc: u16) -> u16 {
        crc
    }
}

/// Compute the CRC over `data[offset..offset + len]`.
///
/// Returns `None` if the range is outside `data`.
pub fn compute(data: &[u8], offset: usize, len: usize) -> Option<u16> {
    let end = offset.checked_add(len)?;
    data.get(offset..end).map(State::<PICO>::calculate)
}

/// Append the big-endian CRC of a request to it.
///
/// The device checksums everything between the leading byte and the trailing
/// `0xff` delimiter, so the range is `buffer[1..len - 1]`.
pub fn append(buffer: &mut Vec<u8>) {
    let end = buffer.len().saturating_sub(1);
    let crc = buffer
        .get(1..end)
        .map(State::<PICO>::calculate)
        .unwrap_or_default();
    buffer.extend_from_slice(&crc.to_be_bytes());
}

/// Check the trailing CRC of a complete frame as the device sends it.
pub fn verify(frame: &[u8]) -> bool {
    if frame.len() < 4 {
        return false;
    }
    let (body, crc) = frame.split_at(frame.len() - 2);
    let expected = State::<PICO>::calculate(&body[1..body.len() - 1]);
    crc == expected.to_be_bytes()
}

#[test]
fn test_check_value() {
    assert_eq!(State::<PICO>::calculate(b"123456789"), 0x1fd1);
}

#[test]
fn test_compute_range() {
    let data = b"xx123456789yy";
    assert_eq!(compute(data, 2, 9), Some(0x1fd1));
    assert_eq!(compute(data, 10, 9), None);
    assert_eq!(compute(&[0x01, 0x02, 0x03], 0, 3), Some(0xc06a));
}

#[test]
fn test_append_count_request() {
    let mut request = hex::decode("0000000000ff02048c554b0003ff").unwrap();
    append(&mut request);
    assert_eq!(hex::encode(&request), "0000000000ff02048c554b0003ffa8c0");
}

#[test]
fn test_verify_device_response() {
    // Count response captured from a real device.
    let captured =
        hex::decode("0000000000ff02048c554b0011ff01010000001eff020100000030ff32cf").unwrap();
    assert!(verify(&captured));

    let mut corrupted = captured.clone();
    corrupted[19] ^= 0x01;
    assert!(!verify(&corrupted));
    assert!(!verify(&captured[..3]));
}
