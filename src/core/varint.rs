// LEB128 varints with zigzag mapping for signed values, read from a slice cursor.
use crate::core::error::{Error, ErrorKind};

const MAX_VARINT_LEN: usize = 10;

pub fn encode_u64(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

pub fn encode_i64(value: i64, out: &mut Vec<u8>) {
    encode_u64(zigzag(value), out);
}

pub fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Reads one unsigned varint and advances the cursor past it.
pub fn decode_u64(cursor: &mut &[u8]) -> Result<u64, Error> {
    let mut value = 0u64;
    for (idx, byte) in cursor.iter().copied().enumerate().take(MAX_VARINT_LEN) {
        let bits = u64::from(byte & 0x7F);
        if idx == MAX_VARINT_LEN - 1 && bits > 1 {
            return Err(overflow());
        }
        value |= bits << (7 * idx);
        if byte & 0x80 == 0 {
            *cursor = &cursor[idx + 1..];
            return Ok(value);
        }
    }
    if cursor.len() >= MAX_VARINT_LEN {
        return Err(overflow());
    }
    Err(Error::new(ErrorKind::Corrupt).with_message("truncated varint"))
}

pub fn decode_i64(cursor: &mut &[u8]) -> Result<i64, Error> {
    decode_u64(cursor).map(unzigzag)
}

fn overflow() -> Error {
    Error::new(ErrorKind::Corrupt).with_message("varint exceeds 64 bits")
}
