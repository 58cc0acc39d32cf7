// Frame header layout, frame kinds, and length validation for record streams.
use crate::core::error::{Error, ErrorKind};

pub const FRAME_HEADER_LEN: usize = 8;
pub const MAX_PAYLOAD_ABS: usize = 256 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameKind {
    Descriptor = 1,
    Record = 2,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Result<Self, Error> {
        match value {
            1 => Ok(FrameKind::Descriptor),
            2 => Ok(FrameKind::Record),
            _ => Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!("invalid frame kind {value}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameHeader {
    pub payload_len: u32,
    pub payload_len_xor: u32,
}

impl FrameHeader {
    pub fn new(payload_len: u32) -> Self {
        Self {
            payload_len,
            payload_len_xor: payload_len ^ 0xFFFF_FFFF,
        }
    }

    /// Header for a payload about to be written; rejects oversized payloads.
    pub fn for_payload(payload: &[u8]) -> Result<Self, Error> {
        if payload.len() > MAX_PAYLOAD_ABS {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("record payload of {} bytes exceeds max", payload.len())));
        }
        Ok(Self::new(payload.len() as u32))
    }

    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        write_u32(&mut buf, 0, self.payload_len);
        write_u32(&mut buf, 4, self.payload_len_xor);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(Error::new(ErrorKind::Corrupt).with_message("frame header too small"));
        }
        Ok(Self {
            payload_len: read_u32(buf, 0),
            payload_len_xor: read_u32(buf, 4),
        })
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.payload_len ^ self.payload_len_xor != 0xFFFF_FFFF {
            return Err(Error::new(ErrorKind::Corrupt).with_message("payload length xor mismatch"));
        }
        if self.payload_len == 0 {
            return Err(Error::new(ErrorKind::Corrupt).with_message("empty frame payload"));
        }
        if self.payload_len as usize > MAX_PAYLOAD_ABS {
            return Err(Error::new(ErrorKind::Corrupt).with_message("payload length exceeds max"));
        }
        Ok(())
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len as usize
    }
}

/// Appends one complete frame (header + payload) to `out`.
pub fn write_frame(payload: &[u8], out: &mut Vec<u8>) -> Result<(), Error> {
    let header = FrameHeader::for_payload(payload)?;
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(payload);
    Ok(())
}

/// Splits the next complete frame off the front of `cursor`.
///
/// Returns `None` when the cursor is empty; a partial header or payload is corrupt.
pub fn split_frame<'a>(cursor: &mut &'a [u8]) -> Result<Option<&'a [u8]>, Error> {
    if cursor.is_empty() {
        return Ok(None);
    }
    if cursor.len() < FRAME_HEADER_LEN {
        return Err(Error::new(ErrorKind::Corrupt).with_message("truncated frame header"));
    }
    let header = FrameHeader::decode(cursor)?;
    header.validate()?;
    let end = FRAME_HEADER_LEN + header.payload_len();
    if cursor.len() < end {
        return Err(Error::new(ErrorKind::Corrupt).with_message("truncated frame payload"));
    }
    let payload = &cursor[FRAME_HEADER_LEN..end];
    *cursor = &cursor[end..];
    Ok(Some(payload))
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(read_4(buf, offset))
}

fn read_4(buf: &[u8], offset: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    out
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::{FRAME_HEADER_LEN, FrameHeader, FrameKind, MAX_PAYLOAD_ABS, split_frame, write_frame};
    use crate::core::error::ErrorKind;

    #[test]
    fn header_round_trip() {
        let header = FrameHeader::new(42);
        let decoded = FrameHeader::decode(&header.encode()).expect("decode");
        assert_eq!(header, decoded);
        decoded.validate().expect("valid");
    }

    #[test]
    fn header_rejects_torn_payload_len() {
        let mut header = FrameHeader::new(8);
        header.payload_len_xor = 0;
        let err = header.validate().expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn header_rejects_oversized_payload() {
        let header = FrameHeader::new((MAX_PAYLOAD_ABS as u32) + 1);
        let err = header.validate().expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn unknown_frame_kind_is_corrupt() {
        assert_eq!(FrameKind::from_u8(2).unwrap(), FrameKind::Record);
        assert_eq!(FrameKind::from_u8(9).unwrap_err().kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn split_walks_frames_then_stops() {
        let mut buf = Vec::new();
        write_frame(b"one", &mut buf).unwrap();
        write_frame(b"three", &mut buf).unwrap();
        let mut cursor = buf.as_slice();
        assert_eq!(split_frame(&mut cursor).unwrap(), Some(&b"one"[..]));
        assert_eq!(split_frame(&mut cursor).unwrap(), Some(&b"three"[..]));
        assert_eq!(split_frame(&mut cursor).unwrap(), None);
    }

    #[test]
    fn split_rejects_truncation() {
        let mut buf = Vec::new();
        write_frame(b"payload", &mut buf).unwrap();

        let mut short_header = &buf[..FRAME_HEADER_LEN - 1];
        assert_eq!(
            split_frame(&mut short_header).unwrap_err().kind(),
            ErrorKind::Corrupt
        );

        let mut short_payload = &buf[..buf.len() - 1];
        assert_eq!(
            split_frame(&mut short_payload).unwrap_err().kind(),
            ErrorKind::Corrupt
        );
    }
}
