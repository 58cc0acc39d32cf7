//! Purpose: Centralize record-stream format versioning and the stream header.
//! Exports: `STREAM_MAGIC`, `STREAM_FORMAT_VERSION`, `StreamHeader`, `stream_version_error`.
//! Role: Shared policy for gating wire compatibility in the reader and writer.
//! Invariants: Version list is additive; bump only for incompatible wire changes.
//! Invariants: Every non-empty stream starts with the 8-byte header.

use crate::core::error::{Error, ErrorKind};
use crate::core::frame::read_u32;

pub const STREAM_MAGIC: [u8; 4] = *b"FREC";
pub const STREAM_HEADER_LEN: usize = 8;
pub const STREAM_FORMAT_VERSION: u32 = 1;
pub const SUPPORTED_STREAM_FORMAT_VERSIONS: &[u32] = &[STREAM_FORMAT_VERSION];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamHeader {
    pub version: u32,
}

impl StreamHeader {
    pub fn current() -> Self {
        Self {
            version: STREAM_FORMAT_VERSION,
        }
    }

    pub fn encode(&self) -> [u8; STREAM_HEADER_LEN] {
        let mut buf = [0u8; STREAM_HEADER_LEN];
        buf[0..4].copy_from_slice(&STREAM_MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < STREAM_HEADER_LEN {
            return Err(Error::new(ErrorKind::Corrupt).with_message("truncated stream header"));
        }
        if buf[0..4] != STREAM_MAGIC {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("bad stream magic")
                .with_hint("The source is not a record stream."));
        }
        let version = read_u32(buf, 4);
        if !SUPPORTED_STREAM_FORMAT_VERSIONS.contains(&version) {
            return Err(stream_version_error(version));
        }
        Ok(Self { version })
    }
}

pub fn stream_version_error(detected: u32) -> Error {
    let supported = SUPPORTED_STREAM_FORMAT_VERSIONS
        .iter()
        .map(|version| version.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Error::new(ErrorKind::Usage)
        .with_message(format!(
            "unsupported record stream version {detected} (supported: {supported})"
        ))
        .with_hint("Upgrade rdump or re-export the stream with a compatible writer.")
}

#[cfg(test)]
mod tests {
    use super::{STREAM_FORMAT_VERSION, StreamHeader};
    use crate::core::error::ErrorKind;

    #[test]
    fn header_round_trip() {
        let header = StreamHeader::current();
        assert_eq!(StreamHeader::decode(&header.encode()).unwrap(), header);
    }

    #[test]
    fn future_version_is_usage_error() {
        let header = StreamHeader {
            version: STREAM_FORMAT_VERSION + 1,
        };
        let err = StreamHeader::decode(&header.encode()).expect_err("unsupported");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert!(err.message().unwrap().contains("supported: 1"));
    }

    #[test]
    fn foreign_bytes_are_corrupt() {
        let err = StreamHeader::decode(b"PK\x03\x04....").expect_err("magic");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }
}
