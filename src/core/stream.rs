//! Purpose: Sequential record streams over any `Read` source or `Write` sink.
//! Exports: `StreamReader`, `StreamWriter`.
//! Role: Pull-based decoding loop and buffered append path used by every adapter.
//! Invariants: Reading only moves forward; the reader is fused after end or error.
//! Invariants: Zero bytes, or a bare header, is an empty stream; any partial frame is `Corrupt`.
//! Invariants: Writers emit each descriptor once per stream, before its first record.
use std::collections::HashMap;
use std::io::{self, BufWriter, ErrorKind as IoErrorKind, Read, Write};

use tracing::trace;

use crate::core::codec::{self, Frame};
use crate::core::error::{Error, ErrorKind};
use crate::core::format::{STREAM_HEADER_LEN, StreamHeader};
use crate::core::frame::{self, FRAME_HEADER_LEN, FrameHeader};
use crate::core::record::Record;
use crate::core::schema::Registry;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ReaderState {
    Start,
    Frames,
    Done,
}

pub struct StreamReader<R> {
    source: R,
    registry: Registry,
    state: ReaderState,
    offset: u64,
    records_read: u64,
}

impl<R: Read> StreamReader<R> {
    pub fn new(source: R) -> Self {
        Self::with_registry(source, Registry::global().clone())
    }

    pub fn with_registry(source: R, registry: Registry) -> Self {
        Self {
            source,
            registry,
            state: ReaderState::Start,
            offset: 0,
            records_read: 0,
        }
    }

    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    /// Next record, `Ok(None)` at a clean end of stream.
    pub fn next_record(&mut self) -> Result<Option<Record>, Error> {
        if self.state == ReaderState::Done {
            return Ok(None);
        }
        let result = self.advance();
        if !matches!(result, Ok(Some(_))) {
            self.state = ReaderState::Done;
        }
        result
    }

    pub fn into_inner(self) -> R {
        self.source
    }

    fn advance(&mut self) -> Result<Option<Record>, Error> {
        if self.state == ReaderState::Start {
            let mut buf = [0u8; STREAM_HEADER_LEN];
            let read = read_full(&mut self.source, &mut buf)?;
            if read == 0 {
                return Ok(None);
            }
            if read < STREAM_HEADER_LEN {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message("truncated stream header")
                    .with_offset(0));
            }
            StreamHeader::decode(&buf).map_err(|err| err.with_offset(0))?;
            self.offset = STREAM_HEADER_LEN as u64;
            self.state = ReaderState::Frames;
        }

        loop {
            let frame_offset = self.offset;
            match self.read_frame() {
                Ok(None) => return Ok(None),
                Ok(Some(Frame::Descriptor(descriptor))) => {
                    trace!(descriptor = descriptor.name(), offset = frame_offset, "descriptor frame");
                }
                Ok(Some(Frame::Record(record))) => {
                    self.records_read += 1;
                    return Ok(Some(record));
                }
                Err(err) => return Err(err.with_offset(frame_offset)),
            }
        }
    }

    fn read_frame(&mut self) -> Result<Option<Frame>, Error> {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        let read = read_full(&mut self.source, &mut buf)?;
        if read == 0 {
            return Ok(None);
        }
        if read < FRAME_HEADER_LEN {
            return Err(Error::new(ErrorKind::Corrupt).with_message("truncated frame header"));
        }
        let header = FrameHeader::decode(&buf)?;
        header.validate()?;

        let mut payload = Vec::new();
        (&mut self.source)
            .take(header.payload_len() as u64)
            .read_to_end(&mut payload)
            .map_err(|err| io_error(err, "failed to read frame payload"))?;
        if payload.len() < header.payload_len() {
            return Err(Error::new(ErrorKind::Corrupt).with_message("truncated frame payload"));
        }
        self.offset += (FRAME_HEADER_LEN + payload.len()) as u64;
        codec::decode_payload(&payload, &self.registry).map(Some)
    }
}

impl<R: Read> Iterator for StreamReader<R> {
    type Item = Result<Record, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Reads until `buf` is full or the source ends; returns the number of bytes read.
fn read_full(source: &mut impl Read, buf: &mut [u8]) -> Result<usize, Error> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == IoErrorKind::Interrupted => continue,
            Err(err) => return Err(io_error(err, "failed to read record stream")),
        }
    }
    Ok(filled)
}

fn io_error(err: io::Error, message: &str) -> Error {
    Error::new(ErrorKind::Io)
        .with_message(message)
        .with_source(err)
}

pub struct StreamWriter<W: Write> {
    sink: BufWriter<W>,
    descriptors: HashMap<String, u32>,
    records_written: u64,
    scratch: Vec<u8>,
}

impl<W: Write> StreamWriter<W> {
    /// Wraps `sink` and writes the stream header.
    pub fn new(sink: W) -> Result<Self, Error> {
        let mut sink = BufWriter::new(sink);
        sink.write_all(&StreamHeader::current().encode())
            .map_err(|err| io_error(err, "failed to write stream header"))?;
        Ok(Self {
            sink,
            descriptors: HashMap::new(),
            records_written: 0,
            scratch: Vec::new(),
        })
    }

    pub fn write(&mut self, record: &Record) -> Result<(), Error> {
        let descriptor = record.descriptor();
        self.scratch.clear();
        match self.descriptors.get(descriptor.name()) {
            Some(fingerprint) if *fingerprint == descriptor.fingerprint() => {}
            Some(_) => {
                return Err(Error::new(ErrorKind::Conflict).with_message(format!(
                    "stream already carries a different descriptor named `{}`",
                    descriptor.name()
                )));
            }
            None => {
                frame::write_frame(
                    &codec::encode_descriptor_payload(descriptor),
                    &mut self.scratch,
                )?;
            }
        }
        frame::write_frame(&codec::encode_record_payload(record)?, &mut self.scratch)?;
        self.sink
            .write_all(&self.scratch)
            .map_err(|err| io_error(err, "failed to write record"))?;
        self.descriptors
            .entry(descriptor.name().to_string())
            .or_insert(descriptor.fingerprint());
        self.records_written += 1;
        Ok(())
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        self.sink
            .flush()
            .map_err(|err| io_error(err, "failed to flush record stream"))
    }

    /// Flushes buffered frames and hands back the sink.
    pub fn finish(self) -> Result<W, Error> {
        self.sink.into_inner().map_err(|err| {
            let message = format!("failed to flush record stream: {}", err.error());
            Error::new(ErrorKind::Io)
                .with_message(message)
                .with_source(err.into_error())
        })
    }
}
