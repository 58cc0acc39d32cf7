//! Purpose: Encode and decode descriptor and record payloads carried inside frames.
//! Exports: `Frame`, `encode`, `decode`, `encode_descriptor_payload`, `encode_record_payload`, `decode_payload`.
//! Role: Byte-level contract between writers and readers; the stream layer adds I/O on top.
//! Invariants: Records reference descriptors by name + fingerprint; readers resolve via `Registry`.
//! Invariants: Decoding never yields a record whose fields differ from its descriptor.
//! Invariants: Any malformed byte is `Corrupt`; an unknown descriptor name is `NotFound`.
use time::OffsetDateTime;

use crate::core::error::{Error, ErrorKind};
use crate::core::frame::{self, FrameKind};
use crate::core::record::Record;
use crate::core::schema::{Descriptor, FieldDescriptor, Registry};
use crate::core::value::{FieldType, Value};
use crate::core::varint;

const NULL_TAG: u8 = 0;
const META_SOURCE: u8 = 0b01;
const META_GENERATED: u8 = 0b10;

#[derive(Debug)]
pub enum Frame {
    Descriptor(Descriptor),
    Record(Record),
}

/// Self-describing bytes for one record: its descriptor frame, then the record frame.
pub fn encode(record: &Record) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    frame::write_frame(&encode_descriptor_payload(record.descriptor()), &mut out)?;
    frame::write_frame(&encode_record_payload(record)?, &mut out)?;
    Ok(out)
}

/// Decodes the next record from `cursor`, defining any descriptors met on the way.
///
/// Returns `Ok(None)` only when the cursor is exhausted at a frame boundary.
pub fn decode(cursor: &mut &[u8], registry: &Registry) -> Result<Option<Record>, Error> {
    while let Some(payload) = frame::split_frame(cursor)? {
        if let Frame::Record(record) = decode_payload(payload, registry)? {
            return Ok(Some(record));
        }
    }
    Ok(None)
}

pub fn encode_descriptor_payload(descriptor: &Descriptor) -> Vec<u8> {
    let mut out = vec![FrameKind::Descriptor as u8];
    put_str(descriptor.name(), &mut out);
    varint::encode_u64(descriptor.fields().len() as u64, &mut out);
    for field in descriptor.fields() {
        put_str(field.ty.name(), &mut out);
        put_str(&field.name, &mut out);
    }
    out
}

pub fn encode_record_payload(record: &Record) -> Result<Vec<u8>, Error> {
    let descriptor = record.descriptor();
    let mut out = vec![FrameKind::Record as u8];
    put_str(descriptor.name(), &mut out);
    out.extend_from_slice(&descriptor.fingerprint().to_le_bytes());

    let mut flags = 0u8;
    if record.source().is_some() {
        flags |= META_SOURCE;
    }
    if record.generated().is_some() {
        flags |= META_GENERATED;
    }
    out.push(flags);
    if let Some(source) = record.source() {
        put_str(source, &mut out);
    }
    if let Some(generated) = record.generated() {
        varint::encode_i64(datetime_nanos(&generated)?, &mut out);
    }

    varint::encode_u64(record.values().len() as u64, &mut out);
    for value in record.values() {
        put_value(value, &mut out)?;
    }
    Ok(out)
}

pub fn decode_payload(payload: &[u8], registry: &Registry) -> Result<Frame, Error> {
    let mut cursor = payload;
    let kind = FrameKind::from_u8(take_u8(&mut cursor)?)?;
    let frame = match kind {
        FrameKind::Descriptor => Frame::Descriptor(decode_descriptor(&mut cursor, registry)?),
        FrameKind::Record => Frame::Record(decode_record(&mut cursor, registry)?),
    };
    if !cursor.is_empty() {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message(format!("{} trailing bytes in frame payload", cursor.len())));
    }
    Ok(frame)
}

fn decode_descriptor(cursor: &mut &[u8], registry: &Registry) -> Result<Descriptor, Error> {
    let name = take_string(cursor)?;
    let count = take_count(cursor, 2)?;
    let mut fields = Vec::with_capacity(count);
    for _ in 0..count {
        let ty = take_string(cursor)?;
        let field = take_string(cursor)?;
        let ty = FieldType::parse(&ty).map_err(|err| corrupt_descriptor(&name, err))?;
        fields.push(FieldDescriptor { ty, name: field });
    }
    let descriptor =
        Descriptor::from_fields(&name, fields).map_err(|err| corrupt_descriptor(&name, err))?;
    registry.insert(descriptor)
}

fn corrupt_descriptor(name: &str, err: Error) -> Error {
    Error::new(ErrorKind::Corrupt)
        .with_message(format!("invalid descriptor frame for `{name}`"))
        .with_source(err)
}

fn decode_record(cursor: &mut &[u8], registry: &Registry) -> Result<Record, Error> {
    let name = take_string(cursor)?;
    let fingerprint = u32::from_le_bytes(take_array::<4>(cursor)?);
    let descriptor = registry.lookup(&name).map_err(|err| {
        err.with_hint("The stream references a descriptor that was never defined in it.")
    })?;
    if descriptor.fingerprint() != fingerprint {
        return Err(Error::new(ErrorKind::Corrupt).with_message(format!(
            "record fingerprint {fingerprint:08x} does not match descriptor `{name}` ({:08x})",
            descriptor.fingerprint()
        )));
    }

    let flags = take_u8(cursor)?;
    if flags & !(META_SOURCE | META_GENERATED) != 0 {
        return Err(Error::new(ErrorKind::Corrupt).with_message("unknown record metadata flags"));
    }
    let source = if flags & META_SOURCE != 0 {
        Some(take_string(cursor)?)
    } else {
        None
    };
    let generated = if flags & META_GENERATED != 0 {
        Some(nanos_datetime(varint::decode_i64(cursor)?)?)
    } else {
        None
    };

    let count = take_count(cursor, 1)?;
    if count != descriptor.fields().len() {
        return Err(Error::new(ErrorKind::Corrupt).with_message(format!(
            "record has {count} values but descriptor `{name}` has {} fields",
            descriptor.fields().len()
        )));
    }
    let mut values = Vec::with_capacity(count);
    for field in descriptor.fields() {
        values.push(take_value(cursor, field)?);
    }

    let mut record = Record::from_values(&descriptor, values)?;
    if let Some(source) = source {
        record = record.with_source(source);
    }
    if let Some(generated) = generated {
        record = record.with_generated(generated);
    }
    Ok(record)
}

fn put_value(value: &Value, out: &mut Vec<u8>) -> Result<(), Error> {
    let Some(ty) = value.field_type() else {
        out.push(NULL_TAG);
        return Ok(());
    };
    out.push(ty.code());
    match value {
        Value::Null => {}
        Value::String(s) => put_str(s, out),
        Value::Varint(n) => varint::encode_i64(*n, out),
        Value::Uint32(n) => varint::encode_u64(u64::from(*n), out),
        Value::Float(n) => out.extend_from_slice(&n.to_le_bytes()),
        Value::Boolean(b) => out.push(u8::from(*b)),
        Value::Bytes(bytes) => put_bytes(bytes, out),
        Value::Datetime(dt) => varint::encode_i64(datetime_nanos(dt)?, out),
    }
    Ok(())
}

fn take_value(cursor: &mut &[u8], field: &FieldDescriptor) -> Result<Value, Error> {
    let tag = take_u8(cursor)?;
    if tag == NULL_TAG {
        return Ok(Value::Null);
    }
    if FieldType::from_code(tag) != Some(field.ty) {
        return Err(Error::new(ErrorKind::Corrupt).with_message(format!(
            "value tag {tag} does not match {} field `{}`",
            field.ty, field.name
        )));
    }
    let value = match field.ty {
        FieldType::String => Value::String(take_string(cursor)?),
        FieldType::Varint => Value::Varint(varint::decode_i64(cursor)?),
        FieldType::Uint32 => {
            let raw = varint::decode_u64(cursor)?;
            let n = u32::try_from(raw).map_err(|_| {
                Error::new(ErrorKind::Corrupt).with_message("uint32 value out of range")
            })?;
            Value::Uint32(n)
        }
        FieldType::Float => Value::Float(f64::from_le_bytes(take_array::<8>(cursor)?)),
        FieldType::Boolean => match take_u8(cursor)? {
            0 => Value::Boolean(false),
            1 => Value::Boolean(true),
            other => {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message(format!("invalid boolean byte {other}")));
            }
        },
        FieldType::Bytes => Value::Bytes(take_bytes(cursor)?.to_vec()),
        FieldType::Datetime => Value::Datetime(nanos_datetime(varint::decode_i64(cursor)?)?),
    };
    Ok(value)
}

fn datetime_nanos(dt: &OffsetDateTime) -> Result<i64, Error> {
    i64::try_from(dt.unix_timestamp_nanos()).map_err(|_| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("datetime {dt} is outside the encodable range"))
    })
}

fn nanos_datetime(nanos: i64) -> Result<OffsetDateTime, Error> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos)).map_err(|err| {
        Error::new(ErrorKind::Corrupt)
            .with_message("datetime out of range")
            .with_source(err)
    })
}

fn put_str(value: &str, out: &mut Vec<u8>) {
    put_bytes(value.as_bytes(), out);
}

fn put_bytes(value: &[u8], out: &mut Vec<u8>) {
    varint::encode_u64(value.len() as u64, out);
    out.extend_from_slice(value);
}

fn take_u8(cursor: &mut &[u8]) -> Result<u8, Error> {
    let [byte] = take_array::<1>(cursor)?;
    Ok(byte)
}

fn take_array<const N: usize>(cursor: &mut &[u8]) -> Result<[u8; N], Error> {
    let bytes = take_slice(cursor, N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

fn take_slice<'a>(cursor: &mut &'a [u8], len: usize) -> Result<&'a [u8], Error> {
    if cursor.len() < len {
        return Err(Error::new(ErrorKind::Corrupt).with_message("truncated frame payload"));
    }
    let (head, tail) = cursor.split_at(len);
    *cursor = tail;
    Ok(head)
}

fn take_bytes<'a>(cursor: &mut &'a [u8]) -> Result<&'a [u8], Error> {
    let len = varint::decode_u64(cursor)?;
    let len = usize::try_from(len)
        .map_err(|_| Error::new(ErrorKind::Corrupt).with_message("bad length prefix"))?;
    take_slice(cursor, len)
}

fn take_string(cursor: &mut &[u8]) -> Result<String, Error> {
    let bytes = take_bytes(cursor)?;
    String::from_utf8(bytes.to_vec()).map_err(|err| {
        Error::new(ErrorKind::Corrupt)
            .with_message("invalid utf-8 in string")
            .with_source(err)
    })
}

/// Reads an element count, bounded by the bytes left so a bad prefix cannot over-allocate.
fn take_count(cursor: &mut &[u8], min_elem_len: usize) -> Result<usize, Error> {
    let count = varint::decode_u64(cursor)?;
    match usize::try_from(count) {
        Ok(count) if count.saturating_mul(min_elem_len) <= cursor.len() => Ok(count),
        _ => Err(Error::new(ErrorKind::Corrupt).with_message("bad length prefix")),
    }
}

#[cfg(test)]
mod tests {
    use super::{Frame, decode, decode_payload, encode, encode_record_payload};
    use crate::core::error::ErrorKind;
    use crate::core::frame;
    use crate::core::record::Record;
    use crate::core::schema::{Descriptor, Registry};
    use crate::core::value::Value;
    use time::macros::datetime;

    fn all_types() -> Descriptor {
        Descriptor::new(
            "test/all_types",
            [
                ("string", "s"),
                ("varint", "v"),
                ("uint32", "u"),
                ("float", "f"),
                ("boolean", "b"),
                ("bytes", "raw"),
                ("datetime", "ts"),
            ],
        )
        .expect("descriptor")
    }

    fn sample() -> Record {
        Record::from_values(
            &all_types(),
            vec![
                Value::from("héllo"),
                Value::Varint(-987_654_321),
                Value::Uint32(u32::MAX),
                Value::Float(-0.5),
                Value::Boolean(true),
                Value::Bytes(vec![0, 1, 2, 255]),
                Value::Datetime(datetime!(2023-06-01 12:30:45.123456789 UTC)),
            ],
        )
        .expect("record")
        .with_source("unit-test")
        .with_generated(datetime!(2024-02-29 00:00 UTC))
    }

    #[test]
    fn decode_reverses_encode_into_fresh_registry() {
        let record = sample();
        let bytes = encode(&record).expect("encode");
        let registry = Registry::new();
        let mut cursor = bytes.as_slice();
        let decoded = decode(&mut cursor, &registry).expect("decode").expect("record");
        assert_eq!(decoded, record);
        assert_eq!(decoded.source(), Some("unit-test"));
        assert_eq!(decoded.generated(), record.generated());
        assert!(decode(&mut cursor, &registry).expect("end").is_none());
        assert!(registry.lookup("test/all_types").is_ok());
    }

    #[test]
    fn nulls_survive_encoding() {
        let record = Record::new(&all_types(), [("v", 1)]).expect("record");
        let bytes = encode(&record).unwrap();
        let decoded = decode(&mut bytes.as_slice(), &Registry::new()).unwrap().unwrap();
        assert_eq!(decoded.get("s"), Some(&Value::Null));
        assert_eq!(decoded, record);
    }

    #[test]
    fn nan_float_round_trips_equal() {
        let record = Record::new(&all_types(), [("f", f64::NAN)]).expect("record");
        let bytes = encode(&record).unwrap();
        let decoded = decode(&mut bytes.as_slice(), &Registry::new()).unwrap().unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn empty_cursor_is_end_of_stream() {
        let mut cursor: &[u8] = &[];
        assert!(decode(&mut cursor, &Registry::new()).unwrap().is_none());
    }

    #[test]
    fn record_without_descriptor_is_not_found() {
        let payload = encode_record_payload(&sample()).unwrap();
        let mut bytes = Vec::new();
        frame::write_frame(&payload, &mut bytes).unwrap();
        let err = decode(&mut bytes.as_slice(), &Registry::new()).expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn fingerprint_mismatch_is_corrupt() {
        let registry = Registry::new();
        registry.insert(all_types()).unwrap();
        let mut payload = encode_record_payload(&sample()).unwrap();
        let name_len = 1 + 1 + "test/all_types".len();
        payload[name_len] ^= 0xFF;
        let err = decode_payload(&payload, &registry).expect_err("fingerprint");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn truncated_payload_is_corrupt() {
        let registry = Registry::new();
        registry.insert(all_types()).unwrap();
        let payload = encode_record_payload(&sample()).unwrap();
        for cut in [1, payload.len() / 2, payload.len() - 1] {
            let err = decode_payload(&payload[..cut], &registry).expect_err("truncated");
            assert_eq!(err.kind(), ErrorKind::Corrupt, "cut at {cut}");
        }
    }

    #[test]
    fn trailing_bytes_are_corrupt() {
        let registry = Registry::new();
        registry.insert(all_types()).unwrap();
        let mut payload = encode_record_payload(&sample()).unwrap();
        payload.push(0);
        let err = decode_payload(&payload, &registry).expect_err("trailing");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn descriptor_frame_defines_on_first_sight() {
        let registry = Registry::new();
        let bytes = encode(&sample()).unwrap();
        let mut cursor = bytes.as_slice();
        let payload = frame::split_frame(&mut cursor).unwrap().unwrap();
        match decode_payload(payload, &registry).unwrap() {
            Frame::Descriptor(descriptor) => {
                assert!(registry.lookup("test/all_types").unwrap().ptr_eq(&descriptor));
            }
            other => panic!("expected descriptor frame, got {other:?}"),
        }
    }

    #[test]
    fn conflicting_descriptor_frame_is_reported() {
        let registry = Registry::new();
        registry.define("test/all_types", [("string", "s")]).unwrap();
        let bytes = encode(&sample()).unwrap();
        let err = decode(&mut bytes.as_slice(), &registry).expect_err("conflict");
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }
}
