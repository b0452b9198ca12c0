//! Protobuf wire decoding against a resolved message descriptor
//!
//! Produces one JSON object per message, keyed by field name. Absent fields
//! follow protobuf presence rules: implicit proto3 scalars take their default,
//! fields with explicit presence become null, repeated fields become empty
//! arrays, and a missing proto2 `required` field is an error.

use crate::schema::proto::{FieldDescriptor, FieldKind, Label, MessageDescriptor, ScalarType};
use chrono::{DateTime, Utc};
use prost::encoding::{decode_key, decode_varint, WireType};
use serde_json::{Map, Number, Value};

pub type DecodeResult<T> = std::result::Result<T, String>;

/// Messages split out of a length-delimited stream
#[derive(Debug)]
pub struct Frames<'a> {
    pub messages: Vec<&'a [u8]>,
    /// Set when a malformed frame ended the stream early
    pub framing_error: Option<String>,
}

/// Split a stream of varint-length-prefixed messages
pub fn split_length_delimited(payload: &[u8]) -> Frames<'_> {
    let mut buf = payload;
    let mut messages = Vec::new();
    let mut framing_error = None;

    while !buf.is_empty() {
        let offset = payload.len() - buf.len();
        let len = match decode_varint(&mut buf) {
            Ok(len) => len as usize,
            Err(e) => {
                framing_error = Some(format!("malformed frame length at byte {}: {}", offset, e));
                break;
            }
        };
        if len > buf.len() {
            framing_error = Some(format!(
                "frame at byte {} declares {} bytes but only {} remain",
                offset,
                len,
                buf.len()
            ));
            break;
        }
        let (message, rest) = buf.split_at(len);
        messages.push(message);
        buf = rest;
    }

    Frames {
        messages,
        framing_error,
    }
}

fn read_varint(buf: &mut &[u8]) -> DecodeResult<u64> {
    decode_varint(buf).map_err(|e| e.to_string())
}

fn read_fixed<const N: usize>(buf: &mut &[u8]) -> DecodeResult<[u8; N]> {
    if buf.len() < N {
        return Err(format!("truncated {}-byte value", N));
    }
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(&buf[..N]);
    *buf = &buf[N..];
    Ok(bytes)
}

fn read_len_delimited<'a>(buf: &mut &'a [u8]) -> DecodeResult<&'a [u8]> {
    let len = read_varint(buf)? as usize;
    if len > buf.len() {
        return Err(format!("length {} exceeds remaining {} bytes", len, buf.len()));
    }
    let (bytes, rest) = buf.split_at(len);
    *buf = rest;
    Ok(bytes)
}

fn skip_field(wire_type: WireType, buf: &mut &[u8]) -> DecodeResult<()> {
    match wire_type {
        WireType::Varint => read_varint(buf).map(|_| ()),
        WireType::SixtyFourBit => read_fixed::<8>(buf).map(|_| ()),
        WireType::ThirtyTwoBit => read_fixed::<4>(buf).map(|_| ()),
        WireType::LengthDelimited => read_len_delimited(buf).map(|_| ()),
        WireType::StartGroup | WireType::EndGroup => Err("groups are not supported".to_string()),
    }
}

fn expected_wire_type(scalar: ScalarType) -> WireType {
    match scalar {
        ScalarType::Double | ScalarType::Fixed64 | ScalarType::SFixed64 => WireType::SixtyFourBit,
        ScalarType::Float | ScalarType::Fixed32 | ScalarType::SFixed32 => WireType::ThirtyTwoBit,
        ScalarType::String | ScalarType::Bytes => WireType::LengthDelimited,
        _ => WireType::Varint,
    }
}

fn float_value(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

fn int64_from_unsigned(value: u64) -> DecodeResult<Value> {
    i64::try_from(value)
        .map(Value::from)
        .map_err(|_| format!("value {} exceeds INT64 range", value))
}

fn decode_scalar(scalar: ScalarType, buf: &mut &[u8]) -> DecodeResult<Value> {
    let value = match scalar {
        ScalarType::Int32 => Value::from(read_varint(buf)? as i32),
        ScalarType::Int64 => Value::from(read_varint(buf)? as i64),
        ScalarType::UInt32 => Value::from(read_varint(buf)? as u32),
        ScalarType::UInt64 => int64_from_unsigned(read_varint(buf)?)?,
        ScalarType::SInt32 => {
            let n = read_varint(buf)? as u32;
            Value::from(((n >> 1) as i32) ^ -((n & 1) as i32))
        }
        ScalarType::SInt64 => {
            let n = read_varint(buf)?;
            Value::from(((n >> 1) as i64) ^ -((n & 1) as i64))
        }
        ScalarType::Bool => Value::Bool(read_varint(buf)? != 0),
        ScalarType::Fixed32 => Value::from(u32::from_le_bytes(read_fixed::<4>(buf)?)),
        ScalarType::SFixed32 => Value::from(i32::from_le_bytes(read_fixed::<4>(buf)?)),
        ScalarType::Fixed64 => int64_from_unsigned(u64::from_le_bytes(read_fixed::<8>(buf)?))?,
        ScalarType::SFixed64 => Value::from(i64::from_le_bytes(read_fixed::<8>(buf)?)),
        ScalarType::Float => float_value(f32::from_le_bytes(read_fixed::<4>(buf)?) as f64),
        ScalarType::Double => float_value(f64::from_le_bytes(read_fixed::<8>(buf)?)),
        ScalarType::String => {
            let bytes = read_len_delimited(buf)?;
            let text =
                std::str::from_utf8(bytes).map_err(|_| "invalid UTF-8 in string".to_string())?;
            Value::String(text.to_string())
        }
        ScalarType::Bytes => Value::String(hex::encode(read_len_delimited(buf)?)),
    };
    Ok(value)
}

fn scalar_default(scalar: ScalarType) -> Value {
    match scalar {
        ScalarType::Double | ScalarType::Float => float_value(0.0),
        ScalarType::Bool => Value::Bool(false),
        ScalarType::String | ScalarType::Bytes => Value::String(String::new()),
        _ => Value::from(0),
    }
}

fn enum_name(values: &std::collections::HashMap<i32, String>, number: i32) -> Value {
    values
        .get(&number)
        .map(|name| Value::String(name.clone()))
        .unwrap_or_else(|| Value::String(number.to_string()))
}

/// Timestamp text both engines parse
fn decode_timestamp(bytes: &[u8]) -> DecodeResult<Value> {
    let mut buf = bytes;
    let mut seconds: i64 = 0;
    let mut nanos: i32 = 0;
    while !buf.is_empty() {
        let (number, wire_type) = decode_key(&mut buf).map_err(|e| e.to_string())?;
        match (number, wire_type) {
            (1, WireType::Varint) => seconds = read_varint(&mut buf)? as i64,
            (2, WireType::Varint) => nanos = read_varint(&mut buf)? as i32,
            (_, other) => skip_field(other, &mut buf)?,
        }
    }
    let nanos = u32::try_from(nanos).map_err(|_| format!("negative timestamp nanos {}", nanos))?;
    let timestamp: DateTime<Utc> = DateTime::from_timestamp(seconds, nanos)
        .ok_or_else(|| format!("timestamp {}s out of range", seconds))?;
    Ok(Value::String(timestamp.format("%Y-%m-%d %H:%M:%S%.6f").to_string()))
}

fn decode_value(kind: &FieldKind, wire_type: WireType, buf: &mut &[u8]) -> DecodeResult<Value> {
    match kind {
        FieldKind::Scalar(scalar) => {
            let expected = expected_wire_type(*scalar);
            if wire_type != expected {
                return Err(format!("wire type {:?} where {:?} was expected", wire_type, expected));
            }
            decode_scalar(*scalar, buf)
        }
        FieldKind::Enum(descriptor) => {
            if wire_type != WireType::Varint {
                return Err(format!("wire type {:?} for enum", wire_type));
            }
            Ok(enum_name(&descriptor.values, read_varint(buf)? as i32))
        }
        FieldKind::Message(descriptor) => {
            if wire_type != WireType::LengthDelimited {
                return Err(format!("wire type {:?} for message", wire_type));
            }
            let bytes = read_len_delimited(buf)?;
            decode_message(bytes, descriptor).map(Value::Object)
        }
        FieldKind::Timestamp => {
            if wire_type != WireType::LengthDelimited {
                return Err(format!("wire type {:?} for timestamp", wire_type));
            }
            decode_timestamp(read_len_delimited(buf)?)
        }
        FieldKind::Map { key, value } => {
            if wire_type != WireType::LengthDelimited {
                return Err(format!("wire type {:?} for map entry", wire_type));
            }
            let mut entry = read_len_delimited(buf)?;
            let mut key_value = Value::Null;
            let mut value_value = Value::Null;
            while !entry.is_empty() {
                let (number, entry_wire) = decode_key(&mut entry).map_err(|e| e.to_string())?;
                match number {
                    1 => {
                        key_value = decode_value(&FieldKind::Scalar(*key), entry_wire, &mut entry)?
                    }
                    2 => value_value = decode_value(value, entry_wire, &mut entry)?,
                    _ => skip_field(entry_wire, &mut entry)?,
                }
            }
            let mut object = Map::new();
            object.insert("key".to_string(), key_value);
            object.insert("value".to_string(), value_value);
            Ok(Value::Object(object))
        }
    }
}

fn packed_scalar(kind: &FieldKind) -> Option<ScalarType> {
    match kind {
        FieldKind::Scalar(scalar) if scalar.is_packable() => Some(*scalar),
        FieldKind::Enum(_) => Some(ScalarType::Int32),
        _ => None,
    }
}

fn decode_field(
    field: &FieldDescriptor,
    wire_type: WireType,
    buf: &mut &[u8],
    out: &mut Map<String, Value>,
) -> DecodeResult<()> {
    if !field.is_repeated() {
        let value = decode_value(&field.kind, wire_type, buf)
            .map_err(|e| format!("field '{}': {}", field.name, e))?;
        out.insert(field.name.clone(), value);
        return Ok(());
    }

    let mut items = Vec::new();
    match packed_scalar(&field.kind) {
        Some(scalar) if wire_type == WireType::LengthDelimited => {
            let mut packed = read_len_delimited(buf)?;
            while !packed.is_empty() {
                let item = decode_scalar(scalar, &mut packed)
                    .map_err(|e| format!("field '{}': {}", field.name, e))?;
                items.push(match &field.kind {
                    FieldKind::Enum(descriptor) => {
                        enum_name(&descriptor.values, item.as_i64().unwrap_or_default() as i32)
                    }
                    _ => item,
                });
            }
        }
        _ => items.push(
            decode_value(&field.kind, wire_type, buf)
                .map_err(|e| format!("field '{}': {}", field.name, e))?,
        ),
    }

    match out
        .entry(field.name.clone())
        .or_insert_with(|| Value::Array(Vec::new()))
    {
        Value::Array(existing) => existing.extend(items),
        other => *other = Value::Array(items),
    }
    Ok(())
}

fn absent_value(field: &FieldDescriptor) -> DecodeResult<Value> {
    if field.is_repeated() {
        return Ok(Value::Array(Vec::new()));
    }
    match (field.label, &field.kind) {
        (Label::Required, _) => Err(format!("missing required field '{}'", field.name)),
        (Label::Implicit, FieldKind::Scalar(scalar)) => Ok(scalar_default(*scalar)),
        (Label::Implicit, FieldKind::Enum(descriptor)) => Ok(enum_name(&descriptor.values, 0)),
        _ => Ok(Value::Null),
    }
}

/// Decode one message into a JSON object
pub fn decode_message(
    data: &[u8],
    descriptor: &MessageDescriptor,
) -> DecodeResult<Map<String, Value>> {
    let mut buf = data;
    let mut out = Map::new();

    while !buf.is_empty() {
        let (number, wire_type) =
            decode_key(&mut buf).map_err(|e| format!("invalid field key: {}", e))?;
        match descriptor.field_by_number(number) {
            Some(field) => decode_field(field, wire_type, &mut buf, &mut out)?,
            None => skip_field(wire_type, &mut buf)
                .map_err(|e| format!("unknown field {}: {}", number, e))?,
        }
    }

    for field in &descriptor.fields {
        if !out.contains_key(&field.name) {
            out.insert(field.name.clone(), absent_value(field)?);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::proto::parse_proto;
    use prost::encoding::{encode_key, encode_varint};
    use serde_json::json;

    const PROTO: &str = r#"
        syntax = "proto3";
        message Event {
            string id = 1;
            int64 count = 2;
            Inner inner = 3;
            repeated int32 codes = 4;
            Kind kind = 5;
            sint64 delta = 6;
            optional string note = 7;
            message Inner { bool flag = 1; double score = 2; }
        }
        enum Kind { KIND_UNSPECIFIED = 0; KIND_CLICK = 1; }
    "#;

    fn put_len(buf: &mut Vec<u8>, tag: u32, bytes: &[u8]) {
        encode_key(tag, WireType::LengthDelimited, buf);
        encode_varint(bytes.len() as u64, buf);
        buf.extend_from_slice(bytes);
    }

    fn put_varint(buf: &mut Vec<u8>, tag: u32, value: u64) {
        encode_key(tag, WireType::Varint, buf);
        encode_varint(value, buf);
    }

    #[test]
    fn test_decode_full_message() {
        let schema = parse_proto(PROTO).unwrap();

        let mut inner = Vec::new();
        put_varint(&mut inner, 1, 1);
        encode_key(2, WireType::SixtyFourBit, &mut inner);
        inner.extend_from_slice(&2.5f64.to_le_bytes());

        let mut packed = Vec::new();
        encode_varint(7, &mut packed);
        encode_varint(9, &mut packed);

        let mut msg = Vec::new();
        put_len(&mut msg, 1, b"evt-1");
        put_varint(&mut msg, 2, 42);
        put_len(&mut msg, 3, &inner);
        put_len(&mut msg, 4, &packed);
        put_varint(&mut msg, 4, 11);
        put_varint(&mut msg, 5, 1);
        put_varint(&mut msg, 6, 3); // zigzag(-2)
        put_varint(&mut msg, 99, 5); // unknown field is skipped

        let decoded = Value::Object(decode_message(&msg, &schema.root).unwrap());
        assert_eq!(
            decoded,
            json!({
                "id": "evt-1",
                "count": 42,
                "inner": {"flag": true, "score": 2.5},
                "codes": [7, 9, 11],
                "kind": "KIND_CLICK",
                "delta": -2,
                "note": null
            })
        );
    }

    #[test]
    fn test_absent_fields_follow_presence_rules() {
        let schema = parse_proto(PROTO).unwrap();
        let decoded = decode_message(&[], &schema.root).unwrap();
        assert_eq!(decoded["id"], json!(""));
        assert_eq!(decoded["count"], json!(0));
        assert_eq!(decoded["inner"], Value::Null);
        assert_eq!(decoded["codes"], json!([]));
        assert_eq!(decoded["kind"], json!("KIND_UNSPECIFIED"));
        assert_eq!(decoded["note"], Value::Null);

        let proto2 =
            parse_proto("syntax = \"proto2\"; message R { required int64 n = 1; }").unwrap();
        assert!(decode_message(&[], &proto2.root).is_err());
    }

    #[test]
    fn test_decode_errors() {
        let schema = parse_proto(PROTO).unwrap();

        let mut bad_utf8 = Vec::new();
        put_len(&mut bad_utf8, 1, &[0xff, 0xfe]);
        assert!(decode_message(&bad_utf8, &schema.root).is_err());

        let mut wrong_wire = Vec::new();
        put_len(&mut wrong_wire, 2, b"x");
        assert!(decode_message(&wrong_wire, &schema.root).is_err());

        let truncated = vec![0x0a, 0x05, b'a'];
        assert!(decode_message(&truncated, &schema.root).is_err());
    }

    #[test]
    fn test_timestamp_field() {
        let schema = parse_proto(
            "syntax = \"proto3\"; message T { google.protobuf.Timestamp at = 1; }",
        )
        .unwrap();
        let mut ts = Vec::new();
        put_varint(&mut ts, 1, 1_700_000_000);
        put_varint(&mut ts, 2, 500_000_000);
        let mut msg = Vec::new();
        put_len(&mut msg, 1, &ts);

        let decoded = decode_message(&msg, &schema.root).unwrap();
        assert_eq!(decoded["at"], json!("2023-11-14 22:13:20.500000"));
    }

    #[test]
    fn test_split_frames() {
        let mut stream = Vec::new();
        for payload in [&b"ab"[..], &b""[..], &b"xyz"[..]] {
            encode_varint(payload.len() as u64, &mut stream);
            stream.extend_from_slice(payload);
        }
        let frames = split_length_delimited(&stream);
        assert_eq!(frames.messages, vec![&b"ab"[..], &b""[..], &b"xyz"[..]]);
        assert!(frames.framing_error.is_none());

        stream.extend_from_slice(&[0x10, 0x01]);
        let frames = split_length_delimited(&stream);
        assert_eq!(frames.messages.len(), 3);
        assert!(frames.framing_error.is_some());
    }
}
