//! Tagged binary codec
//!
//! Every durable value is written as a 16 bit big-endian type tag followed
//! by that kind's payload, recursively, so the format is self-describing:
//! a reader never needs context beyond the tag it just read. Encoders
//! report exact sizes up front and buffers are pre-sized, never grown
//! mid-write.
//!
//! Dispatch is an open registry keyed by tag. The standard kinds are
//! registered in [`default_registry`]; additional kinds can be added to a
//! custom [`CodecRegistry`].

mod node;

use std::collections::HashMap;

use once_cell::sync::Lazy;
use thiserror::Error;

use crate::Value;
use crate::ValueKind;

/// Wire type tag, one 16 bit unit.
pub type Tag = u16;

/// Reserved tag for the absent value.
pub const TAG_NIL: Tag = 0x0000;
/// 32 bit signed integer.
pub const TAG_INT: Tag = 0x0001;
/// 64 bit signed integer.
pub const TAG_LONG: Tag = 0x0002;
/// 32 bit IEEE float.
pub const TAG_FLOAT: Tag = 0x0003;
/// 64 bit IEEE float.
pub const TAG_DOUBLE: Tag = 0x0004;
/// Length-prefixed UTF-16 string.
pub const TAG_STRING: Tag = 0x0005;
/// 256 bit root-block digest.
pub const TAG_DIGEST: Tag = 0x0006;
/// Empty list root.
pub const TAG_LIST_NIL: Tag = 0x0010;
/// Populated list node.
pub const TAG_LIST_NODE: Tag = 0x0011;
/// Empty map root.
pub const TAG_MAP_NIL: Tag = 0x0012;
/// Populated map node.
pub const TAG_MAP_NODE: Tag = 0x0013;

/// Codec failures.
#[derive(Error, Debug)]
pub enum CodecError {
    /// Deserialization met a tag nothing is registered for.
    #[error("unknown type tag: {0:#06x}")]
    UnknownTypeTag(Tag),

    /// A codec is already registered for this tag.
    #[error("type tag already registered: {0:#06x}")]
    DuplicateTag(Tag),

    /// Serialization met a value kind nothing is registered for.
    #[error("no codec registered for kind: {0:?}")]
    KindNotRegistered(ValueKind),

    /// A codec was handed a value of the wrong runtime kind.
    #[error("codec for {expected:?} received a {actual:?} value")]
    KindMismatch {
        /// Kind the codec serves.
        expected: ValueKind,
        /// Kind it was handed.
        actual: ValueKind,
    },

    /// A nested position held a tag of the wrong family.
    #[error("unexpected type tag {0:#06x} at a nested position")]
    UnexpectedTag(Tag),

    /// The buffer ended before the value did.
    #[error("buffer truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Bytes the decoder needed.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// A count or rank field holds an impossible value.
    #[error("invalid length field: {0}")]
    InvalidLength(i64),

    /// String payload is not well-formed UTF-16.
    #[error("string payload is not valid utf-16")]
    InvalidString,

    /// A stored node contradicts itself.
    #[error("inconsistent node field: {0}")]
    InvalidNode(&'static str),
}

/// Growable byte sink with big-endian primitive writes.
///
/// Constructed with the exact capacity reported by
/// [`CodecRegistry::size_of`] so a write never reallocates.
#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    /// A writer pre-sized to `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append a 16 bit unit.
    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Append a 32 bit signed integer.
    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Append a 64 bit signed integer.
    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Append a 32 bit float as its IEEE bits.
    pub fn put_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_bits().to_be_bytes());
    }

    /// Append a 64 bit float as its IEEE bits.
    pub fn put_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_bits().to_be_bytes());
    }

    /// Append raw bytes.
    pub fn put_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// The written bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    /// View of the written bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

/// Cursor over a byte slice with big-endian primitive reads.
#[derive(Debug)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// A reader over `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < needed {
            return Err(CodecError::Truncated {
                needed,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(slice)
    }

    /// Read a 16 bit unit.
    pub fn get_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a 32 bit signed integer.
    pub fn get_i32(&mut self) -> Result<i32, CodecError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a 64 bit signed integer.
    pub fn get_i64(&mut self) -> Result<i64, CodecError> {
        let b = self.take(8)?;
        Ok(i64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Read a 32 bit float from its IEEE bits.
    pub fn get_f32(&mut self) -> Result<f32, CodecError> {
        let b = self.take(4)?;
        Ok(f32::from_bits(u32::from_be_bytes([b[0], b[1], b[2], b[3]])))
    }

    /// Read a 64 bit float from its IEEE bits.
    pub fn get_f64(&mut self) -> Result<f64, CodecError> {
        let b = self.take(8)?;
        Ok(f64::from_bits(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ])))
    }

    /// Read `count` raw bytes.
    pub fn get_bytes(&mut self, count: usize) -> Result<&'a [u8], CodecError> {
        self.take(count)
    }
}

/// One registered value kind: its tag and its size/write/read entry
/// points. `write` emits the tag itself so a codec covering polymorphic
/// variants (an empty versus a populated container) can pick between its
/// tags; `read` is invoked after the tag has been consumed.
#[derive(Clone, Copy)]
pub struct Codec {
    /// Wire tag this entry decodes.
    pub tag: Tag,
    /// Runtime kind this entry encodes.
    pub kind: ValueKind,
    /// Exact encoded length, tag included.
    pub size: fn(&Value, &CodecRegistry) -> Result<usize, CodecError>,
    /// Append tag and payload.
    pub write: fn(&Value, &mut ByteWriter, &CodecRegistry) -> Result<(), CodecError>,
    /// Decode a payload whose tag has been consumed.
    pub read: fn(&mut ByteReader<'_>, &CodecRegistry) -> Result<Value, CodecError>,
}

/// Dispatch table from type tags to codecs.
#[derive(Default)]
pub struct CodecRegistry {
    by_tag: HashMap<Tag, Codec>,
    by_kind: HashMap<ValueKind, Tag>,
}

impl CodecRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every standard kind registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for codec in [
            Codec {
                tag: TAG_NIL,
                kind: ValueKind::Nil,
                size: size_nil,
                write: write_nil,
                read: read_nil,
            },
            Codec {
                tag: TAG_INT,
                kind: ValueKind::Int,
                size: size_int,
                write: write_int,
                read: read_int,
            },
            Codec {
                tag: TAG_LONG,
                kind: ValueKind::Long,
                size: size_long,
                write: write_long,
                read: read_long,
            },
            Codec {
                tag: TAG_FLOAT,
                kind: ValueKind::Float,
                size: size_float,
                write: write_float,
                read: read_float,
            },
            Codec {
                tag: TAG_DOUBLE,
                kind: ValueKind::Double,
                size: size_double,
                write: write_double,
                read: read_double,
            },
            Codec {
                tag: TAG_STRING,
                kind: ValueKind::Str,
                size: size_str,
                write: write_str,
                read: read_str,
            },
            Codec {
                tag: TAG_LIST_NODE,
                kind: ValueKind::List,
                size: node::size_list,
                write: node::write_list,
                read: node::read_list_node,
            },
            Codec {
                tag: TAG_LIST_NIL,
                kind: ValueKind::List,
                size: node::size_list,
                write: node::write_list,
                read: node::read_list_nil,
            },
            Codec {
                tag: TAG_MAP_NODE,
                kind: ValueKind::Map,
                size: node::size_map,
                write: node::write_map,
                read: node::read_map_node,
            },
            Codec {
                tag: TAG_MAP_NIL,
                kind: ValueKind::Map,
                size: node::size_map,
                write: node::write_map,
                read: node::read_map_nil,
            },
        ] {
            // A fresh registry can't hold duplicates
            let _ = registry.register(codec);
        }
        registry
    }

    /// Register a codec; its tag must be unused. The first codec
    /// registered for a kind becomes that kind's writer.
    pub fn register(&mut self, codec: Codec) -> Result<(), CodecError> {
        if self.by_tag.contains_key(&codec.tag) {
            return Err(CodecError::DuplicateTag(codec.tag));
        }
        self.by_kind.entry(codec.kind).or_insert(codec.tag);
        self.by_tag.insert(codec.tag, codec);
        Ok(())
    }

    /// The codec registered for `tag`.
    pub fn codec_for_tag(&self, tag: Tag) -> Result<&Codec, CodecError> {
        self.by_tag.get(&tag).ok_or(CodecError::UnknownTypeTag(tag))
    }

    fn codec_for_kind(&self, kind: ValueKind) -> Result<&Codec, CodecError> {
        self.by_kind
            .get(&kind)
            .and_then(|tag| self.by_tag.get(tag))
            .ok_or(CodecError::KindNotRegistered(kind))
    }

    /// Exact number of bytes [`CodecRegistry::write`] will produce for
    /// `value`.
    pub fn size_of(&self, value: &Value) -> Result<usize, CodecError> {
        let codec = self.codec_for_kind(value.kind())?;
        (codec.size)(value, self)
    }

    /// Append `value`, tag first, to `writer`.
    pub fn write(&self, value: &Value, writer: &mut ByteWriter) -> Result<(), CodecError> {
        let codec = self.codec_for_kind(value.kind())?;
        (codec.write)(value, writer, self)
    }

    /// Read one tagged value.
    pub fn read_value(&self, reader: &mut ByteReader<'_>) -> Result<Value, CodecError> {
        let tag = reader.get_u16()?;
        let codec = self.codec_for_tag(tag)?;
        (codec.read)(reader, self)
    }
}

static DEFAULT: Lazy<CodecRegistry> = Lazy::new(CodecRegistry::with_defaults);

/// The process-wide registry holding the standard kinds.
pub fn default_registry() -> &'static CodecRegistry {
    &DEFAULT
}

fn kind_mismatch(expected: ValueKind, value: &Value) -> CodecError {
    CodecError::KindMismatch {
        expected,
        actual: value.kind(),
    }
}

fn size_nil(_: &Value, _: &CodecRegistry) -> Result<usize, CodecError> {
    Ok(2)
}

fn write_nil(value: &Value, writer: &mut ByteWriter, _: &CodecRegistry) -> Result<(), CodecError> {
    match value {
        Value::Nil => {
            writer.put_u16(TAG_NIL);
            Ok(())
        }
        other => Err(kind_mismatch(ValueKind::Nil, other)),
    }
}

fn read_nil(_: &mut ByteReader<'_>, _: &CodecRegistry) -> Result<Value, CodecError> {
    Ok(Value::Nil)
}

fn size_int(_: &Value, _: &CodecRegistry) -> Result<usize, CodecError> {
    Ok(2 + 4)
}

fn write_int(value: &Value, writer: &mut ByteWriter, _: &CodecRegistry) -> Result<(), CodecError> {
    match value {
        Value::Int(v) => {
            writer.put_u16(TAG_INT);
            writer.put_i32(*v);
            Ok(())
        }
        other => Err(kind_mismatch(ValueKind::Int, other)),
    }
}

fn read_int(reader: &mut ByteReader<'_>, _: &CodecRegistry) -> Result<Value, CodecError> {
    Ok(Value::Int(reader.get_i32()?))
}

fn size_long(_: &Value, _: &CodecRegistry) -> Result<usize, CodecError> {
    Ok(2 + 8)
}

fn write_long(value: &Value, writer: &mut ByteWriter, _: &CodecRegistry) -> Result<(), CodecError> {
    match value {
        Value::Long(v) => {
            writer.put_u16(TAG_LONG);
            writer.put_i64(*v);
            Ok(())
        }
        other => Err(kind_mismatch(ValueKind::Long, other)),
    }
}

fn read_long(reader: &mut ByteReader<'_>, _: &CodecRegistry) -> Result<Value, CodecError> {
    Ok(Value::Long(reader.get_i64()?))
}

fn size_float(_: &Value, _: &CodecRegistry) -> Result<usize, CodecError> {
    Ok(2 + 4)
}

fn write_float(
    value: &Value,
    writer: &mut ByteWriter,
    _: &CodecRegistry,
) -> Result<(), CodecError> {
    match value {
        Value::Float(v) => {
            writer.put_u16(TAG_FLOAT);
            writer.put_f32(*v);
            Ok(())
        }
        other => Err(kind_mismatch(ValueKind::Float, other)),
    }
}

fn read_float(reader: &mut ByteReader<'_>, _: &CodecRegistry) -> Result<Value, CodecError> {
    Ok(Value::Float(reader.get_f32()?))
}

fn size_double(_: &Value, _: &CodecRegistry) -> Result<usize, CodecError> {
    Ok(2 + 8)
}

fn write_double(
    value: &Value,
    writer: &mut ByteWriter,
    _: &CodecRegistry,
) -> Result<(), CodecError> {
    match value {
        Value::Double(v) => {
            writer.put_u16(TAG_DOUBLE);
            writer.put_f64(*v);
            Ok(())
        }
        other => Err(kind_mismatch(ValueKind::Double, other)),
    }
}

fn read_double(reader: &mut ByteReader<'_>, _: &CodecRegistry) -> Result<Value, CodecError> {
    Ok(Value::Double(reader.get_f64()?))
}

fn size_str(value: &Value, _: &CodecRegistry) -> Result<usize, CodecError> {
    match value {
        Value::Str(s) => Ok(2 + 4 + s.encode_utf16().count() * 2),
        other => Err(kind_mismatch(ValueKind::Str, other)),
    }
}

fn write_str(value: &Value, writer: &mut ByteWriter, _: &CodecRegistry) -> Result<(), CodecError> {
    match value {
        Value::Str(s) => {
            writer.put_u16(TAG_STRING);
            writer.put_i32(s.encode_utf16().count() as i32);
            for unit in s.encode_utf16() {
                writer.put_u16(unit);
            }
            Ok(())
        }
        other => Err(kind_mismatch(ValueKind::Str, other)),
    }
}

fn read_str(reader: &mut ByteReader<'_>, _: &CodecRegistry) -> Result<Value, CodecError> {
    let count = reader.get_i32()?;
    if count < 0 {
        return Err(CodecError::InvalidLength(count as i64));
    }
    let mut units = Vec::with_capacity(count as usize);
    for _ in 0..count {
        units.push(reader.get_u16()?);
    }
    let s = String::from_utf16(&units).map_err(|_| CodecError::InvalidString)?;
    Ok(Value::from(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::VersionedList;
    use crate::tree::VersionedMap;
    use crate::tree::TIME_MAX;

    fn round_trip(value: &Value) -> Value {
        let registry = default_registry();
        let size = registry.size_of(value).expect("sizes");
        let mut writer = ByteWriter::with_capacity(size);
        registry.write(value, &mut writer).expect("writes");
        assert_eq!(writer.len(), size, "size_of must match bytes written");
        let bytes = writer.into_vec();
        let mut reader = ByteReader::new(&bytes);
        let back = registry.read_value(&mut reader).expect("reads");
        assert_eq!(reader.remaining(), 0, "value must consume its bytes");
        back
    }

    #[test]
    fn it_round_trips_scalars() {
        for value in [
            Value::Nil,
            Value::from(0),
            Value::from(i32::MIN),
            Value::from(i64::MAX),
            Value::from(-1.25f32),
            Value::from(6.02e23f64),
            Value::from(""),
            Value::from("plain"),
            Value::from("smile \u{1F600} and beyond"),
        ] {
            assert_eq!(round_trip(&value), value);
        }
    }

    #[test]
    fn it_round_trips_empty_containers() {
        assert_eq!(
            round_trip(&Value::List(VersionedList::new())),
            Value::List(VersionedList::new())
        );
        assert_eq!(
            round_trip(&Value::Map(VersionedMap::new())),
            Value::Map(VersionedMap::new())
        );
    }

    #[test]
    fn it_round_trips_a_versioned_list() {
        let list = VersionedList::new()
            .add(Value::from("a"), 1)
            .add(Value::from(2), 2)
            .add(Value::Nil, 3)
            .remove(1, 9);
        let back = round_trip(&Value::List(list.clone()));
        let Value::List(back) = back else {
            panic!("expected a list");
        };
        assert_eq!(back, list);
        assert_eq!(back.entry(1).unwrap().deleted_at, 9);
        assert_eq!(back.size(5), 3);
    }

    #[test]
    fn it_round_trips_a_versioned_map() {
        let map = VersionedMap::new()
            .set(&Value::from("x"), Value::from("hi"), 10)
            .set(&Value::from("y"), Value::from(42), 20)
            .set(&Value::from("x"), Value::from("ho"), 30);
        let back = round_trip(&Value::Map(map.clone()));
        let Value::Map(back) = back else {
            panic!("expected a map");
        };
        assert_eq!(back, map);
        assert_eq!(back.get(&Value::from("x"), TIME_MAX), Some(Value::from("ho")));
        assert_eq!(back.get(&Value::from("x"), 15), Some(Value::from("hi")));
    }

    #[test]
    fn it_round_trips_nested_containers() {
        let inner = VersionedList::new().add(Value::from("deep"), 1);
        let map = VersionedMap::new().set(&Value::from("k"), Value::List(inner), 5);
        assert_eq!(round_trip(&Value::Map(map.clone())), Value::Map(map));
    }

    #[test]
    fn it_rejects_unknown_tags() {
        let mut writer = ByteWriter::with_capacity(2);
        writer.put_u16(0x7777);
        let bytes = writer.into_vec();
        let mut reader = ByteReader::new(&bytes);
        let err = default_registry().read_value(&mut reader).unwrap_err();
        assert!(matches!(err, CodecError::UnknownTypeTag(0x7777)));
    }

    #[test]
    fn it_rejects_duplicate_registration() {
        let mut registry = CodecRegistry::with_defaults();
        let err = registry
            .register(Codec {
                tag: TAG_INT,
                kind: ValueKind::Int,
                size: size_int,
                write: write_int,
                read: read_int,
            })
            .unwrap_err();
        assert!(matches!(err, CodecError::DuplicateTag(TAG_INT)));
    }

    #[test]
    fn it_rejects_truncated_buffers() {
        let registry = default_registry();
        let mut writer = ByteWriter::default();
        registry
            .write(&Value::from("truncate me"), &mut writer)
            .expect("writes");
        let bytes = writer.into_vec();
        let mut reader = ByteReader::new(&bytes[..bytes.len() - 3]);
        let err = registry.read_value(&mut reader).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }
}
