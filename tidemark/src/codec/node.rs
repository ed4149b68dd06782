//! Tree node codecs
//!
//! Node layout after the tag: `i32 level`, `i64 total_size`,
//! `i64 created_at`, `i64 deleted_at`, left subtree, right subtree,
//! payload. Empty subtrees get their own nil tags so a reader never
//! inspects anything but the tag. Map payloads are a tagged key followed
//! by the tagged root of the key's history list.

use super::ByteReader;
use super::ByteWriter;
use super::CodecError;
use super::CodecRegistry;
use super::TAG_LIST_NIL;
use super::TAG_LIST_NODE;
use super::TAG_MAP_NIL;
use super::TAG_MAP_NODE;
use crate::tree::map::KeyPair;
use crate::tree::node::Tree;
use crate::tree::VersionedList;
use crate::tree::VersionedMap;
use crate::Value;
use crate::ValueKind;

// Tag plus the four fixed node fields.
const NODE_PREFIX: usize = 2 + 4 + 8 + 8 + 8;

pub(super) fn size_list(value: &Value, registry: &CodecRegistry) -> Result<usize, CodecError> {
    match value {
        Value::List(list) => size_list_tree(list.root(), registry),
        other => Err(super::kind_mismatch(ValueKind::List, other)),
    }
}

pub(super) fn write_list(
    value: &Value,
    writer: &mut ByteWriter,
    registry: &CodecRegistry,
) -> Result<(), CodecError> {
    match value {
        Value::List(list) => write_list_tree(list.root(), writer, registry),
        other => Err(super::kind_mismatch(ValueKind::List, other)),
    }
}

pub(super) fn read_list_nil(
    _: &mut ByteReader<'_>,
    _: &CodecRegistry,
) -> Result<Value, CodecError> {
    Ok(Value::List(VersionedList::new()))
}

pub(super) fn read_list_node(
    reader: &mut ByteReader<'_>,
    registry: &CodecRegistry,
) -> Result<Value, CodecError> {
    let tree = read_list_fields(reader, registry)?;
    Ok(Value::List(VersionedList::from_root(tree)))
}

pub(super) fn size_map(value: &Value, registry: &CodecRegistry) -> Result<usize, CodecError> {
    match value {
        Value::Map(map) => size_map_tree(map.root(), registry),
        other => Err(super::kind_mismatch(ValueKind::Map, other)),
    }
}

pub(super) fn write_map(
    value: &Value,
    writer: &mut ByteWriter,
    registry: &CodecRegistry,
) -> Result<(), CodecError> {
    match value {
        Value::Map(map) => write_map_tree(map.root(), writer, registry),
        other => Err(super::kind_mismatch(ValueKind::Map, other)),
    }
}

pub(super) fn read_map_nil(
    _: &mut ByteReader<'_>,
    _: &CodecRegistry,
) -> Result<Value, CodecError> {
    Ok(Value::Map(VersionedMap::new()))
}

pub(super) fn read_map_node(
    reader: &mut ByteReader<'_>,
    registry: &CodecRegistry,
) -> Result<Value, CodecError> {
    let tree = read_map_fields(reader, registry)?;
    Ok(Value::Map(VersionedMap::from_root(tree)))
}

fn size_list_tree(tree: &Tree<Value>, registry: &CodecRegistry) -> Result<usize, CodecError> {
    match tree.node() {
        None => Ok(2),
        Some(node) => Ok(NODE_PREFIX
            + size_list_tree(&node.left, registry)?
            + size_list_tree(&node.right, registry)?
            + registry.size_of(&node.payload)?),
    }
}

fn write_list_tree(
    tree: &Tree<Value>,
    writer: &mut ByteWriter,
    registry: &CodecRegistry,
) -> Result<(), CodecError> {
    match tree.node() {
        None => {
            writer.put_u16(TAG_LIST_NIL);
            Ok(())
        }
        Some(node) => {
            writer.put_u16(TAG_LIST_NODE);
            write_node_fields(writer, node.level, node.total_size, node.created_at, node.deleted_at);
            write_list_tree(&node.left, writer, registry)?;
            write_list_tree(&node.right, writer, registry)?;
            registry.write(&node.payload, writer)
        }
    }
}

fn read_list_tree(
    reader: &mut ByteReader<'_>,
    registry: &CodecRegistry,
) -> Result<Tree<Value>, CodecError> {
    match reader.get_u16()? {
        TAG_LIST_NIL => Ok(Tree::nil()),
        TAG_LIST_NODE => read_list_fields(reader, registry),
        tag => Err(CodecError::UnexpectedTag(tag)),
    }
}

fn read_list_fields(
    reader: &mut ByteReader<'_>,
    registry: &CodecRegistry,
) -> Result<Tree<Value>, CodecError> {
    let (level, total_size, created_at, deleted_at) = read_node_fields(reader)?;
    let left = read_list_tree(reader, registry)?;
    let right = read_list_tree(reader, registry)?;
    let payload = registry.read_value(reader)?;
    if total_size != 1 + left.total_size() + right.total_size() {
        return Err(CodecError::InvalidNode("total_size"));
    }
    Ok(Tree::from_parts(
        level, total_size, created_at, deleted_at, left, right, payload,
    ))
}

fn size_map_tree(tree: &Tree<KeyPair>, registry: &CodecRegistry) -> Result<usize, CodecError> {
    match tree.node() {
        None => Ok(2),
        Some(node) => Ok(NODE_PREFIX
            + size_map_tree(&node.left, registry)?
            + size_map_tree(&node.right, registry)?
            + registry.size_of(&node.payload.key)?
            + size_list_tree(&node.payload.history, registry)?),
    }
}

fn write_map_tree(
    tree: &Tree<KeyPair>,
    writer: &mut ByteWriter,
    registry: &CodecRegistry,
) -> Result<(), CodecError> {
    match tree.node() {
        None => {
            writer.put_u16(TAG_MAP_NIL);
            Ok(())
        }
        Some(node) => {
            writer.put_u16(TAG_MAP_NODE);
            write_node_fields(writer, node.level, node.total_size, node.created_at, node.deleted_at);
            write_map_tree(&node.left, writer, registry)?;
            write_map_tree(&node.right, writer, registry)?;
            registry.write(&node.payload.key, writer)?;
            write_list_tree(&node.payload.history, writer, registry)
        }
    }
}

fn read_map_tree(
    reader: &mut ByteReader<'_>,
    registry: &CodecRegistry,
) -> Result<Tree<KeyPair>, CodecError> {
    match reader.get_u16()? {
        TAG_MAP_NIL => Ok(Tree::nil()),
        TAG_MAP_NODE => read_map_fields(reader, registry),
        tag => Err(CodecError::UnexpectedTag(tag)),
    }
}

fn read_map_fields(
    reader: &mut ByteReader<'_>,
    registry: &CodecRegistry,
) -> Result<Tree<KeyPair>, CodecError> {
    let (level, total_size, created_at, deleted_at) = read_node_fields(reader)?;
    let left = read_map_tree(reader, registry)?;
    let right = read_map_tree(reader, registry)?;
    let key = registry.read_value(reader)?;
    let history = read_list_tree(reader, registry)?;
    if total_size != 1 + left.total_size() + right.total_size() {
        return Err(CodecError::InvalidNode("total_size"));
    }
    Ok(Tree::from_parts(
        level,
        total_size,
        created_at,
        deleted_at,
        left,
        right,
        KeyPair { key, history },
    ))
}

fn write_node_fields(
    writer: &mut ByteWriter,
    level: u32,
    total_size: u64,
    created_at: i64,
    deleted_at: i64,
) {
    writer.put_i32(level as i32);
    writer.put_i64(total_size as i64);
    writer.put_i64(created_at);
    writer.put_i64(deleted_at);
}

fn read_node_fields(reader: &mut ByteReader<'_>) -> Result<(u32, u64, i64, i64), CodecError> {
    let level = reader.get_i32()?;
    if level < 1 {
        return Err(CodecError::InvalidLength(level as i64));
    }
    let total_size = reader.get_i64()?;
    if total_size < 1 {
        return Err(CodecError::InvalidLength(total_size));
    }
    let created_at = reader.get_i64()?;
    let deleted_at = reader.get_i64()?;
    Ok((level as u32, total_size as u64, created_at, deleted_at))
}
