//! Root block layout
//!
//! ```text
//! [i32 max_block_size][i32 block_size][u16 digest tag][32 byte digest]
//! [i64 timestamp][space ledger][tagged map root]
//! ```
//!
//! `block_size` counts the whole block, headers included. The digest
//! covers everything after itself. A slot that fails the size or digest
//! checks is reported as locally-recoverable; content that decodes to the
//! wrong shape after a valid digest is a format mismatch and fatal.

use crate::codec::ByteReader;
use crate::codec::ByteWriter;
use crate::codec::CodecError;
use crate::codec::CodecRegistry;
use crate::codec::TAG_DIGEST;
use crate::store::checksum::Digest;
use crate::store::SpaceManager;
use crate::store::StoreError;
use crate::tree::Timestamp;
use crate::tree::VersionedMap;
use crate::Value;
use crate::ValueKind;

/// Fixed bytes before the checksummed content.
pub(crate) const HEADER_LEN: usize = 4 + 4 + 2 + Digest::LEN;

/// Smallest usable `max_block_size`: header, timestamp, empty ledger and
/// an empty map root.
pub(crate) const MIN_BLOCK_SIZE: u32 = (HEADER_LEN + 8 + 12 + 2) as u32;

#[derive(Debug)]
pub(crate) struct RootBlock {
    pub(crate) timestamp: Timestamp,
    pub(crate) space: SpaceManager,
    pub(crate) root: VersionedMap,
}

/// Serialize one root block: timestamp, ledger and map root behind the
/// size headers and digest.
pub(crate) fn encode_root(
    timestamp: Timestamp,
    space: &SpaceManager,
    root: &VersionedMap,
    registry: &CodecRegistry,
    max_block_size: u32,
) -> Result<Vec<u8>, StoreError> {
    let root_value = Value::Map(root.clone());
    let content_len = 8 + space.encoded_len() + registry.size_of(&root_value)?;
    let block_size = HEADER_LEN + content_len;
    if block_size > max_block_size as usize {
        return Err(StoreError::RootBlockTooLarge {
            size: block_size,
            max: max_block_size as usize,
        });
    }

    let mut content = ByteWriter::with_capacity(content_len);
    content.put_i64(timestamp);
    space.encode(&mut content);
    registry.write(&root_value, &mut content)?;
    let digest = Digest::compute(content.as_slice());

    let mut block = ByteWriter::with_capacity(block_size);
    block.put_i32(max_block_size as i32);
    block.put_i32(block_size as i32);
    block.put_u16(TAG_DIGEST);
    block.put_bytes(digest.as_bytes());
    block.put_bytes(content.as_slice());
    Ok(block.into_vec())
}

impl RootBlock {
    pub(crate) fn encode(
        &self,
        registry: &CodecRegistry,
        max_block_size: u32,
    ) -> Result<Vec<u8>, StoreError> {
        encode_root(self.timestamp, &self.space, &self.root, registry, max_block_size)
    }

    /// Decode one slot. `offset` is only used to report where a bad slot
    /// was found.
    pub(crate) fn decode(
        buf: &[u8],
        registry: &CodecRegistry,
        expected_max: u32,
        offset: u64,
    ) -> Result<Self, StoreError> {
        let mut reader = ByteReader::new(buf);
        let stored_max = reader
            .get_i32()
            .map_err(|_| short_slot(offset))?;
        if stored_max != expected_max as i32 {
            return Err(StoreError::SizeMismatch {
                offset,
                reason: format!("stored max block size {stored_max} != {expected_max}"),
            });
        }
        let block_size = reader
            .get_i32()
            .map_err(|_| short_slot(offset))?;
        if (block_size as usize) < HEADER_LEN || block_size as usize > buf.len() {
            return Err(StoreError::SizeMismatch {
                offset,
                reason: format!("declared block size {block_size} out of bounds"),
            });
        }
        let tag = reader.get_u16().map_err(|_| short_slot(offset))?;
        if tag != TAG_DIGEST {
            return Err(StoreError::ChecksumMismatch(offset));
        }
        let mut stored_digest = [0u8; Digest::LEN];
        stored_digest
            .copy_from_slice(reader.get_bytes(Digest::LEN).map_err(|_| short_slot(offset))?);

        let content = &buf[HEADER_LEN..block_size as usize];
        if Digest::compute(content) != Digest::from_bytes(stored_digest) {
            return Err(StoreError::ChecksumMismatch(offset));
        }

        // The digest holds from here on; failures below are format
        // mismatches, not slot corruption.
        let mut content_reader = ByteReader::new(content);
        let timestamp: Timestamp = content_reader.get_i64()?;
        let space = SpaceManager::decode(&mut content_reader)?;
        let root = match registry.read_value(&mut content_reader)? {
            Value::Map(map) => map,
            other => {
                return Err(StoreError::Codec(CodecError::KindMismatch {
                    expected: ValueKind::Map,
                    actual: other.kind(),
                }))
            }
        };

        Ok(Self {
            timestamp,
            space,
            root,
        })
    }
}

fn short_slot(offset: u64) -> StoreError {
    StoreError::SizeMismatch {
        offset,
        reason: "slot shorter than the block header".to_string(),
    }
}
