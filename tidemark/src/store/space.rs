//! Disk space manager
//!
//! Tracks which secondary payload blocks are live. Allocations are
//! visible to the running transaction immediately; releases are staged
//! and only take effect at commit, so a failed write can never hand a
//! still-referenced block to the next transaction. The ledger is part of
//! the root block's checksummed content.

use std::collections::BTreeSet;

use crate::codec::ByteReader;
use crate::codec::ByteWriter;
use crate::codec::CodecError;
use crate::store::StoreError;

#[derive(Clone, Debug)]
struct Ledger {
    next_block: u64,
    free: BTreeSet<u64>,
}

/// Free/used ledger for secondary payload blocks.
///
/// Every public operation is privileged: it fails with
/// [`StoreError::PrivilegeViolation`] unless a transaction is active.
#[derive(Debug, Default)]
pub struct SpaceManager {
    next_block: u64,
    free: BTreeSet<u64>,
    staged: Vec<u64>,
    active: bool,
    undo: Option<Ledger>,
}

impl SpaceManager {
    /// An empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the lowest free block number and mark it used.
    pub fn allocate(&mut self) -> Result<u64, StoreError> {
        self.check_active()?;
        match self.free.iter().next().copied() {
            Some(block) => {
                self.free.remove(&block);
                Ok(block)
            }
            None => {
                let block = self.next_block;
                self.next_block += 1;
                Ok(block)
            }
        }
    }

    /// Schedule `block` for reuse. Takes effect at the next successful
    /// commit; releasing a block that is already free is a no-op.
    pub fn release(&mut self, block: u64) -> Result<(), StoreError> {
        self.check_active()?;
        if block < self.next_block && !self.free.contains(&block) && !self.staged.contains(&block) {
            self.staged.push(block);
        }
        Ok(())
    }

    /// Count of blocks currently live. Staged releases still count until
    /// commit.
    pub fn usage(&self) -> Result<u64, StoreError> {
        self.check_active()?;
        Ok(self.next_block - self.free.len() as u64)
    }

    /// Apply staged releases. Runs before the ledger is measured for the
    /// root block, since the ledger itself is durable content.
    pub fn commit(&mut self) -> Result<(), StoreError> {
        self.check_active()?;
        self.free.extend(self.staged.drain(..));
        Ok(())
    }

    fn check_active(&self) -> Result<(), StoreError> {
        if self.active {
            Ok(())
        } else {
            Err(StoreError::PrivilegeViolation)
        }
    }

    /// Enter a transaction, snapshotting the ledger for rollback.
    pub(crate) fn begin(&mut self) {
        self.undo = Some(Ledger {
            next_block: self.next_block,
            free: self.free.clone(),
        });
        self.staged.clear();
        self.active = true;
    }

    /// Abandon the transaction, restoring the pre-transaction ledger.
    pub(crate) fn rollback(&mut self) {
        if let Some(undo) = self.undo.take() {
            self.next_block = undo.next_block;
            self.free = undo.free;
        }
        self.staged.clear();
        self.active = false;
    }

    /// Leave the transaction keeping its effects.
    pub(crate) fn end(&mut self) {
        self.undo = None;
        self.staged.clear();
        self.active = false;
    }

    pub(crate) fn encoded_len(&self) -> usize {
        8 + 4 + 8 * self.free.len()
    }

    pub(crate) fn encode(&self, writer: &mut ByteWriter) {
        writer.put_i64(self.next_block as i64);
        writer.put_i32(self.free.len() as i32);
        for block in &self.free {
            writer.put_i64(*block as i64);
        }
    }

    pub(crate) fn decode(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let next_block = reader.get_i64()?;
        if next_block < 0 {
            return Err(CodecError::InvalidLength(next_block));
        }
        let count = reader.get_i32()?;
        if count < 0 {
            return Err(CodecError::InvalidLength(count as i64));
        }
        let mut free = BTreeSet::new();
        for _ in 0..count {
            let block = reader.get_i64()?;
            if block < 0 {
                return Err(CodecError::InvalidLength(block));
            }
            free.insert(block as u64);
        }
        Ok(Self {
            next_block: next_block as u64,
            free,
            staged: Vec::new(),
            active: false,
            undo: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_rejects_privileged_calls_outside_a_transaction() {
        let mut space = SpaceManager::new();
        assert!(matches!(
            space.allocate(),
            Err(StoreError::PrivilegeViolation)
        ));
        assert!(matches!(
            space.release(0),
            Err(StoreError::PrivilegeViolation)
        ));
        assert!(matches!(space.usage(), Err(StoreError::PrivilegeViolation)));
        assert!(matches!(space.commit(), Err(StoreError::PrivilegeViolation)));
    }

    #[test]
    fn it_defers_releases_until_commit() {
        let mut space = SpaceManager::new();
        space.begin();
        let a = space.allocate().expect("allocates");
        let b = space.allocate().expect("allocates");
        assert_eq!((a, b), (0, 1));

        space.release(a).expect("releases");
        // Released but not committed: the block is still live
        assert_eq!(space.usage().expect("usage"), 2);
        assert_eq!(space.allocate().expect("allocates"), 2);

        space.commit().expect("commits");
        assert_eq!(space.usage().expect("usage"), 2);
        // Now the released block is handed out again
        assert_eq!(space.allocate().expect("allocates"), a);
        space.end();
    }

    #[test]
    fn it_rolls_back_to_the_pre_transaction_ledger() {
        let mut space = SpaceManager::new();
        space.begin();
        space.allocate().expect("allocates");
        space.commit().expect("commits");
        space.end();

        space.begin();
        space.allocate().expect("allocates");
        space.allocate().expect("allocates");
        space.release(0).expect("releases");
        space.commit().expect("commits");
        space.rollback();

        space.begin();
        assert_eq!(space.usage().expect("usage"), 1);
        assert_eq!(space.allocate().expect("allocates"), 1);
        space.end();
    }

    #[test]
    fn it_round_trips_the_ledger() {
        let mut space = SpaceManager::new();
        space.begin();
        for _ in 0..5 {
            space.allocate().expect("allocates");
        }
        space.release(1).expect("releases");
        space.release(3).expect("releases");
        space.commit().expect("commits");
        space.end();

        let mut writer = ByteWriter::with_capacity(space.encoded_len());
        space.encode(&mut writer);
        assert_eq!(writer.len(), space.encoded_len());
        let bytes = writer.into_vec();
        let mut decoded = SpaceManager::decode(&mut ByteReader::new(&bytes)).expect("decodes");

        decoded.begin();
        assert_eq!(decoded.usage().expect("usage"), 3);
        assert_eq!(decoded.allocate().expect("allocates"), 1);
        decoded.end();
    }
}
