//! Durable storage
//!
//! A database is one file holding two fixed root-block slots plus
//! secondary payload blocks. Commits alternate between the slots, so the
//! previously published root is never touched by an in-flight write and a
//! torn write is caught by the checksum on the next open.

pub(crate) mod block;
mod checksum;
mod engine;
mod file;
mod space;

pub use checksum::Digest;
pub use engine::Store;
pub use engine::Transaction;
pub use space::SpaceManager;

use std::path::PathBuf;

use thiserror::Error;

use crate::codec::CodecError;

/// Storage failures.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The file is already open in this process.
    #[error("store is already open: {0}")]
    AlreadyOpen(PathBuf),

    /// The path is missing, not a regular file, or not read-writable.
    #[error("file state error: {path}: {reason}")]
    FileState {
        /// Offending path.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// Neither root-block slot validated on open.
    #[error("no valid root block found")]
    NoValidRoot,

    /// A slot's stored digest does not match its content.
    #[error("root block checksum mismatch at offset {0}")]
    ChecksumMismatch(u64),

    /// A slot's size fields are out of bounds or disagree with the engine.
    #[error("root block size mismatch at offset {offset}: {reason}")]
    SizeMismatch {
        /// Slot offset in the file.
        offset: u64,
        /// What disagreed.
        reason: String,
    },

    /// A transaction's serialized root block exceeds the configured limit.
    #[error("root block too large: {size} bytes exceeds limit of {max}")]
    RootBlockTooLarge {
        /// Bytes the block would need.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A privileged operation ran outside the active transaction.
    #[error("privileged operation invoked outside a transaction")]
    PrivilegeViolation,

    /// The store has been closed.
    #[error("store is closed")]
    Closed,

    /// Serialization failure; on open this signals a format mismatch.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Operational file I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
