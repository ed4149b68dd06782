#![warn(missing_docs)]
//! Tidemark versioned store
//!
//! # Why is this called Tidemark?
//!
//! A tidemark is the line the water leaves behind: you can always read
//! where the tide has been. That is what this store does for data.
//!
//! # Implementation Details
//!
//! Provides an embedded, copy-on-write key/list store in a single file.
//!
//! Collections are persistent AA-trees whose entries carry creation and
//! deletion timestamps. Mutations return new roots and share untouched
//! subtrees with the old ones, so every committed root stays valid as a
//! read snapshot and any point in time can be queried after the fact.
//!
//! Durability uses two fixed root-block slots at the start of the file.
//! Each commit serializes the whole root through a tagged binary codec,
//! checksums it, and writes it to whichever slot was not written last;
//! only after the write syncs is the new root published. A crash during a
//! commit therefore damages, at worst, the slot that was due to be
//! overwritten, and the next open falls back to the other one.
//!
//! All mutation flows through a single transaction at a time, handled by
//! a worker task per open store:
//!
//! ```no_run
//! use tidemark::store::Store;
//! use tidemark::tree::TIME_MAX;
//! use tidemark::Value;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let store = Store::create("example.db", 4096).await?;
//! store
//!     .transaction(|tx| async move {
//!         Ok(tx.root().set(&Value::from("x"), Value::from("hi"), tx.timestamp()))
//!     })
//!     .await?;
//! assert_eq!(
//!     store.snapshot().get(&Value::from("x"), TIME_MAX),
//!     Some(Value::from("hi"))
//! );
//! store.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod store;
pub mod tree;
mod value;

pub use value::Value;
pub use value::ValueKind;
