//! # reldir storage
//!
//! An embedded, single-file, transactional key-value engine with nested
//! buckets.
//!
//! The file is an append-only commit log replayed into an in-memory,
//! copy-on-write bucket tree at open. Readers get consistent snapshots and
//! never block; a single writer at a time commits by appending one framed,
//! checksummed record. The log is compacted in place when it grows well past
//! the size of the data it holds.
//!
//! ## Example
//!
//! ```rust
//! use reldir_storage::{Db, StorageResult, Tx};
//!
//! let db = Db::open_in_memory().unwrap();
//! db.update(|tx| -> StorageResult<()> {
//!     tx.create_bucket(&["objects"])?;
//!     tx.put(&["objects"], b"user:alice", b"{}")
//! })
//! .unwrap();
//!
//! let tx = db.begin_read();
//! assert_eq!(tx.get(&["objects"], b"user:alice").unwrap().as_ref(), b"{}");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod batch;
mod cursor;
mod db;
mod error;
mod file;
mod lock;
mod memory;
mod options;
mod record;
mod stats;
mod tree;
mod tx;

pub use backend::StorageBackend;
pub use cursor::{Cursor, Item};
pub use db::Db;
pub use error::{CallerError, StorageError, StorageResult};
pub use file::FileBackend;
pub use lock::FileLock;
pub use memory::InMemoryBackend;
pub use options::Options;
pub use record::FORMAT_VERSION;
pub use stats::{EngineStats, StatsSnapshot};
pub use tree::{Bucket, Entries};
pub use tx::{ReadTx, Tx, WriteTx};
