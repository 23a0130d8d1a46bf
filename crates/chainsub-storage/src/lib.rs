//! chainsub-storage — pluggable storage backends for ChainSub.
//!
//! Backends:
//! - [`memory`] — in-memory (dev/testing, no persistence)
//! - [`sqlite`] — SQLite via `sqlx` (embedded, single-file persistence)
//!
//! Each backend implements the three persistence traits the core consumes:
//! `CursorStore`, `JournalStore`, and `DocumentStore`.

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryStorage;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
