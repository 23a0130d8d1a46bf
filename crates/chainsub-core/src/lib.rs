//! chainsub-core — ordered, crash-safe block subscription over an
//! unreliable message broker.
//!
//! # Architecture
//!
//! ```text
//! BlockSubscriber → ConnectionController
//!                       ├── ReorderBuffer          (restores sequence order)
//!                       ├── BlockAssembler         (accept + trx → Block, fork flagging)
//!                       ├── IrreversibilityTracker (gates irreversible releases)
//!                       ├── EventDispatcher        (single-flight handler + cursor)
//!                       └── Broker / SequenceLocator / AlertSink (transport traits)
//!                   ForkJournal  (per-block undo log)
//!                   ForkReplayer (rollback on fork / crash recovery)
//! ```

pub mod assembler;
pub mod assembly;
pub mod broker;
pub mod config;
pub mod controller;
pub mod cursor;
pub mod dispatch;
pub mod error;
pub mod irreversible;
pub mod journal;
pub mod reorder;
pub mod replay;
pub mod subscriber;
pub mod types;

pub use assembler::{AssemblerOutput, BlockAssembler};
pub use broker::{
    AlertSink, Broker, BrokerConnection, BrokerNode, FailoverAlert, LogAlertSink, ResumePoint,
    SequenceLocator,
};
pub use config::{MissingTrxPolicy, ResumeMode, SubscriberConfig};
pub use controller::ConnectionController;
pub use cursor::{Cursor, CursorStore, CursorUpdate};
pub use dispatch::{BlockHandler, EventDispatcher};
pub use error::SubscribeError;
pub use irreversible::IrreversibilityTracker;
pub use journal::{ChangeOp, ChangeRecord, ForkJournal, JournalEntry, JournalStore};
pub use reorder::{ReorderBuffer, ReorderOutcome};
pub use replay::{CursorReset, DocumentStore, ForkReplayer};
pub use subscriber::BlockSubscriber;
pub use types::{
    Block, BlockAccepted, BlockCommitted, BlockCounters, BlockTransaction, BrokerMessage,
    MessagePayload, SubscriberEvent, TrxApplied, TrxStatus,
};
