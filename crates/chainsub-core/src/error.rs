//! Error types for the subscription pipeline.

use thiserror::Error;

/// Errors that can occur while subscribing, assembling, or reverting blocks.
///
/// Fatal variants mean continuing would corrupt delivery order or lose data;
/// they propagate to the top-level supervisor, which owns the decision to
/// shut the process down. Everything else is recovered locally (reconnect,
/// backoff, failover).
#[derive(Debug, Error)]
pub enum SubscribeError {
    /// The first message after (re)subscription is at or behind the persisted
    /// resume sequence — the broker would replay history as new.
    #[error("sequence regression: expected at least {expected}, got {got}")]
    SequenceRegression { expected: u64, got: u64 },

    /// The assembly deadline passed with unresolved transactions and the
    /// missing-transaction policy is strict.
    #[error("block {block_num} is missing {} transaction(s): {trx_ids:?}", trx_ids.len())]
    MissingTransactions { block_num: u64, trx_ids: Vec<String> },

    /// A commit event referenced a block that was never queued — a block was
    /// dropped upstream.
    #[error("irreversible gap: block {expected} missing from queue (committed up to {committed})")]
    IrreversibleGap { expected: u64, committed: u64 },

    /// The journal row for the rollback base itself is absent.
    #[error("rollback anchor missing: no journal entry at block {base_block_num}")]
    MissingRollbackAnchor { base_block_num: u64 },

    /// Startup recovery found unfinalized journal rows but no finalized row
    /// to reset the cursor to.
    #[error("no finalized journal entry found during startup recovery")]
    NoFinalizedJournalEntry,

    /// A message body could not be decoded. Skipping a sequence number would
    /// break the ordering contract, so this is not recoverable.
    #[error("malformed message at sequence {sequence}: {reason}")]
    MalformedMessage { sequence: u64, reason: String },

    /// A second block began processing while one was already open.
    #[error("parallel block processing attempted at block {block_num}")]
    ParallelBlockProcessing { block_num: u64 },

    /// No connect URL is configured for the given node id.
    #[error("unknown broker node: {node_id}")]
    UnknownNode { node_id: String },

    /// Failover was requested but no alternate node is configured.
    #[error("no alternate broker node available for failover")]
    NoAlternateNode,

    /// Transient broker transport failure (connect, close, IO).
    #[error("broker error: {0}")]
    Broker(String),

    /// Persistence-layer failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// The application handler returned an error.
    #[error("handler error: {0}")]
    Handler(String),
}

impl SubscribeError {
    /// Returns `true` if the error must terminate the subscriber rather than
    /// trigger a reconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SequenceRegression { .. }
                | Self::MissingTransactions { .. }
                | Self::IrreversibleGap { .. }
                | Self::MissingRollbackAnchor { .. }
                | Self::NoFinalizedJournalEntry
                | Self::MalformedMessage { .. }
                | Self::ParallelBlockProcessing { .. }
                | Self::UnknownNode { .. }
                | Self::Storage(_)
                | Self::Handler(_)
        )
    }
}
