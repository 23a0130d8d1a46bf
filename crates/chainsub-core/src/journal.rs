//! Fork journal — per-reversible-block undo log of document mutations.
//!
//! While the application handles a block it records every document mutation
//! (create/update/remove with the document's before-image) against that
//! block's journal entry. On a fork the [`ForkReplayer`](crate::replay)
//! walks these entries backward and undoes them instead of re-deriving all
//! state from scratch.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SubscribeError;
use crate::types::Block;

/// A single recorded document mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub op: ChangeOp,
    /// Target collection name.
    pub collection: String,
    /// Document id within the collection.
    pub document_id: String,
    /// The document as it was *before* the mutation. Empty object for
    /// `Create` (there was nothing before).
    #[serde(default)]
    pub before_image: Value,
}

/// The kind of mutation that was applied (and must be undone in reverse).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Create,
    Update,
    Remove,
}

/// One journal row per reversible block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub block_num: u64,
    pub block_time: DateTime<Utc>,
    pub block_sequence: u64,
    /// Set once the application finished processing the block. An
    /// unfinalized top entry at startup marks a crash-time partial block.
    pub finalized: bool,
    /// Mutations in insertion order; undone back-to-front.
    pub stack: Vec<ChangeRecord>,
}

/// Persistence for journal entries, filterable by block number.
///
/// All listing methods return entries in *descending* block-number order —
/// the order rollback consumes them in.
#[async_trait]
pub trait JournalStore: Send + Sync {
    async fn insert_entry(&self, entry: JournalEntry) -> Result<(), SubscribeError>;
    /// Append a change to the entry at `block_num`.
    async fn push_change(&self, block_num: u64, change: ChangeRecord)
        -> Result<(), SubscribeError>;
    async fn mark_finalized(&self, block_num: u64) -> Result<(), SubscribeError>;
    /// Entries with `block_num >= base`, descending.
    async fn entries_at_or_above(&self, base: u64) -> Result<Vec<JournalEntry>, SubscribeError>;
    /// Newest `limit` entries, descending.
    async fn top_entries(&self, limit: usize) -> Result<Vec<JournalEntry>, SubscribeError>;
    async fn delete_entry(&self, block_num: u64) -> Result<(), SubscribeError>;
    /// Delete entries with `block_num > base`.
    async fn delete_above(&self, base: u64) -> Result<(), SubscribeError>;
    /// Delete entries with `block_num < watermark`.
    async fn delete_below(&self, watermark: u64) -> Result<(), SubscribeError>;
}

/// Application-facing journal manager.
///
/// Enforces the single-flight invariant: exactly one block may be between
/// `begin_block` and `finalize_block` at a time.
pub struct ForkJournal<S: JournalStore + ?Sized> {
    store: std::sync::Arc<S>,
    active_block: Mutex<Option<u64>>,
}

impl<S: JournalStore + ?Sized> ForkJournal<S> {
    pub fn new(store: std::sync::Arc<S>) -> Self {
        Self {
            store,
            active_block: Mutex::new(None),
        }
    }

    /// Open an (unfinalized) journal entry for `block`.
    pub async fn begin_block(&self, block: &Block) -> Result<(), SubscribeError> {
        {
            let mut active = self.active_block.lock().unwrap();
            if active.is_some() {
                return Err(SubscribeError::ParallelBlockProcessing {
                    block_num: block.block_num,
                });
            }
            *active = Some(block.block_num);
        }
        self.store
            .insert_entry(JournalEntry {
                block_num: block.block_num,
                block_time: block.block_time,
                block_sequence: block.sequence,
                finalized: false,
                stack: vec![],
            })
            .await
    }

    /// Record a mutation against the active block's entry.
    ///
    /// Calling this outside an active block is tolerated but logged — the
    /// mutation lands on the newest entry and will be undone with it.
    pub async fn register_change(&self, change: ChangeRecord) -> Result<(), SubscribeError> {
        let active = *self.active_block.lock().unwrap();
        let Some(block_num) = active else {
            tracing::warn!(
                collection = %change.collection,
                document_id = %change.document_id,
                "register_change called outside of block processing"
            );
            let top = self.store.top_entries(1).await?;
            let Some(entry) = top.first() else {
                return Ok(());
            };
            return self.store.push_change(entry.block_num, change).await;
        };
        self.store.push_change(block_num, change).await
    }

    /// Mark the block's entry finalized and release the single-flight slot.
    pub async fn finalize_block(&self, block: &Block) -> Result<(), SubscribeError> {
        self.store.mark_finalized(block.block_num).await?;
        *self.active_block.lock().unwrap() = None;
        Ok(())
    }

    /// Run `f` bracketed by `begin_block`/`finalize_block`.
    ///
    /// If `f` fails the entry is left unfinalized on purpose: startup
    /// recovery treats it as a crash-time partial block and undoes it.
    pub async fn wrap_block<F, Fut>(&self, block: &Block, f: F) -> Result<(), SubscribeError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), SubscribeError>>,
    {
        self.begin_block(block).await?;
        match f().await {
            Ok(()) => self.finalize_block(block).await,
            Err(e) => {
                *self.active_block.lock().unwrap() = None;
                Err(e)
            }
        }
    }

    /// The block became irreversible: delete entries below `block_num - 1`,
    /// keeping one trailing finalized row as the rollback anchor. Pruning
    /// failures are logged, not propagated — stale rows are harmless.
    pub async fn register_irreversible(&self, block_num: u64) {
        if let Err(e) = self.store.delete_below(block_num.saturating_sub(1)).await {
            tracing::warn!(block_num, error = %e, "failed to prune outdated fork data");
        }
    }
}
