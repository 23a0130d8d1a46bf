//! Transaction assembly buffer.
//!
//! Apply-transaction events arrive asynchronously relative to the accept
//! event of their owning block. They are parked here keyed by
//! `(block_num, trx_id)` until the block finalizes, and garbage-collected
//! once their block number falls behind the irreversible watermark.

use serde_json::Value;

use std::collections::BTreeMap;

use crate::types::{TrxApplied, TrxStatus};

/// A transaction waiting to be matched against its block's manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTransaction {
    pub id: String,
    pub block_num: u64,
    pub actions: Vec<Value>,
    pub status: TrxStatus,
}

impl From<TrxApplied> for PendingTransaction {
    fn from(trx: TrxApplied) -> Self {
        Self {
            id: trx.id,
            block_num: trx.block_num,
            actions: trx.actions,
            status: trx.status,
        }
    }
}

/// Buffers per-block transaction records until their block finalizes.
#[derive(Debug, Default)]
pub struct TransactionAssembly {
    pending: BTreeMap<(u64, String), PendingTransaction>,
}

impl TransactionAssembly {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a transaction. Returns `false` if the `(block_num, id)` key was
    /// already present — a duplicate delivery, kept as a no-op so the same
    /// transaction never appears twice in a block.
    pub fn insert(&mut self, trx: TrxApplied) -> bool {
        let key = (trx.block_num, trx.id.clone());
        if self.pending.contains_key(&key) {
            tracing::debug!(block_num = trx.block_num, trx_id = %trx.id, "duplicate transaction ignored");
            return false;
        }
        self.pending.insert(key, trx.into());
        true
    }

    /// Consume a transaction for block finalization.
    pub fn take(&mut self, block_num: u64, trx_id: &str) -> Option<PendingTransaction> {
        self.pending.remove(&(block_num, trx_id.to_string()))
    }

    /// Ids from `manifest` not yet resolved for `block_num`.
    pub fn missing_for(&self, block_num: u64, manifest: &[String]) -> Vec<String> {
        manifest
            .iter()
            .filter(|id| !self.pending.contains_key(&(block_num, (*id).clone())))
            .cloned()
            .collect()
    }

    /// Drop everything at or below `watermark` (block numbers behind the
    /// irreversible watermark can never be finalized again).
    pub fn prune_at_or_below(&mut self, watermark: u64) {
        self.pending.retain(|(block_num, _), _| *block_num > watermark);
    }

    /// Drop all parked transactions (failover reset).
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
