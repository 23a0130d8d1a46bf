//! Shared types for the subscription pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Broker messages ─────────────────────────────────────────────────────────

/// A single message received from the broker.
///
/// The broker assigns a monotonically increasing `sequence` to every message;
/// the same sequence is never reissued. Delivery order is *not* guaranteed —
/// the [`ReorderBuffer`](crate::reorder::ReorderBuffer) restores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerMessage {
    /// Broker-assigned sequence number.
    pub sequence: u64,
    /// The decoded payload.
    #[serde(flatten)]
    pub payload: MessagePayload,
}

/// The three logical feeds carried by the broker, as a closed variant type.
///
/// The wire format tags each message with a `msg_type` string; dispatch on the
/// enum is exhaustive, so an unknown tag fails deserialization instead of
/// being silently ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg_type", rename_all = "snake_case")]
pub enum MessagePayload {
    /// A transaction was applied by the chain.
    ApplyTrx(TrxApplied),
    /// A reversible block was accepted by the chain.
    AcceptBlock(BlockAccepted),
    /// A block became irreversible.
    CommitBlock(BlockCommitted),
}

/// Payload of a transaction-applied event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrxApplied {
    /// Transaction id.
    pub id: String,
    /// The block this transaction belongs to.
    pub block_num: u64,
    /// Raw decoded actions; the core treats them as opaque.
    pub actions: Vec<Value>,
    /// Execution status reported by the chain.
    pub status: TrxStatus,
}

/// Payload of a block-accepted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockAccepted {
    /// Block id.
    pub id: String,
    /// Parent block id.
    pub parent_id: String,
    /// Block number.
    pub block_num: u64,
    /// Block production time.
    pub block_time: DateTime<Utc>,
    /// Transaction manifest — ids in the block's own order.
    pub trx_ids: Vec<String>,
    /// Aggregate counters reported with the block.
    #[serde(default)]
    pub counters: BlockCounters,
}

/// Payload of a block-committed (irreversible) event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockCommitted {
    /// The block number that became irreversible.
    pub block_num: u64,
    /// Its block id.
    pub block_id: String,
}

/// Execution status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrxStatus {
    Executed,
    Expired,
    SoftFail,
    HardFail,
}

/// Aggregate transaction counters for a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCounters {
    pub total_trx_count: u32,
    pub executed_trx_count: u32,
}

// ─── Emitted values ──────────────────────────────────────────────────────────

/// A fully assembled block, immutable once constructed.
///
/// `transactions` follow the order of the block's own manifest, never the
/// arrival order of the apply-transaction events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    pub parent_id: String,
    pub block_num: u64,
    pub block_time: DateTime<Utc>,
    /// The broker sequence of the accept event that produced this block.
    pub sequence: u64,
    pub transactions: Vec<BlockTransaction>,
    pub counters: BlockCounters,
}

/// A transaction resolved into its owning block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockTransaction {
    pub id: String,
    pub actions: Vec<Value>,
    pub status: TrxStatus,
}

/// An event delivered to the application handler, strictly one at a time.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriberEvent {
    /// A reversible block was assembled.
    Block(Block),
    /// A previously emitted block became irreversible.
    IrreversibleBlock(Block),
    /// A fork was detected (or synthesized by failover); the application must
    /// roll its state back to `base_block_num`.
    Fork { base_block_num: u64 },
}

impl SubscriberEvent {
    /// The block number the event refers to.
    pub fn block_num(&self) -> u64 {
        match self {
            Self::Block(b) | Self::IrreversibleBlock(b) => b.block_num,
            Self::Fork { base_block_num } => *base_block_num,
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_tag_roundtrip() {
        let raw = serde_json::json!({
            "sequence": 42,
            "msg_type": "commit_block",
            "block_num": 100,
            "block_id": "00000064abc",
        });
        let msg: BrokerMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(msg.sequence, 42);
        assert!(matches!(
            msg.payload,
            MessagePayload::CommitBlock(BlockCommitted { block_num: 100, .. })
        ));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let raw = serde_json::json!({
            "sequence": 1,
            "msg_type": "something_else",
        });
        assert!(serde_json::from_value::<BrokerMessage>(raw).is_err());
    }

    #[test]
    fn trx_status_wire_names() {
        let status: TrxStatus = serde_json::from_str("\"soft_fail\"").unwrap();
        assert_eq!(status, TrxStatus::SoftFail);
    }
}
