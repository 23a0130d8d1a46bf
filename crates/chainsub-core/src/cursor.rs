//! Subscription cursor — the persisted resume point.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SubscribeError;

/// The persisted resume point of the subscriber.
///
/// A single row, written after each block (or irreversible block) has been
/// handed to the application handler — never before, so a crash mid-handler
/// cannot advance the cursor past unconfirmed work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Last block number delivered to the handler.
    pub last_block_num: u64,
    /// Broker sequence of that block's accept event.
    pub last_block_sequence: u64,
    /// The broker node the sequence belongs to. Sequences are per-node; a
    /// cursor is only meaningful together with its node id.
    pub node_id: String,
}

impl Cursor {
    pub fn new(last_block_num: u64, last_block_sequence: u64, node_id: impl Into<String>) -> Self {
        Self {
            last_block_num,
            last_block_sequence,
            node_id: node_id.into(),
        }
    }

    /// The next broker sequence to subscribe from.
    pub fn next_sequence(&self) -> u64 {
        self.last_block_sequence + 1
    }

    /// Apply an operator override, replacing only the supplied fields.
    pub fn apply(&mut self, update: CursorUpdate) {
        if let Some(n) = update.last_block_num {
            self.last_block_num = n;
        }
        if let Some(s) = update.last_block_sequence {
            self.last_block_sequence = s;
        }
        if let Some(id) = update.node_id {
            self.node_id = id;
        }
    }
}

/// Partial cursor override, used by operators recovering from an incident.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CursorUpdate {
    pub last_block_num: Option<u64>,
    pub last_block_sequence: Option<u64>,
    pub node_id: Option<String>,
}

/// Persistence for the singleton cursor row.
///
/// `save` must be an atomic upsert; `load` returns `None` on a fresh store.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self) -> Result<Option<Cursor>, SubscribeError>;
    async fn save(&self, cursor: &Cursor) -> Result<(), SubscribeError>;
}
