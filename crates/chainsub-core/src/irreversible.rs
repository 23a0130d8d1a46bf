//! Irreversibility tracker — gates the release of completed blocks.
//!
//! Assembled blocks queue here until the chain commits them. On a commit
//! event every queued block at or below the committed number is released in
//! block-number order; a missing block in that range means something was
//! dropped upstream and is fatal.

use std::collections::BTreeMap;

use crate::error::SubscribeError;
use crate::types::Block;

/// Queue of completed-but-unreleased blocks.
#[derive(Debug, Default)]
pub struct IrreversibilityTracker {
    queued: BTreeMap<u64, Block>,
    /// Last released irreversible block number.
    watermark: Option<u64>,
}

impl IrreversibilityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a completed block. A re-assembled block after a fork replaces
    /// the stale entry at the same number.
    pub fn enqueue(&mut self, block: Block) {
        self.queued.insert(block.block_num, block);
    }

    /// The chain committed up to `committed`. Returns the blocks to release,
    /// in ascending order.
    pub fn on_commit(&mut self, committed: u64) -> Result<Vec<Block>, SubscribeError> {
        let mut next = match self.watermark {
            Some(w) => w + 1,
            None => match self.queued.keys().next() {
                Some(min) => *min,
                None => return Ok(vec![]),
            },
        };

        let mut released = Vec::new();
        while next <= committed {
            match self.queued.remove(&next) {
                Some(block) => {
                    released.push(block);
                    self.watermark = Some(next);
                    next += 1;
                }
                None => {
                    return Err(SubscribeError::IrreversibleGap {
                        expected: next,
                        committed,
                    });
                }
            }
        }
        Ok(released)
    }

    /// Last released irreversible block number.
    pub fn watermark(&self) -> Option<u64> {
        self.watermark
    }

    /// Drop queued blocks above `base` (fork rollback).
    pub fn rewind_to(&mut self, base: u64) {
        self.queued.retain(|num, _| *num <= base);
    }

    /// Drop the whole queue (failover reset). The watermark survives — what
    /// was irreversible stays irreversible.
    pub fn clear_queue(&mut self) {
        self.queued.clear();
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }
}
