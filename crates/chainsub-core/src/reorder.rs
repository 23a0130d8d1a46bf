//! Reorder buffer — restores broker sequence order.
//!
//! The broker assigns strictly increasing sequence numbers but may deliver
//! messages out of order. Messages ahead of the expected sequence are parked
//! here; when the expected message arrives, it is released together with any
//! now-contiguous run.

use std::collections::BTreeMap;

use crate::types::BrokerMessage;

/// Result of offering a message to the buffer.
#[derive(Debug)]
pub enum ReorderOutcome {
    /// The expected message arrived; deliver it plus the contiguous run that
    /// follows it, in sequence order.
    Deliver(Vec<BrokerMessage>),
    /// The message is ahead of expectation and was parked.
    Buffered,
    /// The message is at or behind a sequence already delivered.
    Duplicate,
}

/// Holds out-of-order messages keyed by sequence.
///
/// Never grows beyond the gap between the furthest-seen and the expected
/// sequence.
#[derive(Debug, Default)]
pub struct ReorderBuffer {
    ahead: BTreeMap<u64, BrokerMessage>,
}

impl ReorderBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a message given the currently expected next sequence.
    pub fn accept(&mut self, msg: BrokerMessage, expected_next: u64) -> ReorderOutcome {
        if msg.sequence < expected_next {
            tracing::debug!(
                sequence = msg.sequence,
                expected = expected_next,
                "dropping duplicate broker message"
            );
            return ReorderOutcome::Duplicate;
        }
        if msg.sequence > expected_next {
            self.ahead.insert(msg.sequence, msg);
            return ReorderOutcome::Buffered;
        }

        let mut run = vec![msg];
        let mut next = expected_next + 1;
        while let Some(m) = self.ahead.remove(&next) {
            run.push(m);
            next += 1;
        }
        ReorderOutcome::Deliver(run)
    }

    /// Drop all parked messages (failover reset).
    pub fn clear(&mut self) {
        self.ahead.clear();
    }

    /// Number of parked messages.
    pub fn len(&self) -> usize {
        self.ahead.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ahead.is_empty()
    }
}
