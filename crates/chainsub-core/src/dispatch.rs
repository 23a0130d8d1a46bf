//! Single-flight event dispatch to the application handler.
//!
//! Connection callbacks may produce several events at once (a released run
//! of irreversible blocks, a fork followed by its block). They are queued
//! here and handed to the handler strictly one at a time; each invocation is
//! awaited to completion before the next begins. The cursor is persisted
//! after each block-bearing event returns, before the next dispatch, so a
//! crash mid-handler never advances the cursor past unconfirmed work.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;

use crate::cursor::{Cursor, CursorStore};
use crate::error::SubscribeError;
use crate::types::SubscriberEvent;

/// The application-facing handler. Invoked strictly sequentially.
#[async_trait]
pub trait BlockHandler: Send + Sync {
    async fn handle(&self, event: SubscriberEvent) -> Result<(), SubscribeError>;
}

/// Queues subscriber events and drains them one at a time.
pub struct EventDispatcher {
    handler: Arc<dyn BlockHandler>,
    cursor_store: Arc<dyn CursorStore>,
    node_id: String,
    queue: VecDeque<SubscriberEvent>,
    capacity: usize,
    draining: bool,
    /// Highest sequence ever saved; irreversible releases trail the
    /// reversible head and must never move the cursor backwards.
    saved_sequence: Option<u64>,
}

impl EventDispatcher {
    pub fn new(
        handler: Arc<dyn BlockHandler>,
        cursor_store: Arc<dyn CursorStore>,
        node_id: impl Into<String>,
        capacity: usize,
    ) -> Self {
        Self {
            handler,
            cursor_store,
            node_id: node_id.into(),
            queue: VecDeque::new(),
            capacity,
            draining: false,
            saved_sequence: None,
        }
    }

    /// Queue an event and drain the queue.
    ///
    /// The capacity is a soft cap: the queue is drained synchronously on
    /// every push, so it cannot grow without bound. Crossing the cap means a
    /// handler is feeding events back faster than they drain, which is worth
    /// a warning but not worth dropping ordered events over.
    pub async fn push(&mut self, event: SubscriberEvent) -> Result<(), SubscribeError> {
        if self.queue.len() >= self.capacity {
            tracing::warn!(
                queued = self.queue.len(),
                capacity = self.capacity,
                "dispatch queue above capacity"
            );
        }
        self.queue.push_back(event);
        self.drain().await
    }

    /// Dispatch queued events until the queue is empty. Used directly as the
    /// drain marker before failover: when it returns, nothing is in flight.
    pub async fn drain(&mut self) -> Result<(), SubscribeError> {
        if self.draining {
            // A dispatch is already in progress further up the stack; the
            // event stays queued and that drain will pick it up.
            return Ok(());
        }
        self.draining = true;
        let result = self.drain_inner().await;
        self.draining = false;
        result
    }

    async fn drain_inner(&mut self) -> Result<(), SubscribeError> {
        while let Some(event) = self.queue.pop_front() {
            let cursor_after = match &event {
                SubscriberEvent::Block(b) | SubscriberEvent::IrreversibleBlock(b) => Some(
                    Cursor::new(b.block_num, b.sequence, self.node_id.clone()),
                ),
                SubscriberEvent::Fork { .. } => None,
            };

            self.handler.handle(event).await?;

            if let Some(cursor) = cursor_after {
                if self.saved_sequence.map_or(true, |s| cursor.last_block_sequence > s) {
                    self.cursor_store.save(&cursor).await?;
                    self.saved_sequence = Some(cursor.last_block_sequence);
                }
            }
        }
        Ok(())
    }

    /// Update the node id recorded in subsequently saved cursors (failover).
    /// Sequences are per-node, so the monotonic save guard restarts too.
    pub fn set_node_id(&mut self, node_id: impl Into<String>) {
        self.node_id = node_id.into();
        self.saved_sequence = None;
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }
}
