//! Connection controller — owns the subscription lifecycle.
//!
//! Connects to one of the configured broker nodes, resumes at the persisted
//! cursor, feeds inbound messages through the reorder buffer into the block
//! assembler, gates releases through the irreversibility tracker, and pushes
//! the resulting events through the single-flight dispatcher. On silence or
//! repeated connection failure it reconnects with a fixed delay and, past a
//! failure threshold, fails over to an alternate node.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::assembler::{AssemblerOutput, BlockAssembler};
use crate::broker::{
    AlertSink, Broker, BrokerNode, FailoverAlert, ResumePoint, SequenceLocator,
};
use crate::config::{ResumeMode, SubscriberConfig};
use crate::cursor::{Cursor, CursorStore};
use crate::dispatch::{BlockHandler, EventDispatcher};
use crate::error::SubscribeError;
use crate::irreversible::IrreversibilityTracker;
use crate::reorder::{ReorderBuffer, ReorderOutcome};
use crate::types::{BrokerMessage, MessagePayload, SubscriberEvent};

/// Per-connection state, recreated on every (re)connect so nothing stale
/// survives a torn-down connection.
struct SubscriberState {
    node: BrokerNode,
    resume: ResumePoint,
    /// Next sequence the pipeline expects. `None` until the first message
    /// arrives in time-offset mode.
    expected_sequence: Option<u64>,
    /// Sequences at or below this on the *first* inbound message mean the
    /// broker is replaying already-consumed history — fatal.
    resume_floor: Option<u64>,
    first_message_seen: bool,
}

enum ConnectionEnd {
    Shutdown,
    Reconnect,
}

/// Drives the whole ingestion pipeline for one subscriber.
pub struct ConnectionController {
    config: SubscriberConfig,
    broker: Arc<dyn Broker>,
    locator: Arc<dyn SequenceLocator>,
    alerts: Arc<dyn AlertSink>,
    cursor_store: Arc<dyn CursorStore>,
    dispatcher: EventDispatcher,
    reorder: ReorderBuffer,
    assembler: BlockAssembler,
    irreversible: IrreversibilityTracker,
    active_node_id: String,
    /// Last committed block seen on this connection's feed: `(num, id)`.
    /// Anchors the sequence scan during failover.
    last_irreversible: Option<(u64, String)>,
}

impl ConnectionController {
    pub fn new(
        config: SubscriberConfig,
        broker: Arc<dyn Broker>,
        locator: Arc<dyn SequenceLocator>,
        alerts: Arc<dyn AlertSink>,
        cursor_store: Arc<dyn CursorStore>,
        handler: Arc<dyn BlockHandler>,
    ) -> Self {
        let dispatcher = EventDispatcher::new(
            handler,
            cursor_store.clone(),
            config.active_node_id.clone(),
            config.event_queue_capacity,
        );
        let assembler = BlockAssembler::new(
            config.trx_wait_timeout(),
            config.on_missing_transactions,
            config.include_expired,
        );
        Self {
            active_node_id: config.active_node_id.clone(),
            broker,
            locator,
            alerts,
            cursor_store,
            dispatcher,
            reorder: ReorderBuffer::new(),
            assembler,
            irreversible: IrreversibilityTracker::new(),
            last_irreversible: None,
            config,
        }
    }

    /// Run until shutdown is signalled or a fatal error occurs.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), SubscribeError> {
        let mut consecutive_failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let mut state = self.make_state().await?;
            match self.run_connection(&mut shutdown, &mut state).await {
                Ok(ConnectionEnd::Shutdown) => return Ok(()),
                Ok(ConnectionEnd::Reconnect) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(node_id = %state.node.node_id, error = %e, "broker connection failed");
                }
            }

            // Only genuinely consecutive unproductive connections escalate
            // toward failover. A connection that delivered messages before
            // dying restarts the count at this one failure.
            if state.first_message_seen {
                consecutive_failures = 1;
            } else {
                consecutive_failures += 1;
            }

            if consecutive_failures >= self.config.max_connection_failures {
                match self.failover().await {
                    Ok(()) => {
                        consecutive_failures = 0;
                        continue;
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        tracing::warn!(error = %e, "failover unavailable, retrying current node");
                    }
                }
            }

            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = tokio::time::sleep(self.config.reconnect_delay()) => {}
            }
        }
    }

    /// Build fresh per-connection state from the persisted cursor.
    async fn make_state(&mut self) -> Result<SubscriberState, SubscribeError> {
        let cursor = self.cursor_store.load().await?;
        let (node_id, resume, expected_sequence, resume_floor) = match &cursor {
            Some(c) => (
                c.node_id.clone(),
                ResumePoint::FromSequence(c.next_sequence()),
                Some(c.next_sequence()),
                Some(c.last_block_sequence),
            ),
            None => match &self.config.resume {
                ResumeMode::FromCursor => (
                    self.active_node_id.clone(),
                    ResumePoint::FromSequence(1),
                    Some(1),
                    None,
                ),
                ResumeMode::RecentOnly { max_age_ms } => (
                    self.active_node_id.clone(),
                    ResumePoint::TimeOffset {
                        max_age: std::time::Duration::from_millis(*max_age_ms),
                        skip_at_or_below: 0,
                    },
                    None,
                    None,
                ),
            },
        };

        let node = self
            .config
            .node(&node_id)
            .cloned()
            .ok_or_else(|| SubscribeError::UnknownNode {
                node_id: node_id.clone(),
            })?;
        self.active_node_id = node_id;

        // The broker replays everything past the cursor on reconnect, so any
        // in-flight assembly state is stale; restart emission tracking at the
        // cursor's block.
        self.reorder.clear();
        if let Some(c) = &cursor {
            self.assembler.reset_to(c.last_block_num);
        }

        Ok(SubscriberState {
            node,
            resume,
            expected_sequence,
            resume_floor,
            first_message_seen: false,
        })
    }

    async fn run_connection(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
        state: &mut SubscriberState,
    ) -> Result<ConnectionEnd, SubscribeError> {
        let mut conn = self.broker.connect(&state.node, &state.resume).await?;
        tracing::info!(
            node_id = %state.node.node_id,
            resume = ?state.resume,
            "broker connection established"
        );

        let activity_timeout = self.config.activity_timeout();
        let mut last_activity = Instant::now();

        loop {
            let deadline = self.assembler.deadline();
            tokio::select! {
                _ = shutdown.changed() => {
                    conn.close().await;
                    return Ok(ConnectionEnd::Shutdown);
                }
                msg = conn.recv() => match msg {
                    None => {
                        tracing::warn!(node_id = %state.node.node_id, "broker connection closed");
                        return Ok(ConnectionEnd::Reconnect);
                    }
                    Some(Err(e)) => {
                        conn.close().await;
                        if e.is_fatal() {
                            return Err(e);
                        }
                        tracing::warn!(node_id = %state.node.node_id, error = %e, "broker receive error");
                        return Ok(ConnectionEnd::Reconnect);
                    }
                    Some(Ok(m)) => {
                        last_activity = Instant::now();
                        if let Err(e) = self.on_message(state, m).await {
                            conn.close().await;
                            return Err(e);
                        }
                    }
                },
                _ = tokio::time::sleep_until(last_activity + activity_timeout) => {
                    tracing::warn!(
                        node_id = %state.node.node_id,
                        timeout_ms = self.config.activity_timeout_ms,
                        "no broker activity within timeout"
                    );
                    conn.close().await;
                    return Ok(ConnectionEnd::Reconnect);
                }
                _ = candidate_deadline(deadline) => {
                    match self.assembler.on_deadline() {
                        Ok(outputs) => self.emit(outputs).await?,
                        Err(e) => {
                            conn.close().await;
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    async fn on_message(
        &mut self,
        state: &mut SubscriberState,
        msg: BrokerMessage,
    ) -> Result<(), SubscribeError> {
        if !state.first_message_seen {
            state.first_message_seen = true;
            if let Some(floor) = state.resume_floor {
                if msg.sequence <= floor {
                    return Err(SubscribeError::SequenceRegression {
                        expected: floor + 1,
                        got: msg.sequence,
                    });
                }
            }
        }
        let expected = *state.expected_sequence.get_or_insert(msg.sequence);

        match self.reorder.accept(msg, expected) {
            ReorderOutcome::Duplicate | ReorderOutcome::Buffered => Ok(()),
            ReorderOutcome::Deliver(run) => {
                for m in run {
                    state.expected_sequence = Some(m.sequence + 1);
                    self.apply(m).await?;
                }
                Ok(())
            }
        }
    }

    /// Feed one in-order message into the pipeline.
    async fn apply(&mut self, msg: BrokerMessage) -> Result<(), SubscribeError> {
        match msg.payload {
            MessagePayload::ApplyTrx(trx) => {
                let outputs = self.assembler.on_trx(trx)?;
                self.emit(outputs).await
            }
            MessagePayload::AcceptBlock(accepted) => {
                let outputs = self.assembler.on_accept(accepted, msg.sequence)?;
                self.emit(outputs).await
            }
            MessagePayload::CommitBlock(commit) => {
                self.last_irreversible = Some((commit.block_num, commit.block_id));
                let released = self.irreversible.on_commit(commit.block_num)?;
                for block in released {
                    self.dispatcher
                        .push(SubscriberEvent::IrreversibleBlock(block))
                        .await?;
                }
                self.assembler.prune_transactions(commit.block_num);
                Ok(())
            }
        }
    }

    async fn emit(&mut self, outputs: Vec<AssemblerOutput>) -> Result<(), SubscribeError> {
        for output in outputs {
            match output {
                AssemblerOutput::Fork { base_block_num } => {
                    self.irreversible.rewind_to(base_block_num);
                    self.dispatcher
                        .push(SubscriberEvent::Fork { base_block_num })
                        .await?;
                }
                AssemblerOutput::Block(block) => {
                    self.irreversible.enqueue(block.clone());
                    self.dispatcher.push(SubscriberEvent::Block(block)).await?;
                }
            }
        }
        Ok(())
    }

    /// Switch to an alternate broker node.
    ///
    /// Anything reversible recorded against the dead node cannot be trusted,
    /// so a synthetic fork back to the last irreversible block precedes the
    /// switch, and the dispatch queue is fully drained before the cursor is
    /// rewritten.
    async fn failover(&mut self) -> Result<(), SubscribeError> {
        let target = self
            .config
            .nodes
            .iter()
            .find(|n| n.node_id != self.active_node_id)
            .cloned()
            .ok_or(SubscribeError::NoAlternateNode)?;

        let Some((irr_num, irr_id)) = self.last_irreversible.clone() else {
            return Err(SubscribeError::Broker(
                "no known irreversible block to anchor failover".into(),
            ));
        };

        tracing::warn!(
            from_node = %self.active_node_id,
            to_node = %target.node_id,
            base_block_num = irr_num,
            "attempting broker failover"
        );

        let sequence = self.locator.locate(&target, &irr_id, irr_num).await?;

        self.dispatcher
            .push(SubscriberEvent::Fork {
                base_block_num: irr_num,
            })
            .await?;
        self.dispatcher.drain().await?;

        let cursor = Cursor::new(irr_num, sequence, target.node_id.clone());
        self.cursor_store.save(&cursor).await?;
        self.dispatcher.set_node_id(target.node_id.clone());

        self.reorder.clear();
        self.assembler.reset_to(irr_num);
        self.irreversible.clear_queue();

        self.alerts
            .notify_failover(&FailoverAlert {
                service_name: self.config.service_name.clone(),
                from_node: self.active_node_id.clone(),
                to_node: target.node_id.clone(),
            })
            .await;

        self.active_node_id = target.node_id;
        Ok(())
    }
}

/// Sleeps until the candidate's assembly deadline, or forever if no
/// candidate is open.
async fn candidate_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
