//! Broker abstractions — transport, sequence location, failover alerting.
//!
//! The core never talks to a concrete broker; it consumes these traits.
//! Production transports (NATS streaming, etc.) live outside the crate,
//! tests use scripted mocks.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SubscribeError;
use crate::types::BrokerMessage;

/// A configured broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerNode {
    /// Stable identifier, persisted in the cursor.
    pub node_id: String,
    /// Connect string for this endpoint.
    pub connect_url: String,
}

impl BrokerNode {
    pub fn new(node_id: impl Into<String>, connect_url: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            connect_url: connect_url.into(),
        }
    }
}

/// Where to start (or resume) a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumePoint {
    /// Resume from an exact broker sequence.
    FromSequence(u64),
    /// Subscribe from a bounded time offset, skipping anything at or below
    /// `skip_at_or_below` (first run / recent-only mode).
    TimeOffset {
        max_age: Duration,
        skip_at_or_below: u64,
    },
}

/// An open subscription to one broker node.
#[async_trait]
pub trait BrokerConnection: Send {
    /// Receive the next message.
    ///
    /// Returns `None` when the connection is closed by the peer. A decode
    /// failure surfaces as `Some(Err(..))` — the caller decides whether it
    /// is survivable.
    async fn recv(&mut self) -> Option<Result<BrokerMessage, SubscribeError>>;

    /// Unsubscribe and tear the connection down. Must be safe to call when
    /// the connection already died (close races must not reenter shutdown).
    async fn close(&mut self);
}

/// Factory for broker connections.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(
        &self,
        node: &BrokerNode,
        resume: &ResumePoint,
    ) -> Result<Box<dyn BrokerConnection>, SubscribeError>;
}

/// Locates the broker sequence matching a known irreversible block on a
/// target node. Backed by an out-of-process scan helper in production.
#[async_trait]
pub trait SequenceLocator: Send + Sync {
    async fn locate(
        &self,
        node: &BrokerNode,
        block_id: &str,
        block_num: u64,
    ) -> Result<u64, SubscribeError>;
}

/// Operational notification emitted when the subscriber fails over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailoverAlert {
    pub service_name: String,
    pub from_node: String,
    pub to_node: String,
}

/// Pluggable alerting sink. Not part of the core's correctness contract —
/// failures here are logged, never propagated.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify_failover(&self, alert: &FailoverAlert);
}

/// Default sink: structured log output only.
#[derive(Debug, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify_failover(&self, alert: &FailoverAlert) {
        tracing::error!(
            service = %alert.service_name,
            from_node = %alert.from_node,
            to_node = %alert.to_node,
            "broker failover"
        );
    }
}
