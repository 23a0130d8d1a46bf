//! Subscriber configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::BrokerNode;

/// Configuration for a [`BlockSubscriber`](crate::subscriber::BlockSubscriber).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberConfig {
    /// Service name, reported in failover alerts.
    pub service_name: String,
    /// All configured broker nodes. Failover picks an alternate from here.
    pub nodes: Vec<BrokerNode>,
    /// Node id to connect to first (when no cursor has been persisted yet).
    pub active_node_id: String,
    /// How to derive the resume point on a fresh start.
    pub resume: ResumeMode,
    /// How long to wait for a block's transactions before the missing-
    /// transaction policy applies (milliseconds).
    pub trx_wait_timeout_ms: u64,
    /// What to do when the assembly deadline passes with unresolved
    /// transactions.
    pub on_missing_transactions: MissingTrxPolicy,
    /// Include expired transactions in emitted blocks.
    pub include_expired: bool,
    /// Zero inbound messages within this window triggers a reconnect
    /// (milliseconds).
    pub activity_timeout_ms: u64,
    /// Fixed delay between reconnect attempts (milliseconds).
    pub reconnect_delay_ms: u64,
    /// Consecutive failed/unproductive connections before attempting
    /// failover to an alternate node.
    pub max_connection_failures: u32,
    /// Soft cap on the internal dispatch queue. Every push drains the queue
    /// before returning, so at any point it holds at most the fan-out of a
    /// single inbound message plus whatever a re-entrant handler produced;
    /// exceeding the cap is logged rather than enforced, since dropping or
    /// blocking here would break ordered delivery.
    pub event_queue_capacity: usize,
}

/// Where to start the subscription when no cursor exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeMode {
    /// Resume strictly from the persisted cursor (sequence + 1).
    FromCursor,
    /// First run / recent-only mode: subscribe from a bounded time offset.
    RecentOnly {
        /// Maximum age of messages to replay (milliseconds).
        max_age_ms: u64,
    },
}

/// Reconciliation strategy for transactions still unresolved at the assembly
/// deadline. The production default is strict; skipping is an explicit
/// opt-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingTrxPolicy {
    /// Treat a missing transaction as a fatal protocol violation.
    Fatal,
    /// Log every missing id and finalize the block without them.
    Skip,
}

impl SubscriberConfig {
    pub fn trx_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.trx_wait_timeout_ms)
    }

    pub fn activity_timeout(&self) -> Duration {
        Duration::from_millis(self.activity_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Look up a node by id.
    pub fn node(&self, node_id: &str) -> Option<&BrokerNode> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            service_name: "chainsub".into(),
            nodes: vec![],
            active_node_id: "default".into(),
            resume: ResumeMode::FromCursor,
            trx_wait_timeout_ms: 10_000,
            on_missing_transactions: MissingTrxPolicy::Fatal,
            include_expired: false,
            activity_timeout_ms: 60_000,
            reconnect_delay_ms: 5_000,
            max_connection_failures: 3,
            event_queue_capacity: 1_000,
        }
    }
}
