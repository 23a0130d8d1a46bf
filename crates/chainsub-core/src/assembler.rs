//! Block assembler — the block reconstruction state machine.
//!
//! Consumes accept events and apply-transaction events, produces immutable
//! [`Block`] values, and flags forks. At most one candidate block is open at
//! a time; accept events arriving while one is open are queued.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::assembly::TransactionAssembly;
use crate::config::MissingTrxPolicy;
use crate::error::SubscribeError;
use crate::types::{Block, BlockAccepted, BlockTransaction, TrxApplied, TrxStatus};

/// Output of the assembler, in emission order.
///
/// A `Fork` always precedes the block whose number triggered it.
#[derive(Debug, Clone, PartialEq)]
pub enum AssemblerOutput {
    Fork { base_block_num: u64 },
    Block(Block),
}

/// The currently open reversible block.
#[derive(Debug)]
struct CandidateBlock {
    accepted: BlockAccepted,
    sequence: u64,
    deadline: Instant,
}

/// Reconstructs blocks from accept/apply events.
pub struct BlockAssembler {
    assembly: TransactionAssembly,
    candidate: Option<CandidateBlock>,
    /// Accept events queued behind the open candidate (single-flight).
    queued: VecDeque<(BlockAccepted, u64)>,
    last_emitted_block_num: Option<u64>,
    last_processed_sequence: u64,
    trx_wait_timeout: Duration,
    policy: MissingTrxPolicy,
    include_expired: bool,
}

impl BlockAssembler {
    pub fn new(
        trx_wait_timeout: Duration,
        policy: MissingTrxPolicy,
        include_expired: bool,
    ) -> Self {
        Self {
            assembly: TransactionAssembly::new(),
            candidate: None,
            queued: VecDeque::new(),
            last_emitted_block_num: None,
            last_processed_sequence: 0,
            trx_wait_timeout,
            policy,
            include_expired,
        }
    }

    /// Handle a block-accepted event.
    pub fn on_accept(
        &mut self,
        accepted: BlockAccepted,
        sequence: u64,
    ) -> Result<Vec<AssemblerOutput>, SubscribeError> {
        if self.candidate.is_some() {
            self.queued.push_back((accepted, sequence));
            return Ok(vec![]);
        }
        self.open(accepted, sequence);
        let mut out = Vec::new();
        self.pump(&mut out);
        Ok(out)
    }

    /// Handle a transaction-applied event.
    pub fn on_trx(&mut self, trx: TrxApplied) -> Result<Vec<AssemblerOutput>, SubscribeError> {
        self.assembly.insert(trx);
        let mut out = Vec::new();
        self.pump(&mut out);
        Ok(out)
    }

    /// Deadline of the open candidate, if any. The connection loop arms a
    /// timer against this and calls [`on_deadline`](Self::on_deadline) when
    /// it fires.
    pub fn deadline(&self) -> Option<Instant> {
        self.candidate.as_ref().map(|c| c.deadline)
    }

    /// The assembly deadline fired. Logs every missing transaction id, then
    /// either finalizes without them or fails, per policy.
    pub fn on_deadline(&mut self) -> Result<Vec<AssemblerOutput>, SubscribeError> {
        let Some(candidate) = &self.candidate else {
            return Ok(vec![]);
        };
        if Instant::now() < candidate.deadline {
            return Ok(vec![]);
        }

        let block_num = candidate.accepted.block_num;
        let missing = self
            .assembly
            .missing_for(block_num, &candidate.accepted.trx_ids);
        for trx_id in &missing {
            tracing::warn!(block_num, trx_id = %trx_id, "transaction unresolved at assembly deadline");
        }

        match self.policy {
            MissingTrxPolicy::Fatal => Err(SubscribeError::MissingTransactions {
                block_num,
                trx_ids: missing,
            }),
            MissingTrxPolicy::Skip => {
                let candidate = self.candidate.take().expect("candidate checked above");
                let mut out = Vec::new();
                let block = self.build(candidate);
                self.emit(block, &mut out);
                if let Some((accepted, sequence)) = self.queued.pop_front() {
                    self.open(accepted, sequence);
                }
                self.pump(&mut out);
                Ok(out)
            }
        }
    }

    /// Prune transaction buffers behind the irreversible watermark.
    pub fn prune_transactions(&mut self, watermark: u64) {
        self.assembly.prune_at_or_below(watermark);
    }

    /// Broker sequence of the last finalized block.
    pub fn last_processed_sequence(&self) -> u64 {
        self.last_processed_sequence
    }

    /// Drop all in-flight state and restart emission tracking from `base`
    /// (failover / rollback reset). The next emitted block is expected to be
    /// `base + 1`; anything else flags a fork again.
    pub fn reset_to(&mut self, base_block_num: u64) {
        self.candidate = None;
        self.queued.clear();
        self.assembly.clear();
        self.last_emitted_block_num = Some(base_block_num);
    }

    fn open(&mut self, accepted: BlockAccepted, sequence: u64) {
        self.candidate = Some(CandidateBlock {
            deadline: Instant::now() + self.trx_wait_timeout,
            accepted,
            sequence,
        });
    }

    /// Finalize candidates as long as their manifests are fully resolved,
    /// opening queued accepts as candidates complete.
    fn pump(&mut self, out: &mut Vec<AssemblerOutput>) {
        loop {
            let ready = match &self.candidate {
                Some(c) => self
                    .assembly
                    .missing_for(c.accepted.block_num, &c.accepted.trx_ids)
                    .is_empty(),
                None => false,
            };
            if !ready {
                return;
            }
            let candidate = self.candidate.take().expect("ready implies candidate");
            let block = self.build(candidate);
            self.emit(block, out);
            if let Some((accepted, sequence)) = self.queued.pop_front() {
                self.open(accepted, sequence);
            }
        }
    }

    /// Build the immutable block. Transactions follow the manifest order;
    /// unresolved ids (skip policy) and expired transactions (per config)
    /// are simply absent.
    fn build(&mut self, candidate: CandidateBlock) -> Block {
        let accepted = candidate.accepted;
        let mut transactions = Vec::with_capacity(accepted.trx_ids.len());
        for trx_id in &accepted.trx_ids {
            if let Some(pending) = self.assembly.take(accepted.block_num, trx_id) {
                if pending.status == TrxStatus::Expired && !self.include_expired {
                    continue;
                }
                transactions.push(BlockTransaction {
                    id: pending.id,
                    actions: pending.actions,
                    status: pending.status,
                });
            }
        }
        Block {
            id: accepted.id,
            parent_id: accepted.parent_id,
            block_num: accepted.block_num,
            block_time: accepted.block_time,
            sequence: candidate.sequence,
            transactions,
            counters: accepted.counters,
        }
    }

    fn emit(&mut self, block: Block, out: &mut Vec<AssemblerOutput>) {
        if let Some(prev) = self.last_emitted_block_num {
            if block.block_num != prev + 1 {
                let base_block_num = block.block_num - 1;
                tracing::warn!(
                    prev_block_num = prev,
                    block_num = block.block_num,
                    base_block_num,
                    "block number discontinuity, raising fork"
                );
                out.push(AssemblerOutput::Fork { base_block_num });
            }
        }
        self.last_emitted_block_num = Some(block.block_num);
        self.last_processed_sequence = block.sequence;
        self.assembly.prune_at_or_below(block.block_num);
        out.push(AssemblerOutput::Block(block));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn accepted(block_num: u64, trx_ids: &[&str]) -> BlockAccepted {
        BlockAccepted {
            id: format!("blk-{block_num}"),
            parent_id: format!("blk-{}", block_num - 1),
            block_num,
            block_time: Utc::now(),
            trx_ids: trx_ids.iter().map(|s| s.to_string()).collect(),
            counters: Default::default(),
        }
    }

    fn trx(block_num: u64, id: &str) -> TrxApplied {
        TrxApplied {
            id: id.to_string(),
            block_num,
            actions: vec![serde_json::json!({"name": "transfer"})],
            status: TrxStatus::Executed,
        }
    }

    fn assembler() -> BlockAssembler {
        BlockAssembler::new(Duration::from_secs(10), MissingTrxPolicy::Fatal, false)
    }

    fn blocks(out: &[AssemblerOutput]) -> Vec<u64> {
        out.iter()
            .filter_map(|o| match o {
                AssemblerOutput::Block(b) => Some(b.block_num),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn empty_block_finalizes_immediately() {
        let mut asm = assembler();
        let out = asm.on_accept(accepted(10, &[]), 100).unwrap();
        assert_eq!(blocks(&out), vec![10]);
    }

    #[tokio::test]
    async fn block_waits_for_manifest() {
        let mut asm = assembler();
        let out = asm.on_accept(accepted(10, &["t1", "t2"]), 100).unwrap();
        assert!(out.is_empty());

        let out = asm.on_trx(trx(10, "t1")).unwrap();
        assert!(out.is_empty());

        let out = asm.on_trx(trx(10, "t2")).unwrap();
        assert_eq!(blocks(&out), vec![10]);
    }

    #[tokio::test]
    async fn transactions_follow_manifest_order() {
        let mut asm = assembler();
        // Arrival order t2, t1 — manifest says t1, t2.
        asm.on_trx(trx(10, "t2")).unwrap();
        asm.on_trx(trx(10, "t1")).unwrap();
        let out = asm.on_accept(accepted(10, &["t1", "t2"]), 100).unwrap();
        match &out[0] {
            AssemblerOutput::Block(b) => {
                let ids: Vec<&str> = b.transactions.iter().map(|t| t.id.as_str()).collect();
                assert_eq!(ids, vec!["t1", "t2"]);
            }
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_trx_not_duplicated_in_block() {
        let mut asm = assembler();
        asm.on_accept(accepted(10, &["t1"]), 100).unwrap();
        asm.on_trx(trx(10, "t1")).unwrap();
        let out = asm.on_trx(trx(10, "t1")).unwrap();
        // First delivery already finalized the block; the duplicate is a no-op.
        assert!(out.is_empty() || blocks(&out).is_empty());
    }

    #[tokio::test]
    async fn second_accept_is_queued_behind_open_candidate() {
        let mut asm = assembler();
        asm.on_accept(accepted(10, &["t1"]), 100).unwrap();
        let out = asm.on_accept(accepted(11, &[]), 101).unwrap();
        assert!(out.is_empty(), "single-flight: block 11 must wait");

        let out = asm.on_trx(trx(10, "t1")).unwrap();
        assert_eq!(blocks(&out), vec![10, 11]);
    }

    #[tokio::test]
    async fn non_increasing_block_num_raises_fork_before_block() {
        let mut asm = assembler();
        asm.on_accept(accepted(10, &[]), 100).unwrap();
        asm.on_accept(accepted(11, &[]), 101).unwrap();
        // The chain switched branches: block 11 arrives again.
        let out = asm.on_accept(accepted(11, &[]), 102).unwrap();
        assert_eq!(
            out[0],
            AssemblerOutput::Fork {
                base_block_num: 10
            }
        );
        assert_eq!(blocks(&out), vec![11]);
    }

    #[tokio::test]
    async fn first_emission_never_forks() {
        let mut asm = assembler();
        let out = asm.on_accept(accepted(500, &[]), 100).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(blocks(&out), vec![500]);
    }

    #[tokio::test]
    async fn expired_transactions_are_skipped_by_default() {
        let mut asm = assembler();
        let mut expired = trx(10, "t1");
        expired.status = TrxStatus::Expired;
        asm.on_trx(expired).unwrap();
        let out = asm.on_accept(accepted(10, &["t1"]), 100).unwrap();
        match &out[0] {
            AssemblerOutput::Block(b) => assert!(b.transactions.is_empty()),
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[tokio::test]
    async fn deadline_fatal_policy_reports_missing_ids() {
        tokio::time::pause();
        let mut asm = BlockAssembler::new(Duration::from_secs(1), MissingTrxPolicy::Fatal, false);
        asm.on_accept(accepted(10, &["t1", "t2"]), 100).unwrap();
        asm.on_trx(trx(10, "t1")).unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        let err = asm.on_deadline().unwrap_err();
        match err {
            SubscribeError::MissingTransactions { block_num, trx_ids } => {
                assert_eq!(block_num, 10);
                assert_eq!(trx_ids, vec!["t2".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn deadline_skip_policy_finalizes_without_missing() {
        tokio::time::pause();
        let mut asm = BlockAssembler::new(Duration::from_secs(1), MissingTrxPolicy::Skip, false);
        asm.on_accept(accepted(10, &["t1", "t2"]), 100).unwrap();
        asm.on_trx(trx(10, "t1")).unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        let out = asm.on_deadline().unwrap();
        match &out[0] {
            AssemblerOutput::Block(b) => {
                assert_eq!(b.block_num, 10);
                assert_eq!(b.transactions.len(), 1);
                assert_eq!(b.transactions[0].id, "t1");
            }
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[tokio::test]
    async fn deadline_before_expiry_is_noop() {
        let mut asm = assembler();
        asm.on_accept(accepted(10, &["t1"]), 100).unwrap();
        assert!(asm.on_deadline().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reset_to_resumes_without_fork() {
        let mut asm = assembler();
        asm.on_accept(accepted(10, &[]), 100).unwrap();
        asm.on_accept(accepted(11, &[]), 101).unwrap();

        asm.reset_to(10);
        let out = asm.on_accept(accepted(11, &[]), 200).unwrap();
        // 11 == reset base + 1, no fork raised.
        assert_eq!(out.len(), 1);
        assert_eq!(blocks(&out), vec![11]);
    }
}
