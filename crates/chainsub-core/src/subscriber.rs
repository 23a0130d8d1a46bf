//! Block subscriber — the composition root.
//!
//! Wires cursor, journal, replayer and connection controller together,
//! performs startup recovery, and exposes the operator-facing cursor
//! controls. Applications construct one of these, hand it a
//! [`BlockHandler`], and call [`run`](BlockSubscriber::run).

use std::sync::Arc;

use tokio::sync::watch;

use crate::broker::{AlertSink, Broker, LogAlertSink, SequenceLocator};
use crate::config::SubscriberConfig;
use crate::controller::ConnectionController;
use crate::cursor::{Cursor, CursorStore, CursorUpdate};
use crate::dispatch::BlockHandler;
use crate::error::SubscribeError;
use crate::journal::{ForkJournal, JournalStore};
use crate::replay::{CursorReset, DocumentStore, ForkReplayer};

/// Ordered, crash-safe block subscription over an unreliable broker.
pub struct BlockSubscriber {
    config: SubscriberConfig,
    broker: Arc<dyn Broker>,
    locator: Arc<dyn SequenceLocator>,
    alerts: Arc<dyn AlertSink>,
    cursor_store: Arc<dyn CursorStore>,
    journal: Arc<ForkJournal<dyn JournalStore>>,
    replayer: Arc<ForkReplayer>,
}

impl BlockSubscriber {
    pub fn new(
        config: SubscriberConfig,
        broker: Arc<dyn Broker>,
        locator: Arc<dyn SequenceLocator>,
        cursor_store: Arc<dyn CursorStore>,
        journal_store: Arc<dyn JournalStore>,
        documents: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            config,
            broker,
            locator,
            alerts: Arc::new(LogAlertSink),
            cursor_store,
            journal: Arc::new(ForkJournal::new(journal_store.clone())),
            replayer: Arc::new(ForkReplayer::new(journal_store, documents)),
        }
    }

    /// Replace the default log-only alert sink.
    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// The fork journal handlers record their document mutations into.
    pub fn journal(&self) -> Arc<ForkJournal<dyn JournalStore>> {
        self.journal.clone()
    }

    /// Roll back every journaled block above `base_block_num` and rewrite
    /// the cursor to the rollback anchor. Handlers call this when they
    /// receive a fork event.
    pub async fn rollback(&self, base_block_num: u64) -> Result<(), SubscribeError> {
        let reset = self.replayer.revert(base_block_num).await?;
        self.reset_cursor(reset).await
    }

    /// Run until shutdown is signalled or a fatal error occurs.
    ///
    /// Performs startup recovery first: any unfinalized journal rows left by
    /// a crash mid-block are undone and the cursor is pulled back to the
    /// last finalized block, so the broker replays the partial block whole.
    pub async fn run(
        &self,
        handler: Arc<dyn BlockHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), SubscribeError> {
        if let Some(reset) = self.replayer.revert_unfinalized().await? {
            tracing::warn!(
                last_block_num = reset.last_block_num,
                "crash recovery rolled the cursor back"
            );
            self.reset_cursor(reset).await?;
        }

        let mut controller = ConnectionController::new(
            self.config.clone(),
            self.broker.clone(),
            self.locator.clone(),
            self.alerts.clone(),
            self.cursor_store.clone(),
            handler,
        );
        controller.run(shutdown).await
    }

    // ─── Operator controls ───────────────────────────────────────────────

    /// The persisted cursor, if any.
    pub async fn last_block_meta(&self) -> Result<Option<Cursor>, SubscribeError> {
        self.cursor_store.load().await
    }

    /// Override cursor fields (incident recovery). Unset fields keep their
    /// current value; on a fresh store the remaining fields default to zero
    /// and the configured active node.
    pub async fn set_last_block_meta(&self, update: CursorUpdate) -> Result<(), SubscribeError> {
        let mut cursor = match self.cursor_store.load().await? {
            Some(c) => c,
            None => Cursor::new(0, 0, self.config.active_node_id.clone()),
        };
        cursor.apply(update);
        self.cursor_store.save(&cursor).await
    }

    /// Rewrite the cursor's block fields after a rollback, keeping the
    /// node id.
    async fn reset_cursor(&self, reset: CursorReset) -> Result<(), SubscribeError> {
        self.set_last_block_meta(CursorUpdate {
            last_block_num: Some(reset.last_block_num),
            last_block_sequence: Some(reset.last_block_sequence),
            node_id: None,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    struct MemCursor(Mutex<Option<Cursor>>);

    #[async_trait]
    impl CursorStore for MemCursor {
        async fn load(&self) -> Result<Option<Cursor>, SubscribeError> {
            Ok(self.0.lock().unwrap().clone())
        }
        async fn save(&self, cursor: &Cursor) -> Result<(), SubscribeError> {
            *self.0.lock().unwrap() = Some(cursor.clone());
            Ok(())
        }
    }

    fn subscriber(cursor: Option<Cursor>) -> (BlockSubscriber, Arc<MemCursor>) {
        use crate::broker::{BrokerConnection, BrokerNode, ResumePoint};
        use crate::journal::{ChangeRecord, JournalEntry};
        use serde_json::Value;

        struct NoBroker;
        #[async_trait]
        impl Broker for NoBroker {
            async fn connect(
                &self,
                _node: &BrokerNode,
                _resume: &ResumePoint,
            ) -> Result<Box<dyn BrokerConnection>, SubscribeError> {
                Err(SubscribeError::Broker("unused".into()))
            }
        }

        struct NoLocator;
        #[async_trait]
        impl SequenceLocator for NoLocator {
            async fn locate(
                &self,
                _node: &BrokerNode,
                _block_id: &str,
                _block_num: u64,
            ) -> Result<u64, SubscribeError> {
                Err(SubscribeError::Broker("unused".into()))
            }
        }

        struct NoJournal;
        #[async_trait]
        impl JournalStore for NoJournal {
            async fn insert_entry(&self, _entry: JournalEntry) -> Result<(), SubscribeError> {
                Ok(())
            }
            async fn push_change(
                &self,
                _block_num: u64,
                _change: ChangeRecord,
            ) -> Result<(), SubscribeError> {
                Ok(())
            }
            async fn mark_finalized(&self, _block_num: u64) -> Result<(), SubscribeError> {
                Ok(())
            }
            async fn entries_at_or_above(
                &self,
                _base: u64,
            ) -> Result<Vec<JournalEntry>, SubscribeError> {
                Ok(vec![])
            }
            async fn top_entries(&self, _limit: usize) -> Result<Vec<JournalEntry>, SubscribeError> {
                Ok(vec![])
            }
            async fn delete_entry(&self, _block_num: u64) -> Result<(), SubscribeError> {
                Ok(())
            }
            async fn delete_above(&self, _base: u64) -> Result<(), SubscribeError> {
                Ok(())
            }
            async fn delete_below(&self, _watermark: u64) -> Result<(), SubscribeError> {
                Ok(())
            }
        }

        struct NoDocs;
        #[async_trait]
        impl DocumentStore for NoDocs {
            async fn delete(&self, _collection: &str, _id: &str) -> Result<(), SubscribeError> {
                Ok(())
            }
            async fn overwrite(
                &self,
                _collection: &str,
                _id: &str,
                _image: Value,
            ) -> Result<(), SubscribeError> {
                Ok(())
            }
            async fn insert(
                &self,
                _collection: &str,
                _id: &str,
                _image: Value,
            ) -> Result<(), SubscribeError> {
                Ok(())
            }
        }

        let store = Arc::new(MemCursor(Mutex::new(cursor)));
        let sub = BlockSubscriber::new(
            SubscriberConfig {
                active_node_id: "node-1".into(),
                ..Default::default()
            },
            Arc::new(NoBroker),
            Arc::new(NoLocator),
            store.clone(),
            Arc::new(NoJournal),
            Arc::new(NoDocs),
        );
        (sub, store)
    }

    #[tokio::test]
    async fn set_last_block_meta_merges_into_existing_cursor() {
        let (sub, store) = subscriber(Some(Cursor::new(100, 512, "node-1")));

        sub.set_last_block_meta(CursorUpdate {
            last_block_sequence: Some(600),
            ..Default::default()
        })
        .await
        .unwrap();

        let cursor = store.load().await.unwrap().unwrap();
        assert_eq!(cursor.last_block_num, 100);
        assert_eq!(cursor.last_block_sequence, 600);
        assert_eq!(cursor.node_id, "node-1");
    }

    #[tokio::test]
    async fn set_last_block_meta_creates_cursor_on_fresh_store() {
        let (sub, store) = subscriber(None);

        sub.set_last_block_meta(CursorUpdate {
            last_block_num: Some(42),
            ..Default::default()
        })
        .await
        .unwrap();

        let cursor = store.load().await.unwrap().unwrap();
        assert_eq!(cursor.last_block_num, 42);
        assert_eq!(cursor.last_block_sequence, 0);
        assert_eq!(cursor.node_id, "node-1");
    }

    #[tokio::test]
    async fn last_block_meta_reads_through() {
        let (sub, _store) = subscriber(Some(Cursor::new(7, 70, "node-1")));
        let cursor = sub.last_block_meta().await.unwrap().unwrap();
        assert_eq!(cursor.last_block_num, 7);
    }
}
