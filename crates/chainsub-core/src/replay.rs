//! Fork replayer — transactional rollback of journaled mutations.
//!
//! On a FORK event the replayer walks the journal backward from the newest
//! block down to (but excluding) the fork's base block, undoing each
//! recorded mutation most-recent-first, then deletes the undone rows. On
//! process start it performs the same walk over any unfinalized trailing
//! rows left behind by a crash.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::SubscribeError;
use crate::journal::{ChangeOp, JournalEntry, JournalStore};

/// The narrow document-store surface needed to undo mutations.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn delete(&self, collection: &str, id: &str) -> Result<(), SubscribeError>;
    async fn overwrite(
        &self,
        collection: &str,
        id: &str,
        image: Value,
    ) -> Result<(), SubscribeError>;
    async fn insert(
        &self,
        collection: &str,
        id: &str,
        image: Value,
    ) -> Result<(), SubscribeError>;
}

/// Where the subscriber must resume after a rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorReset {
    pub last_block_num: u64,
    pub last_block_sequence: u64,
}

/// During startup recovery, the journal window to inspect for unfinalized
/// trailing rows.
const RECOVERY_WINDOW: usize = 10;

/// Undoes journaled mutations on fork or after a crash.
pub struct ForkReplayer {
    journal: Arc<dyn JournalStore>,
    documents: Arc<dyn DocumentStore>,
}

impl ForkReplayer {
    pub fn new(journal: Arc<dyn JournalStore>, documents: Arc<dyn DocumentStore>) -> Self {
        Self { journal, documents }
    }

    /// Roll back every journaled block strictly above `base_block_num`.
    ///
    /// The entry exactly at the base must exist — it is the state we are
    /// rolling back *to*. Returns the resume point taken from that entry.
    /// The final range delete is idempotent, so a re-entrant rollback (e.g.
    /// failover racing a natural fork) is safe.
    pub async fn revert(&self, base_block_num: u64) -> Result<CursorReset, SubscribeError> {
        tracing::info!(base_block_num, "reverting journal on fork");

        let mut entries = self.journal.entries_at_or_above(base_block_num).await?;
        let anchor = match entries.pop() {
            Some(entry) if entry.block_num == base_block_num => entry,
            _ => return Err(SubscribeError::MissingRollbackAnchor { base_block_num }),
        };

        self.undo_entries(&entries).await?;
        self.journal.delete_above(base_block_num).await?;

        tracing::info!(base_block_num, "revert on fork done");
        Ok(CursorReset {
            last_block_num: anchor.block_num,
            last_block_sequence: anchor.block_sequence,
        })
    }

    /// Startup recovery: undo any unfinalized trailing rows and return the
    /// resume point of the most recent finalized row.
    ///
    /// Returns `None` when there is nothing to do (empty journal, or the
    /// newest row is finalized).
    pub async fn revert_unfinalized(&self) -> Result<Option<CursorReset>, SubscribeError> {
        let entries = self.journal.top_entries(RECOVERY_WINDOW).await?;
        let Some(top) = entries.first() else {
            return Ok(None);
        };
        if top.finalized {
            return Ok(None);
        }

        tracing::warn!(
            top_block_num = top.block_num,
            "unfinalized journal rows found, reverting crash-time partial blocks"
        );

        let mut unfinalized = Vec::new();
        let mut last_finalized = None;
        for entry in &entries {
            if entry.finalized {
                last_finalized = Some(entry);
                break;
            }
            unfinalized.push(entry.clone());
        }
        let Some(last_finalized) = last_finalized else {
            return Err(SubscribeError::NoFinalizedJournalEntry);
        };

        self.undo_entries(&unfinalized).await?;

        Ok(Some(CursorReset {
            last_block_num: last_finalized.block_num,
            last_block_sequence: last_finalized.block_sequence,
        }))
    }

    /// Undo entries (given newest-first) and delete each undone row.
    async fn undo_entries(&self, entries: &[JournalEntry]) -> Result<(), SubscribeError> {
        for entry in entries {
            if !entry.stack.is_empty() {
                tracing::info!(block_num = entry.block_num, "reverting block");
                for change in entry.stack.iter().rev() {
                    match change.op {
                        ChangeOp::Create => {
                            self.documents
                                .delete(&change.collection, &change.document_id)
                                .await?;
                        }
                        ChangeOp::Update => {
                            self.documents
                                .overwrite(
                                    &change.collection,
                                    &change.document_id,
                                    change.before_image.clone(),
                                )
                                .await?;
                        }
                        ChangeOp::Remove => {
                            self.documents
                                .insert(
                                    &change.collection,
                                    &change.document_id,
                                    change.before_image.clone(),
                                )
                                .await?;
                        }
                    }
                }
            }
            self.journal.delete_entry(entry.block_num).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    use chrono::Utc;

    use crate::journal::ChangeRecord;

    #[derive(Default)]
    struct MemJournal {
        entries: Mutex<BTreeMap<u64, JournalEntry>>,
    }

    #[async_trait]
    impl JournalStore for MemJournal {
        async fn insert_entry(&self, entry: JournalEntry) -> Result<(), SubscribeError> {
            self.entries.lock().unwrap().insert(entry.block_num, entry);
            Ok(())
        }
        async fn push_change(
            &self,
            block_num: u64,
            change: ChangeRecord,
        ) -> Result<(), SubscribeError> {
            self.entries
                .lock()
                .unwrap()
                .get_mut(&block_num)
                .unwrap()
                .stack
                .push(change);
            Ok(())
        }
        async fn mark_finalized(&self, block_num: u64) -> Result<(), SubscribeError> {
            if let Some(e) = self.entries.lock().unwrap().get_mut(&block_num) {
                e.finalized = true;
            }
            Ok(())
        }
        async fn entries_at_or_above(
            &self,
            base: u64,
        ) -> Result<Vec<JournalEntry>, SubscribeError> {
            Ok(self
                .entries
                .lock()
                .unwrap()
                .range(base..)
                .rev()
                .map(|(_, e)| e.clone())
                .collect())
        }
        async fn top_entries(&self, limit: usize) -> Result<Vec<JournalEntry>, SubscribeError> {
            Ok(self
                .entries
                .lock()
                .unwrap()
                .values()
                .rev()
                .take(limit)
                .cloned()
                .collect())
        }
        async fn delete_entry(&self, block_num: u64) -> Result<(), SubscribeError> {
            self.entries.lock().unwrap().remove(&block_num);
            Ok(())
        }
        async fn delete_above(&self, base: u64) -> Result<(), SubscribeError> {
            self.entries.lock().unwrap().retain(|k, _| *k <= base);
            Ok(())
        }
        async fn delete_below(&self, watermark: u64) -> Result<(), SubscribeError> {
            self.entries.lock().unwrap().retain(|k, _| *k >= watermark);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemDocs {
        collections: Mutex<HashMap<String, HashMap<String, Value>>>,
    }

    impl MemDocs {
        fn put(&self, collection: &str, id: &str, body: Value) {
            self.collections
                .lock()
                .unwrap()
                .entry(collection.to_string())
                .or_default()
                .insert(id.to_string(), body);
        }

        fn get(&self, collection: &str, id: &str) -> Option<Value> {
            self.collections
                .lock()
                .unwrap()
                .get(collection)?
                .get(id)
                .cloned()
        }
    }

    #[async_trait]
    impl DocumentStore for MemDocs {
        async fn delete(&self, collection: &str, id: &str) -> Result<(), SubscribeError> {
            if let Some(c) = self.collections.lock().unwrap().get_mut(collection) {
                c.remove(id);
            }
            Ok(())
        }
        async fn overwrite(
            &self,
            collection: &str,
            id: &str,
            image: Value,
        ) -> Result<(), SubscribeError> {
            self.put(collection, id, image);
            Ok(())
        }
        async fn insert(
            &self,
            collection: &str,
            id: &str,
            image: Value,
        ) -> Result<(), SubscribeError> {
            self.put(collection, id, image);
            Ok(())
        }
    }

    fn entry(block_num: u64, finalized: bool, stack: Vec<ChangeRecord>) -> JournalEntry {
        JournalEntry {
            block_num,
            block_time: Utc::now(),
            block_sequence: block_num * 10,
            finalized,
            stack,
        }
    }

    fn update(id: &str, before: Value) -> ChangeRecord {
        ChangeRecord {
            op: ChangeOp::Update,
            collection: "posts".into(),
            document_id: id.into(),
            before_image: before,
        }
    }

    async fn fixture() -> (Arc<MemJournal>, Arc<MemDocs>, ForkReplayer) {
        let journal = Arc::new(MemJournal::default());
        let docs = Arc::new(MemDocs::default());
        let replayer = ForkReplayer::new(journal.clone(), docs.clone());
        (journal, docs, replayer)
    }

    #[tokio::test]
    async fn revert_restores_before_images_and_prunes_rows() {
        let (journal, docs, replayer) = fixture().await;

        // Blocks 10..=12 each updated the same document.
        for n in 10..=12u64 {
            journal
                .insert_entry(entry(
                    n,
                    true,
                    vec![update("doc-1", serde_json::json!({"v": n - 1}))],
                ))
                .await
                .unwrap();
        }
        docs.put("posts", "doc-1", serde_json::json!({"v": 12}));

        let reset = replayer.revert(10).await.unwrap();
        assert_eq!(reset.last_block_num, 10);
        assert_eq!(reset.last_block_sequence, 100);

        // Undone newest-first: block 12's before-image, then block 11's —
        // the document ends at its block-10 value.
        assert_eq!(
            docs.get("posts", "doc-1").unwrap(),
            serde_json::json!({"v": 10})
        );

        let nums: Vec<u64> = journal.entries.lock().unwrap().keys().copied().collect();
        assert_eq!(nums, vec![10]);
    }

    #[tokio::test]
    async fn revert_undoes_stack_in_reverse_insertion_order() {
        let (journal, docs, replayer) = fixture().await;

        // Within block 11 the same document was updated twice; the *first*
        // before-image must win after rollback.
        journal.insert_entry(entry(10, true, vec![])).await.unwrap();
        journal
            .insert_entry(entry(
                11,
                true,
                vec![
                    update("doc-1", serde_json::json!({"step": 0})),
                    update("doc-1", serde_json::json!({"step": 1})),
                ],
            ))
            .await
            .unwrap();
        docs.put("posts", "doc-1", serde_json::json!({"step": 2}));

        replayer.revert(10).await.unwrap();

        assert_eq!(
            docs.get("posts", "doc-1").unwrap(),
            serde_json::json!({"step": 0})
        );
    }

    #[tokio::test]
    async fn revert_undoes_create_and_remove() {
        let (journal, docs, replayer) = fixture().await;

        journal.insert_entry(entry(10, true, vec![])).await.unwrap();
        journal
            .insert_entry(entry(
                11,
                true,
                vec![
                    ChangeRecord {
                        op: ChangeOp::Create,
                        collection: "posts".into(),
                        document_id: "created".into(),
                        before_image: Value::Null,
                    },
                    ChangeRecord {
                        op: ChangeOp::Remove,
                        collection: "posts".into(),
                        document_id: "removed".into(),
                        before_image: serde_json::json!({"kept": true}),
                    },
                ],
            ))
            .await
            .unwrap();
        docs.put("posts", "created", serde_json::json!({"fresh": true}));

        replayer.revert(10).await.unwrap();

        assert!(docs.get("posts", "created").is_none());
        assert_eq!(
            docs.get("posts", "removed").unwrap(),
            serde_json::json!({"kept": true})
        );
    }

    #[tokio::test]
    async fn missing_anchor_is_fatal() {
        let (journal, _docs, replayer) = fixture().await;
        journal.insert_entry(entry(11, true, vec![])).await.unwrap();

        let err = replayer.revert(10).await.unwrap_err();
        assert!(matches!(
            err,
            SubscribeError::MissingRollbackAnchor { base_block_num: 10 }
        ));
    }

    #[tokio::test]
    async fn revert_unfinalized_rolls_back_crash_tail() {
        let (journal, docs, replayer) = fixture().await;

        journal.insert_entry(entry(10, true, vec![])).await.unwrap();
        journal
            .insert_entry(entry(
                11,
                false,
                vec![update("doc-1", serde_json::json!({"v": 10}))],
            ))
            .await
            .unwrap();
        docs.put("posts", "doc-1", serde_json::json!({"v": 11}));

        let reset = replayer.revert_unfinalized().await.unwrap().unwrap();
        assert_eq!(reset.last_block_num, 10);
        assert_eq!(
            docs.get("posts", "doc-1").unwrap(),
            serde_json::json!({"v": 10})
        );
        // The unfinalized row is gone.
        assert!(journal.entries.lock().unwrap().get(&11).is_none());
    }

    #[tokio::test]
    async fn revert_unfinalized_noop_on_clean_journal() {
        let (journal, _docs, replayer) = fixture().await;
        assert!(replayer.revert_unfinalized().await.unwrap().is_none());

        journal.insert_entry(entry(10, true, vec![])).await.unwrap();
        assert!(replayer.revert_unfinalized().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn revert_unfinalized_without_finalized_row_is_fatal() {
        let (journal, _docs, replayer) = fixture().await;
        journal
            .insert_entry(entry(11, false, vec![]))
            .await
            .unwrap();

        let err = replayer.revert_unfinalized().await.unwrap_err();
        assert!(matches!(err, SubscribeError::NoFinalizedJournalEntry));
    }
}
