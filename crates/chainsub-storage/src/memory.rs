//! In-memory storage backend.
//!
//! Holds the cursor, fork journal, and document collections in RAM.
//! Useful for tests and short-lived subscribers that don't need
//! persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use chainsub_core::cursor::{Cursor, CursorStore};
use chainsub_core::error::SubscribeError;
use chainsub_core::journal::{ChangeRecord, JournalEntry, JournalStore};
use chainsub_core::replay::DocumentStore;

/// In-memory subscriber storage.
///
/// Implements all three persistence traits on one value. All data is lost
/// when the process exits.
#[derive(Default)]
pub struct MemoryStorage {
    cursor: Mutex<Option<Cursor>>,
    journal: Mutex<BTreeMap<u64, JournalEntry>>,
    collections: Mutex<HashMap<String, HashMap<String, Value>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document (test setup).
    pub fn put_document(&self, collection: &str, id: &str, body: Value) {
        self.collections
            .lock()
            .unwrap()
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), body);
    }

    /// Look up a document.
    pub fn get_document(&self, collection: &str, id: &str) -> Option<Value> {
        self.collections
            .lock()
            .unwrap()
            .get(collection)?
            .get(id)
            .cloned()
    }

    /// Number of journal rows currently held.
    pub fn journal_len(&self) -> usize {
        self.journal.lock().unwrap().len()
    }

    /// Block numbers of all journal rows, ascending.
    pub fn journal_block_nums(&self) -> Vec<u64> {
        self.journal.lock().unwrap().keys().copied().collect()
    }
}

#[async_trait]
impl CursorStore for MemoryStorage {
    async fn load(&self) -> Result<Option<Cursor>, SubscribeError> {
        Ok(self.cursor.lock().unwrap().clone())
    }

    async fn save(&self, cursor: &Cursor) -> Result<(), SubscribeError> {
        *self.cursor.lock().unwrap() = Some(cursor.clone());
        Ok(())
    }
}

#[async_trait]
impl JournalStore for MemoryStorage {
    async fn insert_entry(&self, entry: JournalEntry) -> Result<(), SubscribeError> {
        self.journal.lock().unwrap().insert(entry.block_num, entry);
        Ok(())
    }

    async fn push_change(
        &self,
        block_num: u64,
        change: ChangeRecord,
    ) -> Result<(), SubscribeError> {
        let mut journal = self.journal.lock().unwrap();
        let entry = journal
            .get_mut(&block_num)
            .ok_or_else(|| SubscribeError::Storage(format!("no journal entry at {block_num}")))?;
        entry.stack.push(change);
        Ok(())
    }

    async fn mark_finalized(&self, block_num: u64) -> Result<(), SubscribeError> {
        if let Some(entry) = self.journal.lock().unwrap().get_mut(&block_num) {
            entry.finalized = true;
        }
        Ok(())
    }

    async fn entries_at_or_above(&self, base: u64) -> Result<Vec<JournalEntry>, SubscribeError> {
        Ok(self
            .journal
            .lock()
            .unwrap()
            .range(base..)
            .rev()
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn top_entries(&self, limit: usize) -> Result<Vec<JournalEntry>, SubscribeError> {
        Ok(self
            .journal
            .lock()
            .unwrap()
            .values()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_entry(&self, block_num: u64) -> Result<(), SubscribeError> {
        self.journal.lock().unwrap().remove(&block_num);
        Ok(())
    }

    async fn delete_above(&self, base: u64) -> Result<(), SubscribeError> {
        self.journal.lock().unwrap().retain(|k, _| *k <= base);
        Ok(())
    }

    async fn delete_below(&self, watermark: u64) -> Result<(), SubscribeError> {
        self.journal.lock().unwrap().retain(|k, _| *k >= watermark);
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStorage {
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
        self.put_document(collection, id, image);
        Ok(())
    }

    async fn insert(
        &self,
        collection: &str,
        id: &str,
        image: Value,
    ) -> Result<(), SubscribeError> {
        self.put_document(collection, id, image);
        Ok(())
    }
}
