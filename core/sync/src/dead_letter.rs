//! Mutations that failed permanently.
//!
//! A dead letter is written here before its entry leaves the queue, so the
//! failure stays visible after a restart and to callers that never
//! registered a summary listener. Entries stay until acknowledged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};

use outpost_common::{Clock, MutationId, Result};
use outpost_storage::{DurableStore, Record};

use crate::queue::QueuedMutation;

/// Store namespace holding dead letters, keyed by mutation id.
pub const DEAD_LETTER_NAMESPACE: &str = "dead_letter";

/// A mutation removed from the active queue without succeeding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The mutation as it was queued before its final attempt.
    pub mutation: QueuedMutation,
    /// Attempts made, including the final one.
    pub attempts: u32,
    /// Error from the final attempt.
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Durable list of dead letters awaiting acknowledgement.
pub struct DeadLetterStore {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
}

impl DeadLetterStore {
    pub fn new(store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Build a dead letter stamped with the current time.
    pub fn letter(&self, mutation: &QueuedMutation, attempts: u32, reason: String) -> DeadLetter {
        DeadLetter {
            mutation: mutation.clone(),
            attempts,
            reason,
            failed_at: self.clock.now(),
        }
    }

    /// Persist a dead letter. Writing the same mutation twice keeps one
    /// entry.
    pub async fn record(&self, letter: &DeadLetter) -> Result<()> {
        let value = serde_json::to_vec(letter)?;
        let record = Record::new(letter.mutation.id.as_str(), value, letter.failed_at);
        self.store.put(DEAD_LETTER_NAMESPACE, record).await?;
        debug!("Recorded dead letter {}", letter.mutation.id);
        Ok(())
    }

    /// All unacknowledged dead letters, oldest first.
    pub async fn list(&self) -> Result<Vec<DeadLetter>> {
        let records = self.store.list_all(DEAD_LETTER_NAMESPACE).await?;
        let mut letters = Vec::with_capacity(records.len());
        for record in &records {
            match serde_json::from_slice(&record.value) {
                Ok(letter) => letters.push(letter),
                Err(e) => error!("Skipping undecodable dead letter {}: {}", record.key, e),
            }
        }
        Ok(letters)
    }

    /// Drop a dead letter once the user has seen it.
    ///
    /// Returns whether it was present.
    pub async fn acknowledge(&self, id: &MutationId) -> Result<bool> {
        self.store.delete(DEAD_LETTER_NAMESPACE, id.as_str()).await
    }

    /// Drop every dead letter. Returns how many were removed.
    pub async fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for record in self.store.list_all(DEAD_LETTER_NAMESPACE).await? {
            if self.store.delete(DEAD_LETTER_NAMESPACE, &record.key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn len(&self) -> Result<usize> {
        self.store.count(DEAD_LETTER_NAMESPACE).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Total size in bytes.
    pub async fn size(&self) -> Result<u64> {
        self.store.size_of(DEAD_LETTER_NAMESPACE).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_common::{ManualClock, OperationKind, Target};
    use outpost_storage::MemoryStore;

    fn mutation(record: &str) -> QueuedMutation {
        QueuedMutation {
            id: MutationId::generate(),
            operation: OperationKind::Delete,
            target: Target::record("notices", record),
            payload: b"{}".to_vec(),
            enqueued_at: Utc::now(),
            retry_count: 2,
            max_retries: 3,
            attempts: 3,
        }
    }

    fn letters_over(store: MemoryStore) -> DeadLetterStore {
        DeadLetterStore::new(Arc::new(store), Arc::new(ManualClock::default()))
    }

    #[tokio::test]
    async fn test_record_and_list_survive_reopen() {
        let store = MemoryStore::new();
        let letters = letters_over(store.clone());

        let first = letters.letter(&mutation("1"), 3, "503".to_string());
        let second = letters.letter(&mutation("2"), 1, "422".to_string());
        letters.record(&first).await.unwrap();
        letters.record(&second).await.unwrap();

        let reopened = letters_over(store);
        assert_eq!(reopened.list().await.unwrap(), vec![first, second]);
        assert!(reopened.size().await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_recording_twice_keeps_one_entry() {
        let letters = letters_over(MemoryStore::new());
        let letter = letters.letter(&mutation("1"), 3, "503".to_string());

        letters.record(&letter).await.unwrap();
        letters.record(&letter).await.unwrap();

        assert_eq!(letters.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_acknowledge_and_clear() {
        let letters = letters_over(MemoryStore::new());
        let a = letters.letter(&mutation("1"), 3, "503".to_string());
        let b = letters.letter(&mutation("2"), 3, "503".to_string());
        let c = letters.letter(&mutation("3"), 3, "503".to_string());
        for letter in [&a, &b, &c] {
            letters.record(letter).await.unwrap();
        }

        assert!(letters.acknowledge(&a.mutation.id).await.unwrap());
        assert!(!letters.acknowledge(&a.mutation.id).await.unwrap());
        assert_eq!(letters.clear().await.unwrap(), 2);
        assert!(letters.is_empty().await.unwrap());
    }
}
