//! Durable, ordered queue of pending mutations.
//!
//! Entries are replayed strictly in enqueue order. The queue never reorders,
//! so a head entry that keeps failing holds back everything behind it until
//! it succeeds or is dead-lettered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};

use outpost_common::{Clock, Error, MutationId, OperationKind, Result, Target};
use outpost_storage::{DurableStore, Record};

/// Store namespace holding queued mutations, keyed by mutation id.
pub const QUEUE_NAMESPACE: &str = "queue";

/// A mutation waiting to be replayed against the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMutation {
    /// Unique ID, assigned at enqueue time.
    pub id: MutationId,
    /// What kind of mutation this is. Not interpreted by the queue.
    pub operation: OperationKind,
    /// Remote resource the mutation applies to.
    pub target: Target,
    /// Caller-supplied body, handed to the remote call untouched.
    #[serde(with = "payload_encoding")]
    pub payload: Vec<u8>,
    /// When the mutation was enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// Failed replay attempts so far.
    pub retry_count: u32,
    /// Ceiling after which the mutation is dead-lettered.
    pub max_retries: u32,
    /// Replay attempts started, written before each remote call. Runs ahead
    /// of `retry_count` when an attempt's outcome could not be recorded.
    #[serde(default)]
    pub attempts: u32,
}

impl QueuedMutation {
    /// Attempts made so far, recorded or not.
    pub fn attempts_made(&self) -> u32 {
        self.attempts.max(self.retry_count)
    }

    /// Whether one more failed attempt reaches the retry ceiling.
    pub fn is_last_attempt(&self) -> bool {
        self.attempts_made().saturating_add(1) >= self.max_retries
    }

    /// Whether the ceiling is already used up. Such an entry is never
    /// replayed again, only settled as a dead letter.
    pub fn is_exhausted(&self) -> bool {
        self.attempts_made() >= self.max_retries
    }

    fn to_record(&self) -> Result<Record> {
        let value = serde_json::to_vec(self)?;
        Ok(Record::new(self.id.as_str(), value, self.enqueued_at))
    }

    fn from_record(record: &Record) -> Result<Self> {
        Ok(serde_json::from_slice(&record.value)?)
    }
}

/// Payloads are arbitrary bytes; keep them compact in the JSON record.
mod payload_encoding {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Ordered durable buffer of [`QueuedMutation`]s.
///
/// Callers only ever enqueue. `remove` and `increment_retry` belong to the
/// sync engine and are serialized against each other.
pub struct MutationQueue {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
    write_lock: Mutex<()>,
}

impl MutationQueue {
    /// Create a queue over `store`. Entries already in the store (from a
    /// previous run) are picked up as-is.
    pub fn new(store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>, max_retries: u32) -> Self {
        Self {
            store,
            clock,
            max_retries,
            write_lock: Mutex::new(()),
        }
    }

    /// Append a mutation. Never waits on connectivity.
    ///
    /// # Errors
    /// - `StorageUnavailable` if the store rejects the write
    pub async fn enqueue(
        &self,
        operation: OperationKind,
        target: Target,
        payload: Vec<u8>,
    ) -> Result<MutationId> {
        let mutation = QueuedMutation {
            id: MutationId::generate(),
            operation,
            target,
            payload,
            enqueued_at: self.clock.now(),
            retry_count: 0,
            max_retries: self.max_retries,
            attempts: 0,
        };

        self.store
            .put(QUEUE_NAMESPACE, mutation.to_record()?)
            .await?;

        debug!(
            "Enqueued {} {} as {}",
            mutation.operation, mutation.target, mutation.id
        );
        Ok(mutation.id)
    }

    /// All pending mutations, oldest first.
    ///
    /// Records that fail to decode are logged and skipped so one corrupt
    /// entry cannot stall the rest of the queue.
    pub async fn list(&self) -> Result<Vec<QueuedMutation>> {
        let records = self.store.list_all(QUEUE_NAMESPACE).await?;
        let mut mutations = Vec::with_capacity(records.len());

        for record in &records {
            match QueuedMutation::from_record(record) {
                Ok(mutation) => mutations.push(mutation),
                Err(e) => error!("Skipping undecodable queue entry {}: {}", record.key, e),
            }
        }

        Ok(mutations)
    }

    /// Get a single pending mutation.
    pub async fn get(&self, id: &MutationId) -> Result<Option<QueuedMutation>> {
        match self.store.get(QUEUE_NAMESPACE, id.as_str()).await? {
            Some(record) => Ok(Some(QueuedMutation::from_record(&record)?)),
            None => Ok(None),
        }
    }

    /// Remove a mutation after confirmed success or dead-lettering.
    ///
    /// Returns whether the entry was present.
    pub async fn remove(&self, id: &MutationId) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let removed = self.store.delete(QUEUE_NAMESPACE, id.as_str()).await?;
        debug!("Removed {} from queue (present: {})", id, removed);
        Ok(removed)
    }

    /// Persist the start of a replay attempt before the remote call is made.
    ///
    /// Returns the updated mutation, or `None` if it is no longer queued.
    ///
    /// # Errors
    /// - `InvalidInput` if the entry has no attempts left
    /// - `StorageUnavailable` if the count cannot be written; the attempt
    ///   must not be made
    pub async fn begin_attempt(&self, id: &MutationId) -> Result<Option<QueuedMutation>> {
        let _guard = self.write_lock.lock().await;

        let Some(mut mutation) = self.get(id).await? else {
            return Ok(None);
        };

        if mutation.is_exhausted() {
            return Err(Error::InvalidInput(format!(
                "{} has no attempts left",
                id
            )));
        }

        mutation.attempts = mutation.attempts_made() + 1;
        self.store
            .put(QUEUE_NAMESPACE, mutation.to_record()?)
            .await?;

        Ok(Some(mutation))
    }

    /// Record a failed attempt and persist the new count.
    ///
    /// Returns the updated mutation, or `None` if it is no longer queued.
    pub async fn increment_retry(&self, id: &MutationId) -> Result<Option<QueuedMutation>> {
        let _guard = self.write_lock.lock().await;

        let Some(mut mutation) = self.get(id).await? else {
            return Ok(None);
        };

        if mutation.retry_count >= mutation.max_retries {
            return Err(Error::InvalidInput(format!(
                "{} is already at its retry ceiling",
                id
            )));
        }

        mutation.retry_count += 1;
        self.store
            .put(QUEUE_NAMESPACE, mutation.to_record()?)
            .await?;

        debug!(
            "{} failed attempt {}/{}",
            id, mutation.retry_count, mutation.max_retries
        );
        Ok(Some(mutation))
    }

    /// Number of pending (non-dead-lettered) mutations.
    pub async fn len(&self) -> Result<usize> {
        self.store.count(QUEUE_NAMESPACE).await
    }

    /// Check if the queue is empty.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Total payload-bearing size of the queue in bytes.
    pub async fn size(&self) -> Result<u64> {
        self.store.size_of(QUEUE_NAMESPACE).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use outpost_common::ManualClock;
    use outpost_storage::MemoryStore;
    use proptest::prelude::*;

    fn queue_over(store: MemoryStore) -> MutationQueue {
        MutationQueue::new(Arc::new(store), Arc::new(ManualClock::default()), 3)
    }

    #[tokio::test]
    async fn test_enqueue_and_list_in_order() {
        let queue = queue_over(MemoryStore::new());

        let a = queue
            .enqueue(OperationKind::Create, Target::collection("notices"), b"a".to_vec())
            .await
            .unwrap();
        let b = queue
            .enqueue(OperationKind::Update, Target::record("notices", "1"), b"b".to_vec())
            .await
            .unwrap();
        let c = queue
            .enqueue(OperationKind::Delete, Target::record("notices", "1"), Vec::new())
            .await
            .unwrap();

        let ids: Vec<MutationId> = queue.list().await.unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![a, b, c]);
        assert_eq!(queue.len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_payload_round_trips_through_store() {
        let queue = queue_over(MemoryStore::new());
        let payload = vec![0u8, 159, 146, 150, 255];

        let id = queue
            .enqueue(OperationKind::Create, Target::collection("files"), payload.clone())
            .await
            .unwrap();

        let stored = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.payload, payload);
        assert_eq!(stored.retry_count, 0);
        assert_eq!(stored.max_retries, 3);
    }

    #[tokio::test]
    async fn test_increment_retry_keeps_position() {
        let queue = queue_over(MemoryStore::new());
        let first = queue
            .enqueue(OperationKind::Create, Target::collection("a"), vec![1])
            .await
            .unwrap();
        let second = queue
            .enqueue(OperationKind::Create, Target::collection("b"), vec![2])
            .await
            .unwrap();

        let updated = queue.increment_retry(&first).await.unwrap().unwrap();
        assert_eq!(updated.retry_count, 1);

        let listed = queue.list().await.unwrap();
        assert_eq!(listed[0].id, first);
        assert_eq!(listed[0].retry_count, 1);
        assert_eq!(listed[1].id, second);
    }

    #[tokio::test]
    async fn test_increment_retry_missing_entry() {
        let queue = queue_over(MemoryStore::new());
        let missing = MutationId::new("gone").unwrap();
        assert!(queue.increment_retry(&missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_increment_never_exceeds_ceiling() {
        let queue = queue_over(MemoryStore::new());
        let id = queue
            .enqueue(OperationKind::Update, Target::record("a", "1"), vec![])
            .await
            .unwrap();

        for _ in 0..3 {
            queue.increment_retry(&id).await.unwrap();
        }
        assert!(queue.increment_retry(&id).await.is_err());
        assert_eq!(queue.get(&id).await.unwrap().unwrap().retry_count, 3);
    }

    #[tokio::test]
    async fn test_remove() {
        let queue = queue_over(MemoryStore::new());
        let id = queue
            .enqueue(OperationKind::Delete, Target::record("a", "1"), vec![])
            .await
            .unwrap();

        assert!(queue.remove(&id).await.unwrap());
        assert!(!queue.remove(&id).await.unwrap());
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_entries_survive_new_queue_instance() {
        let store = MemoryStore::new();
        let id = {
            let queue = queue_over(store.clone());
            queue
                .enqueue(OperationKind::Create, Target::collection("a"), vec![7])
                .await
                .unwrap()
        };

        let reopened = queue_over(store);
        let listed = reopened.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
    }

    #[tokio::test]
    async fn test_enqueue_fails_when_storage_unavailable() {
        let store = MemoryStore::new();
        store.set_available(false);
        let queue = queue_over(store);

        let err = queue
            .enqueue(OperationKind::Create, Target::collection("a"), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable(_)));
    }

    #[tokio::test]
    async fn test_enqueued_at_comes_from_clock() {
        let clock = Arc::new(ManualClock::default());
        let queue = MutationQueue::new(Arc::new(MemoryStore::new()), clock.clone(), 3);
        let expected = clock.now() + Duration::seconds(42);
        clock.set(expected);

        let id = queue
            .enqueue(OperationKind::Create, Target::collection("a"), vec![])
            .await
            .unwrap();
        assert_eq!(queue.get(&id).await.unwrap().unwrap().enqueued_at, expected);
    }

    #[test]
    fn test_last_attempt_boundary() {
        let mut mutation = QueuedMutation {
            id: MutationId::generate(),
            operation: OperationKind::Update,
            target: Target::record("a", "1"),
            payload: Vec::new(),
            enqueued_at: Utc::now(),
            retry_count: 1,
            max_retries: 3,
            attempts: 1,
        };
        assert!(!mutation.is_last_attempt());
        mutation.retry_count = 2;
        assert!(mutation.is_last_attempt());
        assert!(!mutation.is_exhausted());

        // An attempt started but never recorded still counts.
        mutation.attempts = 3;
        assert!(mutation.is_exhausted());
    }

    #[tokio::test]
    async fn test_begin_attempt_is_persisted_and_bounded() {
        let queue = queue_over(MemoryStore::new());
        let id = queue
            .enqueue(OperationKind::Update, Target::record("a", "1"), vec![])
            .await
            .unwrap();

        for expected in 1..=3 {
            let started = queue.begin_attempt(&id).await.unwrap().unwrap();
            assert_eq!(started.attempts, expected);
        }

        let stored = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 3);
        assert_eq!(stored.retry_count, 0);
        assert!(stored.is_exhausted());
        assert!(matches!(
            queue.begin_attempt(&id).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_begin_attempt_catches_up_with_retry_count() {
        let queue = queue_over(MemoryStore::new());
        let id = queue
            .enqueue(OperationKind::Update, Target::record("a", "1"), vec![])
            .await
            .unwrap();
        queue.increment_retry(&id).await.unwrap();
        queue.increment_retry(&id).await.unwrap();

        let started = queue.begin_attempt(&id).await.unwrap().unwrap();
        assert_eq!(started.attempts, 3);
        assert!(started.is_exhausted());
    }

    #[test]
    fn test_records_without_attempts_still_decode() {
        let json = format!(
            r#"{{"id":"m1","operation":"Create","target":{{"collection":"a","record_id":null}},"payload":"","enqueued_at":"{}","retry_count":2,"max_retries":3}}"#,
            Utc::now().to_rfc3339()
        );
        let mutation: QueuedMutation = serde_json::from_str(&json).unwrap();
        assert_eq!(mutation.attempts, 0);
        assert_eq!(mutation.attempts_made(), 2);
    }

    proptest! {
        #[test]
        fn queue_length_and_order_match_enqueues(payloads in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..32), 0..20)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let queue = queue_over(MemoryStore::new());
                let mut ids = Vec::new();
                for payload in &payloads {
                    ids.push(
                        queue
                            .enqueue(OperationKind::Create, Target::collection("p"), payload.clone())
                            .await
                            .unwrap(),
                    );
                }

                let listed = queue.list().await.unwrap();
                assert_eq!(listed.len(), payloads.len());
                let listed_ids: Vec<MutationId> = listed.iter().map(|m| m.id.clone()).collect();
                assert_eq!(listed_ids, ids);
                let listed_payloads: Vec<Vec<u8>> = listed.into_iter().map(|m| m.payload).collect();
                assert_eq!(listed_payloads, payloads);
            });
        }
    }
}
