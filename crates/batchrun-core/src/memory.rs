//! In-process store and queue.
//!
//! Both keep the same guarantees as a durable backend (versioned
//! transitions, settle-once deliveries) without surviving the process. Used
//! by tests and by embedders that bring their own persistence later.
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use crate::backend::{BackEndContext, BackEndDriver, BackEndPoller, Heartbeat, Job};
use crate::operation::{Event, NewOperation, OperationId, OperationRecord, OperationStatus};
use crate::store::{OperationStore, StoreError, classify_missed_transition};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding the lock cannot leave a half-applied transition:
    // every mutation is a single assignment.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Operation records in a mutex-guarded map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<HashMap<OperationId, OperationRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pending operation at version 0.
    pub fn insert(&self, operation: NewOperation) -> Result<OperationRecord, StoreError> {
        let mut records = lock(&self.records);
        if records.contains_key(&operation.id) {
            return Err(StoreError::AlreadyExists { id: operation.id });
        }

        let now = SystemTime::now();
        let record = OperationRecord {
            id: operation.id,
            kind: operation.kind,
            status: OperationStatus::Pending,
            version: 0,
            payload: operation.payload,
            created_at: now,
            updated_at: now,
        };
        records.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    pub fn get(&self, id: &OperationId) -> Option<OperationRecord> {
        lock(&self.records).get(id).cloned()
    }

    /// Overwrite `updated_at` without bumping the version.
    pub fn set_updated_at(&self, id: &OperationId, at: SystemTime) -> Result<(), StoreError> {
        let mut records = lock(&self.records);
        let record = records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound { id: id.clone() })?;
        record.updated_at = at;
        Ok(())
    }
}

impl OperationStore for MemoryStore {
    async fn fetch(&self, id: &OperationId) -> Result<OperationRecord, StoreError> {
        self.get(id)
            .ok_or_else(|| StoreError::NotFound { id: id.clone() })
    }

    async fn transition(
        &self,
        id: &OperationId,
        expected_version: i64,
        event: Event,
    ) -> Result<OperationRecord, StoreError> {
        let mut records = lock(&self.records);
        let current = records.get(id).map(|record| (record.status, record.version));

        match records.get_mut(id) {
            Some(record)
                if record.version == expected_version && record.status == event.source() =>
            {
                record.status = event.target();
                record.version += 1;
                record.updated_at = SystemTime::now();
                Ok(record.clone())
            }
            _ => Err(classify_missed_transition(id, expected_version, event, current)),
        }
    }

    async fn touch(&self, id: &OperationId, version: i64) -> Result<(), StoreError> {
        let mut records = lock(&self.records);
        let current = records.get(id).map(|record| (record.status, record.version));

        match records.get_mut(id) {
            Some(record)
                if record.version == version && record.status == OperationStatus::Running =>
            {
                record.updated_at = SystemTime::now();
                Ok(())
            }
            _ => Err(classify_missed_transition(id, version, Event::Finish, current)),
        }
    }

    async fn list_stalled(
        &self,
        older_than: SystemTime,
        limit: usize,
    ) -> Result<Vec<OperationRecord>, StoreError> {
        let records = lock(&self.records);
        let mut stalled = records
            .values()
            .filter(|record| {
                record.status == OperationStatus::Running && record.updated_at < older_than
            })
            .cloned()
            .collect::<Vec<_>>();
        stalled.sort_by_key(|record| record.updated_at);
        stalled.truncate(limit);
        Ok(stalled)
    }
}

pub struct MemoryDriver;

impl BackEndDriver for MemoryDriver {
    type Error = std::convert::Infallible;
}

#[derive(Debug)]
struct Entry<T> {
    id: u64,
    data: T,
    attempt: u32,
    available_at: Instant,
}

#[derive(Debug)]
struct QueueState<T> {
    next_id: u64,
    ready: VecDeque<Entry<T>>,
    in_flight: usize,
    completed: Vec<u64>,
    discarded: Vec<u64>,
    retries: usize,
}

/// FIFO job queue with delayed redelivery and no leases.
#[derive(Debug)]
pub struct MemoryQueue<T> {
    state: Arc<Mutex<QueueState<T>>>,
}

impl<T> Clone for MemoryQueue<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> Default for MemoryQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MemoryQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                next_id: 1,
                ready: VecDeque::new(),
                in_flight: 0,
                completed: Vec::new(),
                discarded: Vec::new(),
                retries: 0,
            })),
        }
    }

    /// Enqueue a payload for immediate delivery and return its job id.
    pub fn enqueue(&self, data: T) -> u64 {
        let mut state = lock(&self.state);
        let id = state.next_id;
        state.next_id += 1;
        state.ready.push_back(Entry {
            id,
            data,
            attempt: 1,
            available_at: Instant::now(),
        });
        id
    }

    /// Ids of completed jobs, in settlement order.
    pub fn completed(&self) -> Vec<u64> {
        lock(&self.state).completed.clone()
    }

    /// Ids of discarded jobs, in settlement order.
    pub fn discarded(&self) -> Vec<u64> {
        lock(&self.state).discarded.clone()
    }

    /// How many times any job was sent back for another attempt.
    pub fn retries(&self) -> usize {
        lock(&self.state).retries
    }

    /// True when nothing is waiting and nothing is being handled.
    pub fn is_idle(&self) -> bool {
        let state = lock(&self.state);
        state.ready.is_empty() && state.in_flight == 0
    }
}

/// Delivery handle for a [`MemoryQueue`] job.
pub struct MemoryDelivery<T> {
    state: Arc<Mutex<QueueState<T>>>,
    id: u64,
    data: T,
    attempt: u32,
}

impl<T> MemoryDelivery<T> {
    fn settle(self, outcome: impl FnOnce(&mut QueueState<T>, Entry<T>)) {
        let Self {
            state: shared,
            id,
            data,
            attempt,
        } = self;
        let mut state = lock(&shared);
        state.in_flight = state.in_flight.saturating_sub(1);
        let entry = Entry {
            id,
            data,
            attempt,
            available_at: Instant::now(),
        };
        outcome(&mut *state, entry);
    }
}

impl<T> BackEndContext for MemoryDelivery<T>
where
    T: Send + 'static,
{
    type Driver = MemoryDriver;

    fn attempt(&self) -> u32 {
        self.attempt
    }

    async fn heartbeat(&mut self) -> Heartbeat {
        futures::future::pending::<Heartbeat>().await
    }

    async fn complete(self) -> Result<(), std::convert::Infallible> {
        self.settle(|state, entry| state.completed.push(entry.id));
        Ok(())
    }

    async fn discard(self) -> Result<(), std::convert::Infallible> {
        self.settle(|state, entry| state.discarded.push(entry.id));
        Ok(())
    }

    async fn retry(self, retry_after: Option<Duration>) -> Result<(), std::convert::Infallible> {
        self.settle(|state, entry| {
            state.retries += 1;
            state.ready.push_back(Entry {
                attempt: entry.attempt + 1,
                available_at: entry.available_at + retry_after.unwrap_or_default(),
                ..entry
            });
        });
        Ok(())
    }
}

impl<T> BackEndPoller for MemoryQueue<T>
where
    T: Clone + Send + 'static,
{
    type Driver = MemoryDriver;
    type Data = T;
    type Context = MemoryDelivery<T>;

    async fn poll_job(
        &mut self,
        batch_size: usize,
    ) -> Vec<Result<Job<T, MemoryDelivery<T>>, std::convert::Infallible>> {
        let now = Instant::now();
        let mut state = lock(&self.state);

        let mut due = Vec::new();
        let mut waiting = VecDeque::new();
        while let Some(entry) = state.ready.pop_front() {
            if due.len() < batch_size && entry.available_at <= now {
                due.push(entry);
            } else {
                waiting.push_back(entry);
            }
        }
        state.ready = waiting;
        state.in_flight += due.len();

        due.into_iter()
            .map(|entry| {
                let context = MemoryDelivery {
                    state: Arc::clone(&self.state),
                    id: entry.id,
                    data: entry.data.clone(),
                    attempt: entry.attempt,
                };
                Ok(Job::from_parts(entry.data, context))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transition_bumps_version_once() {
        let store = MemoryStore::new();
        store.insert(NewOperation::new("B1", "import")).unwrap();

        let id = OperationId::from("B1");
        let running = store.transition(&id, 0, Event::Start).await.unwrap();
        assert_eq!(running.status, OperationStatus::Running);
        assert_eq!(running.version, 1);

        let stale = store.transition(&id, 0, Event::Start).await;
        assert!(matches!(stale, Err(StoreError::ConcurrentModification { .. })));

        let wrong_state = store.transition(&id, 1, Event::Start).await;
        assert!(matches!(wrong_state, Err(StoreError::InvalidTransition { .. })));

        assert_eq!(store.get(&id).unwrap().version, 1);
    }

    #[tokio::test]
    async fn touch_refreshes_running_record_without_new_version() {
        let store = MemoryStore::new();
        store.insert(NewOperation::new("B1", "import")).unwrap();
        let id = OperationId::from("B1");

        let pending = store.touch(&id, 0).await;
        assert!(matches!(pending, Err(StoreError::InvalidTransition { .. })));

        store.transition(&id, 0, Event::Start).await.unwrap();
        let hour_ago = SystemTime::now() - Duration::from_secs(3600);
        store.set_updated_at(&id, hour_ago).unwrap();

        store.touch(&id, 1).await.unwrap();
        let touched = store.get(&id).unwrap();
        assert_eq!(touched.version, 1);
        assert!(touched.updated_at > hour_ago);

        let stale = store.touch(&id, 0).await;
        assert!(matches!(stale, Err(StoreError::ConcurrentModification { .. })));
        let missing = store.touch(&OperationId::from("B2"), 1).await;
        assert!(matches!(missing, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = MemoryStore::new();
        store.insert(NewOperation::new("B1", "import")).unwrap();
        let again = store.insert(NewOperation::new("B1", "import"));
        assert!(matches!(again, Err(StoreError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn list_stalled_only_returns_old_running_records() {
        let store = MemoryStore::new();
        for id in ["old", "fresh", "pending"] {
            store.insert(NewOperation::new(id, "import")).unwrap();
        }
        for id in ["old", "fresh"] {
            store
                .transition(&OperationId::from(id), 0, Event::Start)
                .await
                .unwrap();
        }
        let hour_ago = SystemTime::now() - Duration::from_secs(3600);
        store
            .set_updated_at(&OperationId::from("old"), hour_ago)
            .unwrap();
        store
            .set_updated_at(&OperationId::from("pending"), hour_ago)
            .unwrap();

        let cutoff = SystemTime::now() - Duration::from_secs(60);
        let stalled = store.list_stalled(cutoff, 10).await.unwrap();
        let ids = stalled.iter().map(|r| r.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["old"]);
    }

    #[tokio::test]
    async fn retried_job_is_redelivered_with_next_attempt() {
        let mut queue = MemoryQueue::new();
        let id = queue.enqueue("payload");

        let mut jobs = queue.poll_job(4).await;
        assert_eq!(jobs.len(), 1);
        let (data, context) = jobs.remove(0).unwrap().split_parts();
        assert_eq!(data, "payload");
        assert_eq!(context.attempt(), 1);
        assert!(!queue.is_idle());
        context.retry(None).await.unwrap();

        let mut jobs = queue.poll_job(4).await;
        let (_, context) = jobs.remove(0).unwrap().split_parts();
        assert_eq!(context.attempt(), 2);
        context.complete().await.unwrap();

        assert_eq!(queue.completed(), vec![id]);
        assert_eq!(queue.retries(), 1);
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn delayed_retry_is_not_polled_early() {
        let mut queue = MemoryQueue::new();
        queue.enqueue(7_u32);

        let mut jobs = queue.poll_job(1).await;
        let (_, context) = jobs.remove(0).unwrap().split_parts();
        context
            .retry(Some(Duration::from_secs(3600)))
            .await
            .unwrap();

        assert!(queue.poll_job(1).await.is_empty());
        assert!(!queue.is_idle());
    }
}
