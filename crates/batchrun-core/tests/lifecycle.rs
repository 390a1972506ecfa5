use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use batchrun_core::memory::MemoryStore;
use batchrun_core::{
    BatchOperationRunner, Disposition, NewOperation, OperationId, OperationRecord,
    OperationStatus, Outcome, Reaper, Retryable as _, RunError, StoreRepository, Work, WorkError,
};

/// Domain work that counts executions, optionally sleeping or failing.
#[derive(Clone, Default)]
struct Counting {
    executions: Arc<AtomicUsize>,
    delay: Option<Duration>,
    fail: bool,
}

impl Counting {
    fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

impl Work for Counting {
    async fn execute(&self, _record: &OperationRecord) -> Result<(), WorkError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err("domain work exploded".into());
        }
        Ok(())
    }
}

/// Domain work that records the status it observed.
#[derive(Clone, Default)]
struct Observing {
    seen: Arc<Mutex<Vec<OperationStatus>>>,
}

impl Work for Observing {
    async fn execute(&self, record: &OperationRecord) -> Result<(), WorkError> {
        self.seen.lock().unwrap().push(record.status);
        Ok(())
    }
}

/// Domain work during which the reaper fails the running record.
#[derive(Clone)]
struct ReapedMidRun {
    store: MemoryStore,
}

impl Work for ReapedMidRun {
    async fn execute(&self, record: &OperationRecord) -> Result<(), WorkError> {
        let stale = SystemTime::now() - Duration::from_secs(10);
        self.store.set_updated_at(&record.id, stale)?;
        let reaped = Reaper::new(self.store.clone(), Duration::from_secs(1))
            .sweep()
            .await?;
        assert_eq!(reaped, 1);
        Ok(())
    }
}

type Runner<W> = BatchOperationRunner<StoreRepository<MemoryStore, W>>;

fn setup<W: Work>(work: W) -> (MemoryStore, Runner<W>) {
    let store = MemoryStore::new();
    let repository = StoreRepository::new(Arc::new(store.clone()), work);
    (store, BatchOperationRunner::new(repository))
}

#[tokio::test]
async fn pending_operation_runs_to_finished_then_redelivery_is_noop() {
    let work = Counting::default();
    let (store, runner) = setup(work.clone());
    store.insert(NewOperation::new("B1", "import")).unwrap();
    let id = OperationId::from("B1");

    assert_eq!(runner.perform(&id).await.unwrap(), Outcome::Finished);
    let finished = store.get(&id).unwrap();
    assert_eq!(finished.status, OperationStatus::Finished);
    assert_eq!(finished.version, 2);
    assert_eq!(work.executions(), 1);

    assert_eq!(runner.perform(&id).await.unwrap(), Outcome::Skipped);
    assert_eq!(store.get(&id).unwrap(), finished);
    assert_eq!(work.executions(), 1);
}

#[tokio::test]
async fn running_or_finished_operations_are_left_alone() {
    let work = Counting::default();
    let (store, runner) = setup(work.clone());
    store.insert(NewOperation::new("running", "import")).unwrap();
    store.insert(NewOperation::new("done", "import")).unwrap();

    let running = OperationId::from("running");
    let done = OperationId::from("done");
    use batchrun_core::{Event, OperationStore as _};
    store.transition(&running, 0, Event::Start).await.unwrap();
    store.transition(&done, 0, Event::Start).await.unwrap();
    store.transition(&done, 1, Event::Finish).await.unwrap();

    let before = (store.get(&running).unwrap(), store.get(&done).unwrap());

    assert_eq!(runner.perform(&running).await.unwrap(), Outcome::Skipped);
    assert_eq!(runner.perform(&done).await.unwrap(), Outcome::Skipped);

    assert_eq!((store.get(&running).unwrap(), store.get(&done).unwrap()), before);
    assert_eq!(work.executions(), 0);
}

#[tokio::test]
async fn unknown_identifier_is_not_found_and_touches_nothing() {
    let work = Counting::default();
    let (store, runner) = setup(work.clone());
    store.insert(NewOperation::new("B1", "import")).unwrap();
    let before = store.get(&OperationId::from("B1")).unwrap();

    let error = runner
        .perform(&OperationId::from("missing"))
        .await
        .unwrap_err();
    assert!(matches!(error, RunError::NotFound { .. }));

    assert_eq!(store.get(&OperationId::from("B1")).unwrap(), before);
    assert!(store.get(&OperationId::from("missing")).is_none());
    assert_eq!(work.executions(), 0);
}

#[tokio::test]
async fn failed_run_is_reported_and_marked_failed() {
    let work = Counting {
        fail: true,
        ..Counting::default()
    };
    let (store, runner) = setup(work.clone());
    store.insert(NewOperation::new("B1", "import")).unwrap();
    let id = OperationId::from("B1");

    let error = runner.perform(&id).await.unwrap_err();
    assert!(matches!(error, RunError::DomainExecutionFailure { .. }));

    let record = store.get(&id).unwrap();
    assert_eq!(record.status, OperationStatus::Failed);
    assert_eq!(work.executions(), 1);

    // A redelivery after the failure cannot run the work again.
    assert_eq!(runner.perform(&id).await.unwrap(), Outcome::Skipped);
    assert_eq!(work.executions(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deliveries_start_exactly_once() {
    const N: usize = 16;

    // The winner stays in the run phase while the others race.
    let work = Counting {
        delay: Some(Duration::from_millis(20)),
        ..Counting::default()
    };
    let (store, runner) = setup(work.clone());
    store.insert(NewOperation::new("B1", "import")).unwrap();

    let barrier = Arc::new(tokio::sync::Barrier::new(N));
    let mut handles = Vec::new();
    for _ in 0..N {
        let runner = runner.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            runner.perform(&OperationId::from("B1")).await
        }));
    }

    let mut finished = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(Outcome::Finished) => finished += 1,
            Ok(Outcome::Skipped) | Err(RunError::ConcurrentModification { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(finished, 1);
    assert_eq!(work.executions(), 1);
    let record = store.get(&OperationId::from("B1")).unwrap();
    assert_eq!(record.status, OperationStatus::Finished);
    assert_eq!(record.version, 2);
}

#[tokio::test]
async fn observed_states_only_move_forward() {
    let work = Observing::default();
    let observed = Arc::clone(&work.seen);
    let (store, runner) = setup(work);

    store.insert(NewOperation::new("B1", "import")).unwrap();
    let id = OperationId::from("B1");
    observed.lock().unwrap().push(store.get(&id).unwrap().status);
    runner.perform(&id).await.unwrap();
    observed.lock().unwrap().push(store.get(&id).unwrap().status);
    runner.perform(&id).await.unwrap();
    observed.lock().unwrap().push(store.get(&id).unwrap().status);

    let observed = observed.lock().unwrap().clone();
    assert_eq!(
        observed,
        vec![
            OperationStatus::Pending,
            OperationStatus::Running,
            OperationStatus::Finished,
            OperationStatus::Finished,
        ]
    );
    assert!(observed.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_outliving_stale_window_is_kept_alive_by_heartbeat() {
    let work = Counting {
        delay: Some(Duration::from_millis(300)),
        ..Counting::default()
    };
    let store = MemoryStore::new();
    let repository = StoreRepository::new(Arc::new(store.clone()), work.clone())
        .heartbeat(Duration::from_millis(20));
    let runner = BatchOperationRunner::new(repository);
    store.insert(NewOperation::new("B1", "import")).unwrap();

    let reaper = Reaper::new(store.clone(), Duration::from_millis(100));
    let sweeping = tokio::spawn(async move {
        let mut reaped = 0;
        for _ in 0..40 {
            reaped += reaper.sweep().await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        reaped
    });

    let id = OperationId::from("B1");
    assert_eq!(runner.perform(&id).await.unwrap(), Outcome::Finished);
    assert_eq!(sweeping.await.unwrap(), 0);

    let record = store.get(&id).unwrap();
    assert_eq!(record.status, OperationStatus::Finished);
    assert_eq!(record.version, 2);
    assert_eq!(work.executions(), 1);
}

#[tokio::test]
async fn run_reaped_before_finishing_is_reported_and_not_retried() {
    let store = MemoryStore::new();
    let work = ReapedMidRun {
        store: store.clone(),
    };
    let runner = BatchOperationRunner::new(StoreRepository::new(Arc::new(store.clone()), work));
    store.insert(NewOperation::new("B1", "import")).unwrap();
    let id = OperationId::from("B1");

    let error = runner.perform(&id).await.unwrap_err();
    assert!(matches!(error, RunError::Reaped { .. }));
    assert_eq!(error.disposition(), Disposition::Discard);

    let record = store.get(&id).unwrap();
    assert_eq!(record.status, OperationStatus::Failed);
    assert_eq!(record.version, 2);

    assert_eq!(runner.perform(&id).await.unwrap(), Outcome::Skipped);
}
