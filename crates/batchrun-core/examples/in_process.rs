//! Consume batch operations in-process, paced by the loaded settings.
//!
//! ```text
//! cargo run -p batchrun-core --features rt-tokio --example in_process -- batchrun.toml
//! ```
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use batchrun_core::memory::{MemoryQueue, MemoryStore};
use batchrun_core::{
    BatchOperationRunner, NewOperation, OperationRecord, RunBatchOperation, Settings,
    StoreRepository, TokioSpawner, WorkError,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .compact()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let path = std::env::args().nth(1);
    let settings = match Settings::load(path.as_deref().map(Path::new)) {
        Ok(settings) => settings,
        Err(error) => {
            tracing::error!(error = %error, "Failed to load settings");
            return;
        }
    };
    if !settings.process_jobs {
        tracing::info!("job processing is disabled, nothing to do");
        return;
    }

    let token = tokio_util::sync::CancellationToken::new();

    let store = MemoryStore::new();
    let queue = MemoryQueue::new();
    for n in 0..8 {
        let id = format!("B{n}");
        if let Err(error) = store.insert(NewOperation::new(id.as_str(), "import")) {
            tracing::error!(error = %error, "Failed to create batch operation");
            continue;
        }
        // Every operation is delivered twice; the second delivery is a no-op.
        queue.enqueue(RunBatchOperation::new(id.as_str()));
        queue.enqueue(RunBatchOperation::new(id.as_str()));
    }

    let repository = StoreRepository::new(Arc::new(store.clone()), import)
        .heartbeat(settings.reaper.heartbeat());
    let worker = settings
        .worker_builder()
        .handler(BatchOperationRunner::new(repository))
        .job_spawner(TokioSpawner)
        .build(queue.clone())
        .with_graceful_shutdown(token.clone().cancelled_owned());

    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn(worker.run());
    let idle_token = token.clone();
    tasks.spawn(async move {
        while !queue.is_idle() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tracing::info!(
            completed = queue.completed().len(),
            discarded = queue.discarded().len(),
            "queue drained"
        );
        idle_token.cancel();
    });
    tasks.spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => token.cancel(),
            _ = token.cancelled() => {}
        }
    });
    tasks.join_all().await;
}

async fn import(record: OperationRecord) -> Result<(), WorkError> {
    tracing::info!(operation_id = %record.id, "-start: import");
    tokio::time::sleep(Duration::from_millis(200)).await;
    tracing::info!(operation_id = %record.id, "--end: import");
    Ok(())
}
