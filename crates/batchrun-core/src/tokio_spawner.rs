//! Tokio-based job spawner.
//!
//! A panicking handler is logged and its job left unsettled; the worker
//! keeps running and the backend redelivers once the lease lapses.
use pin_project_lite::pin_project;

use crate::worker::JobSpawner;

/// Spawn jobs onto the Tokio runtime so handlers run in parallel.
pub struct TokioSpawner;

pin_project! {
    /// Tokio `JoinHandle<()>` that reports panics instead of propagating them.
    pub struct TokioJoinHandle {
        #[pin]
        handle: tokio::task::JoinHandle<()>
    }
}

impl Future for TokioJoinHandle {
    type Output = ();

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let this = self.project();
        this.handle.poll(cx).map(|result| {
            if let Err(error) = result {
                tracing::error!(error = %error, "job handler panicked");
            }
        })
    }
}

impl JobSpawner for TokioSpawner {
    type JobHandle<Fut>
        = TokioJoinHandle
    where
        Fut: Future<Output = ()> + Send + 'static;

    fn spawn<Fut>(fut: Fut) -> Self::JobHandle<Fut>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        TokioJoinHandle {
            handle: tokio::spawn(fut),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[tokio::test]
    async fn spawned_job_runs_to_completion() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        TokioSpawner::spawn(async move { flag.store(true, Ordering::SeqCst) }).await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panicking_job_does_not_take_the_worker_down() {
        TokioSpawner::spawn(async { panic!("handler blew up") }).await;
    }
}
