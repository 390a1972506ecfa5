//! Reconcile operations stranded in `running`.
//!
//! Start, run and finish are separate writes, so a worker that dies mid-run
//! leaves its operation `running` with nobody left to finish it. The reaper
//! fails operations that have not been touched for longer than
//! `stale_after`. Reaping is a normal versioned transition: a runner that is
//! still alive and finishes first wins, and the reaper skips the record.
use futures::{FutureExt as _, StreamExt as _};

use crate::operation::Event;
use crate::store::{OperationStore, StoreError};
use crate::worker::TickStream;

/// Fails operations that stayed `running` past a deadline.
#[derive(Debug, Clone)]
pub struct Reaper<S> {
    store: S,
    stale_after: std::time::Duration,
    batch_size: usize,
}

impl<S> Reaper<S>
where
    S: OperationStore,
{
    pub const DEFAULT_BATCH_SIZE: usize = 100;

    pub fn new(store: S, stale_after: std::time::Duration) -> Self {
        Self {
            store,
            stale_after,
            batch_size: Self::DEFAULT_BATCH_SIZE,
        }
    }

    /// Cap how many records a single sweep inspects.
    pub fn batch_size(self, batch_size: usize) -> Self {
        Self { batch_size, ..self }
    }

    /// Fail every stalled operation once. Returns how many were reaped.
    pub async fn sweep(&self) -> Result<usize, StoreError> {
        let cutoff = std::time::SystemTime::now()
            .checked_sub(self.stale_after)
            .unwrap_or(std::time::UNIX_EPOCH);
        let stalled = self.store.list_stalled(cutoff, self.batch_size).await?;

        let mut reaped = 0;
        for record in stalled {
            match self
                .store
                .transition(&record.id, record.version, Event::Fail)
                .await
            {
                Ok(_) => {
                    tracing::warn!(
                        operation_id = %record.id,
                        kind = %record.kind,
                        "reaped stalled batch operation"
                    );
                    reaped += 1;
                }
                Err(
                    StoreError::ConcurrentModification { .. }
                    | StoreError::InvalidTransition { .. }
                    | StoreError::NotFound { .. },
                ) => {
                    tracing::debug!(
                        operation_id = %record.id,
                        "stalled batch operation moved on, skipping"
                    );
                }
                Err(error) => return Err(error),
            }
        }

        Ok(reaped)
    }

    /// Sweep on every tick until `signal` resolves or the ticks end.
    pub async fn run<Tick, Signal>(self, tick: Tick, signal: Signal)
    where
        Tick: TickStream,
        Signal: Future + Send,
    {
        futures::pin_mut!(tick);
        futures::pin_mut!(signal);
        let mut tick = tick.fuse();
        let mut signal = signal.fuse();

        loop {
            futures::select! {
                tick_val = tick.next() => {
                    if tick_val.is_none() { break; }
                    match self.sweep().await {
                        Ok(0) => {}
                        Ok(reaped) => tracing::info!(reaped, "reaper sweep finished"),
                        Err(error) => tracing::error!(
                            error = %error,
                            "Failed to sweep stalled batch operations"
                        ),
                    }
                },
                _ = signal => {
                    tracing::debug!("received shutdown signal, stopping reaper");
                    break;
                }
            }
        }
    }
}
