//! Worker engine and builder.
//!
//! Periodic polling, bounded concurrency, heartbeats while running, and a
//! retry policy that turns handler errors into backend outcomes. Spawning is
//! pluggable.
use crate::{
    JobHandler, JobResult,
    backend::{BackEndContext, BackEndPoller, Heartbeat, Job},
    retry::RetryPolicy,
    utils::Ticker,
};
use futures::{FutureExt as _, Stream, StreamExt as _};

/// How job futures are executed (inline, Tokio, etc.).
pub trait JobSpawner {
    type JobHandle<Fut>: Future<Output = ()> + Send + 'static
    where
        Fut: Future<Output = ()> + Send + 'static;
    fn spawn<Fut>(fut: Fut) -> Self::JobHandle<Fut>
    where
        Fut: Future<Output = ()> + Send + 'static;
}

/// Runs jobs inside the worker's own future (deterministic tests, no runtime).
pub struct InlineSpawner;

impl JobSpawner for InlineSpawner {
    type JobHandle<Fut>
        = Fut
    where
        Fut: Future<Output = ()> + Send + 'static;
    fn spawn<Fut>(fut: Fut) -> Self::JobHandle<Fut>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        fut
    }
}

/// Stream that wakes the worker to poll the backend.
pub trait TickStream: Stream<Item = ()> + Send {}

impl<St> TickStream for St where St: Stream<Item = ()> + Send {}

/// Tick stream + backend + handler + retry policy + concurrency.
pub struct Worker<Tick, Poller, F, M, Sp>
where
    Tick: TickStream,
    F: JobHandler<M>,
    Poller: BackEndPoller<Data = F::Data>,
    Sp: JobSpawner,
{
    tick: Tick,
    poller: Poller,
    handler: F,
    policy: RetryPolicy,
    concurrent: usize,
    marker: std::marker::PhantomData<fn() -> (M, Sp)>,
}

impl<Tick, Poller, F, M, Sp> Worker<Tick, Poller, F, M, Sp>
where
    Tick: TickStream,
    F: JobHandler<M>,
    M: 'static,
    Poller: BackEndPoller<Data = F::Data> + 'static,
    Sp: JobSpawner,
{
    /// Add a shutdown signal and drain in-flight jobs.
    pub fn with_graceful_shutdown<Signal>(
        self,
        signal: Signal,
    ) -> WorkerWithGracefulShutdown<Tick, Poller, F, M, Signal, Sp>
    where
        Signal: Future<Output = ()> + Send,
    {
        let Self {
            tick,
            poller,
            handler,
            policy,
            concurrent,
            marker: _,
        } = self;
        WorkerWithGracefulShutdown {
            tick,
            poller,
            handler,
            policy,
            concurrent,
            signal,
            marker: std::marker::PhantomData,
        }
    }

    /// Run until the tick stream ends (or forever). No prefetch.
    pub fn run(self) -> impl Future<Output = ()> + Send {
        run_worker::<_, _, _, _, _, Sp>(
            self.tick,
            self.handler,
            self.policy,
            self.poller,
            self.concurrent,
            std::future::pending::<()>(),
        )
    }
}

/// Worker variant that reacts to a shutdown signal and drains tasks.
pub struct WorkerWithGracefulShutdown<Tick, Poller, F, M, Signal, Sp>
where
    Tick: TickStream,
    F: JobHandler<M>,
    Poller: BackEndPoller<Data = F::Data>,
    Signal: Future<Output = ()> + Send,
    Sp: JobSpawner,
{
    tick: Tick,
    poller: Poller,
    handler: F,
    policy: RetryPolicy,
    concurrent: usize,
    signal: Signal,
    marker: std::marker::PhantomData<fn() -> (M, Sp)>,
}

impl<Tick, Poller, F, M, Signal, Sp> WorkerWithGracefulShutdown<Tick, Poller, F, M, Signal, Sp>
where
    Tick: TickStream,
    F: JobHandler<M>,
    M: 'static,
    Poller: BackEndPoller<Data = F::Data> + 'static,
    Signal: Future<Output = ()> + Send,
    Sp: JobSpawner,
{
    /// Run until shutdown, then drain tasks.
    pub fn run(self) -> impl Future<Output = ()> + Send {
        run_worker::<_, _, _, _, _, Sp>(
            self.tick,
            self.handler,
            self.policy,
            self.poller,
            self.concurrent,
            self.signal,
        )
    }
}

/// Core loop: fetch when capacity, spawn, heartbeat, settle.
async fn run_worker<Tick, Poller, F, M, Signal, Sp>(
    tick: Tick,
    handler: F,
    policy: RetryPolicy,
    mut poller: Poller,
    concurrent: usize,
    signal: Signal,
) where
    Tick: TickStream,
    F: JobHandler<M>,
    M: 'static,
    Poller: BackEndPoller<Data = F::Data> + 'static,
    Signal: Future + Send,
    Sp: JobSpawner,
{
    futures::pin_mut!(tick);
    futures::pin_mut!(signal);
    let mut tick = tick.fuse();
    let mut tasks = futures::stream::FuturesUnordered::new();
    let mut signal = signal.fuse();
    loop {
        futures::select! {
            tick_val = tick.next() => {
                if tick_val.is_none() { break; }

                // Backpressure: fetch only when capacity is free.
                let free = concurrent.saturating_sub(tasks.len());
                if free == 0 {
                    continue;
                }

                let polled_jobs = poller.poll_job(free).await;
                for job in polled_jobs {
                    match job {
                        Ok(job) => {
                            let fut = handle_one_job::<F, M, Poller>(job, handler.clone(), policy);
                            tasks.push(<Sp as JobSpawner>::spawn(fut));
                        },
                        Err(error) => {
                            tracing::error!(error = %error, "Failed to fetch job");
                        },
                    }
                }
            },
            _ = tasks.next() => { },
            _ = signal => {
                tracing::debug!(
                    in_flight = tasks.len(),
                    "received graceful shutdown signal, waiting for jobs to finish"
                );
                break;
            }
        }
    }

    while tasks.next().await.is_some() {}
}

/// Run one job with heartbeats, then settle it according to `policy`.
async fn handle_one_job<F, M, Poller>(
    job: Job<F::Data, <Poller as BackEndPoller>::Context>,
    handler: F,
    policy: RetryPolicy,
) where
    F: JobHandler<M>,
    Poller: BackEndPoller<Data = F::Data>,
{
    let (data, mut context) = job.split_parts();
    let attempt = context.attempt();
    tracing::trace!(attempt, "Start handler");
    let outcome = {
        let handler_fut = handler.call(data);
        futures::pin_mut!(handler_fut);
        let mut handler_fut = handler_fut.fuse();

        loop {
            let heartbeat = context.heartbeat().fuse();
            futures::pin_mut!(heartbeat);
            futures::select! {
                res = handler_fut => break res,
                beat = heartbeat => match beat {
                    Heartbeat::Continue => continue,
                    Heartbeat::Stop => {
                        tracing::warn!(attempt, "lease lost, abandoning job");
                        return;
                    }
                }
            }
        }
    };
    tracing::trace!(attempt, "Finish handler");

    let _ = match policy.judge(attempt, outcome) {
        JobResult::Complete => BackEndContext::complete(context)
            .await
            .inspect_err(|error| tracing::error!(error = %error, "Failed to complete job")),
        JobResult::Retry(delay) => BackEndContext::retry(context, delay)
            .await
            .inspect_err(|error| tracing::error!(error = %error, "Failed to retry job")),
        JobResult::Discard => BackEndContext::discard(context)
            .await
            .inspect_err(|error| tracing::error!(error = %error, "Failed to discard job")),
    };
}

/// Builder for [`Worker`]. Prefer explicit configuration over defaults.
pub struct WorkerBuilder<Tick = (), Handler = (), M = (), Sp = InlineSpawner> {
    tick: Tick,
    concurrent: usize,
    policy: RetryPolicy,
    handler: Handler,
    marker: std::marker::PhantomData<fn() -> (M, Sp)>,
}

impl WorkerBuilder {
    /// Poll every `interval`.
    pub fn new(interval: std::time::Duration) -> WorkerBuilder<Ticker, (), (), InlineSpawner> {
        Self::new_with_tick(Ticker::new(interval))
    }

    /// Use a custom tick stream.
    pub fn new_with_tick<Tick>(tick: Tick) -> WorkerBuilder<Tick, (), (), InlineSpawner> {
        WorkerBuilder {
            tick,
            concurrent: 4,
            policy: RetryPolicy::default(),
            handler: (),
            marker: std::marker::PhantomData,
        }
    }
}

impl<Tick, Handler, M, Sp> WorkerBuilder<Tick, Handler, M, Sp> {
    /// Set concurrency (max in-flight jobs).
    pub fn concurrent(self, concurrent: usize) -> Self {
        Self { concurrent, ..self }
    }

    /// Replace the default retry policy.
    pub fn retry_policy(self, policy: RetryPolicy) -> Self {
        Self { policy, ..self }
    }

    /// Choose how to spawn jobs (inline, Tokio, ...).
    pub fn job_spawner<Sp2>(self, _spawner: Sp2) -> WorkerBuilder<Tick, Handler, M, Sp2>
    where
        Sp2: JobSpawner,
    {
        let Self {
            tick,
            concurrent,
            policy,
            handler,
            marker: _,
        } = self;
        WorkerBuilder {
            tick,
            concurrent,
            policy,
            handler,
            marker: std::marker::PhantomData,
        }
    }
}

impl<Tick, Sp> WorkerBuilder<Tick, (), (), Sp> {
    /// Provide the job handler.
    pub fn handler<F, M>(self, handler: F) -> WorkerBuilder<Tick, F, M, Sp>
    where
        F: JobHandler<M>,
    {
        let Self {
            tick,
            concurrent,
            policy,
            handler: _,
            marker: _,
        } = self;
        WorkerBuilder {
            tick,
            concurrent,
            policy,
            handler,
            marker: std::marker::PhantomData,
        }
    }
}

impl<Tick, Handler, M, Sp> WorkerBuilder<Tick, Handler, M, Sp>
where
    Tick: TickStream,
    Handler: JobHandler<M>,
    Sp: JobSpawner,
{
    /// Finalize the worker with a backend that delivers the handler's payload.
    pub fn build<BackEnd>(self, backend: BackEnd) -> Worker<Tick, BackEnd, Handler, M, Sp>
    where
        BackEnd: BackEndPoller<Data = Handler::Data>,
    {
        let Self {
            tick,
            concurrent,
            policy,
            handler,
            marker: _,
        } = self;
        Worker {
            tick,
            poller: backend,
            handler,
            policy,
            concurrent,
            marker: std::marker::PhantomData,
        }
    }
}
