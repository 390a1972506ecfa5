//! Dispatch-side traits: deliver jobs, keep leases alive, persist outcomes.
//!
//! The worker drives; the backend owns delivery. Queue transports (managed
//! queues, database tables) implement these traits and keep their lease and
//! redelivery rules to themselves.
//!
//! - Finalization consumes the context, so a job is settled at most once.
//! - Polling yields per-job results; one bad message does not hide the rest.
mod tmp {
    /// Backend marker carrying the backend-specific error type.
    pub trait BackEndDriver: Send {
        type Error: std::error::Error + Send;
    }

    /// What the worker should do after a lease renewal.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    pub enum Heartbeat {
        /// Lease renewed; keep running the handler.
        Continue,
        /// Lease lost; abandon the job without finalizing it.
        Stop,
    }

    /// Per-delivery handle for lease renewal and settlement.
    #[trait_variant::make(BackEndContext: Send)]
    pub trait LocalBackEndContext {
        type Driver: BackEndDriver;

        /// 1-based delivery count of this job.
        #[allow(unused)]
        fn attempt(&self) -> u32;

        /// Wait for the next renewal point, then renew the lease.
        ///
        /// Backends without leases may simply never resolve.
        #[allow(unused)]
        async fn heartbeat(&mut self) -> Heartbeat;

        #[allow(unused)]
        async fn complete(self) -> Result<(), <Self::Driver as BackEndDriver>::Error>;
        #[allow(unused)]
        async fn discard(self) -> Result<(), <Self::Driver as BackEndDriver>::Error>;
        #[allow(unused)]
        async fn retry(
            self,
            retry_after: Option<std::time::Duration>,
        ) -> Result<(), <Self::Driver as BackEndDriver>::Error>;
    }

    /// Pair of job payload and backend context.
    pub struct Job<Data, Context> {
        data: Data,
        context: Context,
    }

    impl<Data, Context> Job<Data, Context> {
        /// Separate payload and context for handler and bookkeeping.
        pub fn split_parts(self) -> (Data, Context) {
            (self.data, self.context)
        }

        /// Build a job from payload and context.
        pub fn from_parts(data: Data, context: Context) -> Self {
            Self { data, context }
        }
    }

    #[trait_variant::make(BackEndPoller: Send)]
    pub trait LocalBackEndPoller {
        type Driver: BackEndDriver;
        type Data: Send + 'static;
        type Context: BackEndContext + Send + 'static;

        /// Lease up to `batch_size` deliverable jobs.
        #[allow(unused)]
        async fn poll_job(
            &mut self,
            batch_size: usize,
        ) -> Vec<Result<Job<Self::Data, Self::Context>, <Self::Driver as BackEndDriver>::Error>>;
    }
}

pub use tmp::{BackEndContext, BackEndDriver, BackEndPoller, Heartbeat, Job};
