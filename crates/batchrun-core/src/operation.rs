//! Batch operation model: identity, status machine, and capability traits.
//!
//! A batch operation is a long-running unit of work tracked as a persistent
//! record. Its status only moves forward:
//!
//! ```text
//! pending --start--> running --finish--> finished
//!                       |
//!                       +-----fail-----> failed
//! ```
//!
//! The runner never touches a record directly. It talks to a
//! [`BatchOperation`] obtained from an [`OperationRepository`], so any
//! persistence layer that can honor the transition guards can sit behind it.
use serde::{Deserialize, Serialize};

use crate::runner::RunError;

/// Opaque identifier of a batch operation.
///
/// Integer keys are carried in their decimal form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for OperationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<i64> for OperationId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Lifecycle status of a batch operation.
///
/// The derived ordering follows the lifecycle, so a status never compares
/// lower than one observed before it.
pub enum OperationStatus {
    /// Submitted and waiting to be started.
    Pending,
    /// Started; domain work is executing or was interrupted.
    Running,
    /// Domain work completed.
    Finished,
    /// Domain work failed or the run was reaped.
    Failed,
}

impl OperationStatus {
    /// Eligibility guard: only a pending operation may start.
    pub const fn may_start(self) -> bool {
        matches!(self, OperationStatus::Pending)
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, OperationStatus::Finished | OperationStatus::Failed)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Running => "running",
            OperationStatus::Finished => "finished",
            OperationStatus::Failed => "failed",
        }
    }

    /// Status reached by applying `event`, or `None` if the pair is not a
    /// legal transition.
    pub const fn apply(self, event: Event) -> Option<OperationStatus> {
        match (self, event) {
            (OperationStatus::Pending, Event::Start) => Some(OperationStatus::Running),
            (OperationStatus::Running, Event::Finish) => Some(OperationStatus::Finished),
            (OperationStatus::Running, Event::Fail) => Some(OperationStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl std::fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown operation status `{}`", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl std::str::FromStr for OperationStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OperationStatus::Pending),
            "running" => Ok(OperationStatus::Running),
            "finished" => Ok(OperationStatus::Finished),
            "failed" => Ok(OperationStatus::Failed),
            other => Err(UnknownStatus(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// State-changing event applied through a store transition.
pub enum Event {
    Start,
    Finish,
    Fail,
}

impl Event {
    /// The only status this event may be applied from.
    pub const fn source(self) -> OperationStatus {
        match self {
            Event::Start => OperationStatus::Pending,
            Event::Finish | Event::Fail => OperationStatus::Running,
        }
    }

    pub const fn target(self) -> OperationStatus {
        match self {
            Event::Start => OperationStatus::Running,
            Event::Finish => OperationStatus::Finished,
            Event::Fail => OperationStatus::Failed,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Event::Start => "start",
            Event::Finish => "finish",
            Event::Fail => "fail",
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted snapshot of a batch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: OperationId,
    /// Discriminates which domain work applies to this operation.
    pub kind: String,
    pub status: OperationStatus,
    /// Incremented by exactly one on every successful transition.
    pub version: i64,
    pub payload: serde_json::Value,
    pub created_at: std::time::SystemTime,
    pub updated_at: std::time::SystemTime,
}

/// Input for creating a new operation in `pending` state.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub id: OperationId,
    pub kind: String,
    pub payload: serde_json::Value,
}

impl NewOperation {
    pub fn new(id: impl Into<OperationId>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn payload(self, payload: serde_json::Value) -> Self {
        Self { payload, ..self }
    }
}

/// Capability contract the runner drives.
///
/// Transitions are fallible and must refuse to run from the wrong state;
/// `start` on an operation that is not pending is an error, never a silent
/// success.
pub trait BatchOperation: Send {
    fn id(&self) -> &OperationId;

    fn status(&self) -> OperationStatus;

    /// True only while the operation is pending.
    fn may_start(&self) -> bool {
        self.status().may_start()
    }

    /// `pending -> running`. Must be atomic against concurrent starters.
    fn start(&mut self) -> impl Future<Output = Result<(), RunError>> + Send;

    /// Execute domain work. May take arbitrarily long.
    fn run(&mut self) -> impl Future<Output = Result<(), RunError>> + Send;

    /// `running -> finished`.
    fn finish(&mut self) -> impl Future<Output = Result<(), RunError>> + Send;
}

/// Resolves identifiers to operations.
pub trait OperationRepository: Send + Sync + 'static {
    type Operation: BatchOperation + std::fmt::Debug;

    /// Load an operation; unknown ids yield [`RunError::NotFound`].
    fn find(
        &self,
        id: &OperationId,
    ) -> impl Future<Output = Result<Self::Operation, RunError>> + Send;
}

/// Error returned by domain work.
pub type WorkError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Domain logic executed during the run phase.
///
/// Opaque to the runner. Implementations switch on [`OperationRecord::kind`]
/// when one worker serves several kinds of operation.
pub trait Work: Send + Sync + 'static {
    fn execute(
        &self,
        operation: &OperationRecord,
    ) -> impl Future<Output = Result<(), WorkError>> + Send;
}

impl<F, Fut> Work for F
where
    F: Fn(OperationRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), WorkError>> + Send,
{
    fn execute(
        &self,
        operation: &OperationRecord,
    ) -> impl Future<Output = Result<(), WorkError>> + Send {
        self(operation.clone())
    }
}
