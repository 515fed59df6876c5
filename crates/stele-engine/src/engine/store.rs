//! StepStore: the persistence seam of the engine.
//!
//! **Constraints (must hold in all implementations):**
//! - `reserve` is one serializable unit per row: two workers racing on the
//!   same fresh key cannot both observe "absent" and both insert.
//! - `complete`/`fail` are conditional on the current owner; zero rows
//!   affected means ownership was lost and must surface as such.
//! - A COMPLETED record is terminal; no reservation rewrites it.
//! - The user step function is never executed inside a store transaction.

use crate::engine::record::{Reservation, StepRecord, StepStatus};

/// Error type for any failure a user step function reports.
pub type StepError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Engine-level error type.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("step store error: {0}")]
    Store(String),
    /// A commit or fail update changed zero rows: a lease reclaim overtook
    /// this worker. Non-retriable by the engine.
    #[error("ownership of step {step_key} was lost to another worker")]
    OwnershipLost { step_key: String },
    /// The `RUNNING_ELSEWHERE` wait window expired without the step settling.
    #[error("step is still running on another worker: {step_key}")]
    StepInProgress { step_key: String },
    /// Unknown type tag or malformed payload; fatal for that step's replay.
    #[error("codec error: {0}")]
    Codec(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("step id must not be blank")]
    BlankStepId,
    #[error("workflow id must not be blank")]
    BlankWorkflowId,
    /// The user step function failed. The step was marked FAILED under the
    /// current owner; `suppressed` carries any store error hit while doing so,
    /// so no information is lost.
    #[error("step {step_key} failed: {source}")]
    StepFailed {
        step_key: String,
        source: StepError,
        suppressed: Option<String>,
    },
}

/// Persist and atomically transition per-step records; enforce ownership.
///
/// All operations must be safe under concurrent callers against the same or
/// different processes.
pub trait StepStore: Send + Sync {
    /// Idempotently creates the schema (primary key on
    /// `(workflow_id, step_key)`, secondary index on `(workflow_id, status)`).
    fn initialize(&self) -> Result<(), EngineError>;

    /// Atomic read-or-claim-or-refuse on one row:
    /// - absent → insert RUNNING owned by `owner`, attempt 1 → `Acquired`;
    /// - COMPLETED → `Cached`, unchanged;
    /// - RUNNING with a live lease held by someone else → `RunningElsewhere`;
    /// - RUNNING stale (`now - updated_at_ms > lease_ms`), RUNNING by the same
    ///   owner, or FAILED → rewrite to RUNNING with a new owner, cleared
    ///   outputs, `attempt + 1` → `Acquired`.
    fn reserve(
        &self,
        workflow_id: &str,
        step_key: &str,
        step_id: &str,
        owner: &str,
        lease_ms: u64,
    ) -> Result<Reservation, EngineError>;

    /// Transitions to COMPLETED and installs the output, only if `owner`
    /// still matches. Fails with [EngineError::OwnershipLost] otherwise.
    fn complete(
        &self,
        workflow_id: &str,
        step_key: &str,
        owner: &str,
        output_json: Option<&str>,
        output_type: &str,
    ) -> Result<(), EngineError>;

    /// Transitions to FAILED and records the error text, only if `owner`
    /// still matches. Fails with [EngineError::OwnershipLost] otherwise.
    fn fail(
        &self,
        workflow_id: &str,
        step_key: &str,
        owner: &str,
        error_message: &str,
    ) -> Result<(), EngineError>;

    /// Records for a workflow, optionally filtered by status, ordered by
    /// `(started_at_ms, step_key)`. Backed by the status index.
    fn scan(
        &self,
        workflow_id: &str,
        status: Option<StepStatus>,
    ) -> Result<Vec<StepRecord>, EngineError>;
}
