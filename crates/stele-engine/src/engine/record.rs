//! Step records and reservation outcomes.
//!
//! One record per `(workflow_id, step_key)`. COMPLETED is terminal: once
//! observed, a record never transitions out of it and its output fields are
//! immutable. RUNNING implies an owner. Every mutation after the initial
//! insert must match the current owner.

use serde::{Deserialize, Serialize};

use crate::engine::identity::{StepId, StepKey, WorkerId, WorkflowId};
use crate::engine::store::EngineError;

/// Lifecycle status of a step record.
///
/// RUNNING → COMPLETED (terminal), RUNNING → FAILED, FAILED → RUNNING
/// (new attempt, new owner). Records are never deleted by the engine.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    /// Wire form used in the `steps.status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Running => "RUNNING",
            StepStatus::Completed => "COMPLETED",
            StepStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Result<Self, EngineError> {
        match value {
            "RUNNING" => Ok(StepStatus::Running),
            "COMPLETED" => Ok(StepStatus::Completed),
            "FAILED" => Ok(StepStatus::Failed),
            other => Err(EngineError::Store(format!("unknown step status: {other}"))),
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the `steps` table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub workflow_id: WorkflowId,
    pub step_key: StepKey,
    pub step_id: StepId,
    pub status: StepStatus,
    /// Serialized result payload; present iff COMPLETED with a non-void result.
    pub output_json: Option<String>,
    /// Type tag for typed decoding; `VOID_TAG` for void results.
    pub output_type: Option<String>,
    /// Last failure text; present iff FAILED.
    pub error_message: Option<String>,
    /// Incremented on each reservation that re-takes a non-COMPLETED row.
    pub attempt: i64,
    pub owner: Option<WorkerId>,
    pub started_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Outcome of attempting to claim a step.
#[derive(Clone, Debug, PartialEq)]
pub enum Reservation {
    /// The caller now owns the step and must execute it.
    Acquired(StepRecord),
    /// The step already completed; replay the stored output.
    Cached(StepRecord),
    /// Another worker holds a live lease on the step.
    RunningElsewhere(StepRecord),
}

impl Reservation {
    /// The record observed or created by the reservation.
    pub fn record(&self) -> &StepRecord {
        match self {
            Reservation::Acquired(record)
            | Reservation::Cached(record)
            | Reservation::RunningElsewhere(record) => record,
        }
    }
}
