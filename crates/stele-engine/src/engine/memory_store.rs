//! In-memory StepStore implementation.
//!
//! Same decision table as the relational adapter, over a locked map. Useful
//! for unit tests and embedded runs that do not need durability across
//! process restarts.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;

use crate::engine::identity::{StepKey, WorkflowId};
use crate::engine::record::{Reservation, StepRecord, StepStatus};
use crate::engine::store::{EngineError, StepStore};

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// In-memory step store: one record per `(workflow_id, step_key)`.
pub struct InMemoryStepStore {
    rows: Mutex<HashMap<(WorkflowId, StepKey), StepRecord>>,
}

impl InMemoryStepStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<(WorkflowId, StepKey), StepRecord>>, EngineError> {
        self.rows
            .lock()
            .map_err(|_| EngineError::Store("in-memory store lock poisoned".into()))
    }
}

impl Default for InMemoryStepStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StepStore for InMemoryStepStore {
    fn initialize(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn reserve(
        &self,
        workflow_id: &str,
        step_key: &str,
        step_id: &str,
        owner: &str,
        lease_ms: u64,
    ) -> Result<Reservation, EngineError> {
        let mut rows = self.lock()?;
        let now = now_ms();
        let slot = (workflow_id.to_string(), step_key.to_string());

        let Some(existing) = rows.get_mut(&slot) else {
            let record = StepRecord {
                workflow_id: workflow_id.to_string(),
                step_key: step_key.to_string(),
                step_id: step_id.to_string(),
                status: StepStatus::Running,
                output_json: None,
                output_type: None,
                error_message: None,
                attempt: 1,
                owner: Some(owner.to_string()),
                started_at_ms: now,
                updated_at_ms: now,
            };
            rows.insert(slot, record.clone());
            return Ok(Reservation::Acquired(record));
        };

        if existing.status == StepStatus::Completed {
            return Ok(Reservation::Cached(existing.clone()));
        }

        if existing.status == StepStatus::Running {
            let stale = now - existing.updated_at_ms > lease_ms as i64;
            let same_owner = existing.owner.as_deref() == Some(owner);
            if !stale && !same_owner {
                return Ok(Reservation::RunningElsewhere(existing.clone()));
            }
        }

        existing.status = StepStatus::Running;
        existing.owner = Some(owner.to_string());
        existing.output_json = None;
        existing.output_type = None;
        existing.error_message = None;
        existing.attempt += 1;
        existing.updated_at_ms = now;
        Ok(Reservation::Acquired(existing.clone()))
    }

    fn complete(
        &self,
        workflow_id: &str,
        step_key: &str,
        owner: &str,
        output_json: Option<&str>,
        output_type: &str,
    ) -> Result<(), EngineError> {
        let mut rows = self.lock()?;
        let slot = (workflow_id.to_string(), step_key.to_string());
        match rows.get_mut(&slot) {
            Some(record) if record.owner.as_deref() == Some(owner) => {
                record.status = StepStatus::Completed;
                record.output_json = output_json.map(str::to_string);
                record.output_type = Some(output_type.to_string());
                record.error_message = None;
                record.updated_at_ms = now_ms();
                Ok(())
            }
            _ => Err(EngineError::OwnershipLost {
                step_key: step_key.to_string(),
            }),
        }
    }

    fn fail(
        &self,
        workflow_id: &str,
        step_key: &str,
        owner: &str,
        error_message: &str,
    ) -> Result<(), EngineError> {
        let mut rows = self.lock()?;
        let slot = (workflow_id.to_string(), step_key.to_string());
        match rows.get_mut(&slot) {
            Some(record) if record.owner.as_deref() == Some(owner) => {
                record.status = StepStatus::Failed;
                record.error_message = Some(error_message.to_string());
                record.updated_at_ms = now_ms();
                Ok(())
            }
            _ => Err(EngineError::OwnershipLost {
                step_key: step_key.to_string(),
            }),
        }
    }

    fn scan(
        &self,
        workflow_id: &str,
        status: Option<StepStatus>,
    ) -> Result<Vec<StepRecord>, EngineError> {
        let rows = self.lock()?;
        let mut records: Vec<StepRecord> = rows
            .values()
            .filter(|r| r.workflow_id == workflow_id)
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            (a.started_at_ms, &a.step_key).cmp(&(b.started_at_ms, &b.step_key))
        });
        Ok(records)
    }
}
