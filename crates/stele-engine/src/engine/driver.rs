//! DurableEngine: binds a workflow id to a context and invokes the procedure.
//!
//! The facade does not catch user errors; they propagate to the caller, which
//! resumes by calling [DurableEngine::run] again with the same workflow id.

use std::sync::Arc;

use uuid::Uuid;

use crate::engine::context::DurableContext;
use crate::engine::crash::CrashPolicy;
use crate::engine::identity::WorkerId;
use crate::engine::store::{EngineError, StepStore};

/// Staleness threshold for reclaiming RUNNING rows left by crashed owners.
pub const DEFAULT_LEASE_MS: u64 = 3_000;

/// Engine construction options.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    pub lease_ms: u64,
    /// Owner tag written into rows; a fresh random id when unset.
    pub worker_id: Option<WorkerId>,
    pub crash_policy: CrashPolicy,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            lease_ms: DEFAULT_LEASE_MS,
            worker_id: None,
            crash_policy: CrashPolicy::none(),
        }
    }
}

/// Durable execution engine over a step store.
pub struct DurableEngine {
    store: Arc<dyn StepStore>,
    lease_ms: u64,
    worker_id: WorkerId,
    crash_policy: CrashPolicy,
}

impl DurableEngine {
    pub fn new(store: Arc<dyn StepStore>) -> Self {
        Self::with_options(store, EngineOptions::default())
    }

    pub fn with_options(store: Arc<dyn StepStore>, options: EngineOptions) -> Self {
        Self {
            store,
            lease_ms: options.lease_ms,
            worker_id: options
                .worker_id
                .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4())),
            crash_policy: options.crash_policy,
        }
    }

    /// Engine over a SQLite store at `path`, schema initialized.
    #[cfg(feature = "sqlite-persistence")]
    pub fn open_sqlite(
        path: impl Into<std::path::PathBuf>,
        options: EngineOptions,
    ) -> Result<Self, EngineError> {
        let store = crate::engine::sqlite_store::SqliteStepStore::new(path);
        store.initialize()?;
        Ok(Self::with_options(Arc::new(store), options))
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Runs `workflow` under `workflow_id`. Completed steps replay from the
    /// store; the rest execute and are checkpointed as they commit.
    pub fn run<T, W>(&self, workflow_id: &str, workflow: W) -> Result<T, EngineError>
    where
        W: FnOnce(&DurableContext) -> Result<T, EngineError>,
    {
        if workflow_id.trim().is_empty() {
            return Err(EngineError::BlankWorkflowId);
        }
        // A fresh context per run: sequence counters restart so replayed
        // invocations regenerate the keys of the original run.
        let context = DurableContext::new(
            workflow_id.to_string(),
            Arc::clone(&self.store),
            self.lease_ms,
            self.worker_id.clone(),
            self.crash_policy.clone(),
        );
        tracing::info!(workflow_id, worker_id = %self.worker_id, "running workflow");
        workflow(&context)
    }
}
