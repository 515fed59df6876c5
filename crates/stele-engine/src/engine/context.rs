//! Durable context: the `step` primitive.
//!
//! One `step` call runs reserve → execute → commit. A CACHED reservation
//! decodes the stored output and skips the side effect; RUNNING_ELSEWHERE is
//! polled for up to one lease before giving up; an ACQUIRED claim executes
//! the user function outside any store transaction and commits the result
//! under the owner guard. Crash-policy phases are consulted at each boundary.
//!
//! The context is Clone and safe for concurrent calls on distinct keys:
//! worker tasks share the key generator and logical clock, while the
//! current-step-key register is thread-local to each worker.

use std::cell::RefCell;
use std::panic::Location;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::engine::codec::{JsonCodec, VOID_TAG};
use crate::engine::crash::{CrashPhase, CrashPolicy};
use crate::engine::identity::{StepKey, WorkerId, WorkflowId};
use crate::engine::record::Reservation;
use crate::engine::step_key::{normalize_step_id, StepKeyGenerator, StepKeys};
use crate::engine::store::{EngineError, StepError, StepStore};

/// Poll interval while a step is RUNNING on another worker.
const RUNNING_POLL: Duration = Duration::from_millis(100);
/// Floor of the RUNNING_ELSEWHERE wait window.
const MIN_LEASE_WAIT_MS: u64 = 300;

thread_local! {
    static CURRENT_STEP_KEY: RefCell<Option<StepKey>> = const { RefCell::new(None) };
}

/// Restores the previous current-step-key on drop, so nested steps unwind
/// LIFO even when the step function panics.
struct StepKeyScope {
    previous: Option<StepKey>,
}

impl StepKeyScope {
    fn enter(step_key: &StepKey) -> Self {
        let previous = CURRENT_STEP_KEY.with(|slot| slot.replace(Some(step_key.clone())));
        Self { previous }
    }
}

impl Drop for StepKeyScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_STEP_KEY.with(|slot| *slot.borrow_mut() = previous);
    }
}

struct ContextInner {
    workflow_id: WorkflowId,
    store: Arc<dyn StepStore>,
    codec: JsonCodec,
    lease_ms: u64,
    worker_id: WorkerId,
    crash_policy: CrashPolicy,
    keys: StepKeyGenerator,
}

/// Handle a workflow procedure runs against.
#[derive(Clone)]
pub struct DurableContext {
    inner: Arc<ContextInner>,
}

impl DurableContext {
    pub(crate) fn new(
        workflow_id: WorkflowId,
        store: Arc<dyn StepStore>,
        lease_ms: u64,
        worker_id: WorkerId,
        crash_policy: CrashPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                workflow_id,
                store,
                codec: JsonCodec,
                lease_ms,
                worker_id,
                crash_policy,
                keys: StepKeyGenerator::new(),
            }),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.inner.workflow_id
    }

    /// Key of the step currently executing on this worker thread, if any.
    /// Set around the step function and restored LIFO across nested steps.
    pub fn current_step_key(&self) -> Option<StepKey> {
        CURRENT_STEP_KEY.with(|slot| slot.borrow().clone())
    }

    /// Checkpointed execution of `f` under the logical name `id`.
    ///
    /// On first execution the result is committed to the store; on replay the
    /// stored result is decoded and `f` is not invoked.
    #[track_caller]
    pub fn step<T, F>(&self, id: &str, f: F) -> Result<T, EngineError>
    where
        T: Serialize + DeserializeOwned + 'static,
        F: FnOnce() -> Result<T, StepError>,
    {
        let step_id = normalize_step_id(id)?;
        let keys = self.inner.keys.next(&step_id, Location::caller());
        self.step_with_keys(&step_id, &keys, f)
    }

    /// [DurableContext::step] with an id derived from the call site.
    #[track_caller]
    pub fn step_auto<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        T: Serialize + DeserializeOwned + 'static,
        F: FnOnce() -> Result<T, StepError>,
    {
        let callsite = Location::caller();
        let step_id = StepKeyGenerator::auto_step_id(callsite);
        let keys = self.inner.keys.next(&step_id, callsite);
        self.step_with_keys(&step_id, &keys, f)
    }

    /// [DurableContext::step] dispatched on the current Tokio runtime.
    #[track_caller]
    pub fn step_async<T, F>(&self, id: &str, f: F) -> tokio::task::JoinHandle<Result<T, EngineError>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Result<T, StepError> + Send + 'static,
    {
        self.step_async_on(id, f, &tokio::runtime::Handle::current())
    }

    /// [DurableContext::step] dispatched on an explicit runtime.
    ///
    /// The key is generated eagerly on the calling thread, so the async step
    /// observes the caller's call site and sequence position; the blocking
    /// step body runs via `spawn_blocking` and never occupies the reactor.
    #[track_caller]
    pub fn step_async_on<T, F>(
        &self,
        id: &str,
        f: F,
        handle: &tokio::runtime::Handle,
    ) -> tokio::task::JoinHandle<Result<T, EngineError>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Result<T, StepError> + Send + 'static,
    {
        let prepared = normalize_step_id(id).map(|step_id| {
            let keys = self.inner.keys.next(&step_id, Location::caller());
            (step_id, keys)
        });
        let context = self.clone();
        handle.spawn_blocking(move || {
            let (step_id, keys) = prepared?;
            context.step_with_keys(&step_id, &keys, f)
        })
    }

    fn step_with_keys<T, F>(&self, step_id: &str, keys: &StepKeys, f: F) -> Result<T, EngineError>
    where
        T: Serialize + DeserializeOwned + 'static,
        F: FnOnce() -> Result<T, StepError>,
    {
        match self.reserve_with_lease_wait(step_id, keys)? {
            Reservation::Cached(record) => {
                tracing::debug!(
                    workflow_id = %self.inner.workflow_id,
                    step_key = %keys.display_key,
                    "step cached, replaying stored output"
                );
                self.inner.codec.decode(
                    record.output_json.as_deref(),
                    record.output_type.as_deref().unwrap_or(VOID_TAG),
                )
            }
            Reservation::RunningElsewhere(record) => Err(EngineError::StepInProgress {
                step_key: record.step_key,
            }),
            Reservation::Acquired(record) => {
                tracing::debug!(
                    workflow_id = %self.inner.workflow_id,
                    step_key = %keys.display_key,
                    attempt = record.attempt,
                    "step acquired, executing"
                );
                self.execute_acquired(step_id, keys, f)
            }
        }
    }

    /// Reserves the key, polling through other workers' live leases until the
    /// state changes or the wait window (`max(lease_ms, 300ms)`) closes.
    fn reserve_with_lease_wait(
        &self,
        step_id: &str,
        keys: &StepKeys,
    ) -> Result<Reservation, EngineError> {
        let deadline =
            Instant::now() + Duration::from_millis(self.inner.lease_ms.max(MIN_LEASE_WAIT_MS));
        loop {
            let reservation = self.inner.store.reserve(
                &self.inner.workflow_id,
                &keys.store_key,
                step_id,
                &self.inner.worker_id,
                self.inner.lease_ms,
            )?;
            match reservation {
                Reservation::RunningElsewhere(_) if Instant::now() < deadline => {
                    std::thread::sleep(RUNNING_POLL);
                }
                settled => return Ok(settled),
            }
        }
    }

    fn execute_acquired<T, F>(&self, step_id: &str, keys: &StepKeys, f: F) -> Result<T, EngineError>
    where
        T: Serialize + DeserializeOwned + 'static,
        F: FnOnce() -> Result<T, StepError>,
    {
        self.maybe_crash(step_id, keys, CrashPhase::BeforeExecute);

        let output = {
            let _scope = StepKeyScope::enter(&keys.store_key);
            f()
        };
        let output = match output {
            Ok(output) => output,
            Err(source) => {
                let suppressed = self
                    .inner
                    .store
                    .fail(
                        &self.inner.workflow_id,
                        &keys.store_key,
                        &self.inner.worker_id,
                        &source.to_string(),
                    )
                    .err()
                    .map(|store_err| store_err.to_string());
                return Err(EngineError::StepFailed {
                    step_key: keys.store_key.clone(),
                    source,
                    suppressed,
                });
            }
        };

        self.maybe_crash(step_id, keys, CrashPhase::AfterExecuteBeforeCommit);

        let (output_json, output_type) = self.inner.codec.encode(&output)?;
        self.inner.store.complete(
            &self.inner.workflow_id,
            &keys.store_key,
            &self.inner.worker_id,
            output_json.as_deref(),
            &output_type,
        )?;

        self.maybe_crash(step_id, keys, CrashPhase::AfterCommit);
        Ok(output)
    }

    fn maybe_crash(&self, step_id: &str, keys: &StepKeys, phase: CrashPhase) {
        if self.inner.crash_policy.should_crash(step_id, phase) {
            tracing::error!(
                step_id,
                step_key = %keys.display_key,
                %phase,
                "simulated crash, halting the process without cleanup"
            );
            std::process::abort();
        }
    }
}
