//! Stele: a durable execution engine.
//!
//! A workflow is an ordinary procedure written against a [engine::DurableContext];
//! every side-effecting fragment wrapped in `step(id, fn)` is checkpointed to a
//! relational step store. Re-running the same workflow id against the same store
//! replays completed steps from their cached results instead of re-executing
//! them, so side effects advance at-most-once per workflow instance up to the
//! granularity of a step.

pub mod engine;

pub use engine::{
    CrashPhase, CrashPolicy, DurableContext, DurableEngine, EngineError, EngineOptions,
    InMemoryStepStore, JsonCodec, Reservation, StepError, StepRecord, StepStatus, StepStore,
    VOID_TAG,
};
#[cfg(feature = "sqlite-persistence")]
pub use engine::SqliteStepStore;
