//! Stele engine core.
//!
//! Minimal complete set of interfaces: step identity (deterministic keys under
//! loops and parallelism), the step store (atomic read-or-claim-or-refuse
//! reservations with lease recovery), the durable context (reserve → execute →
//! commit with cached replay), and the crash-injection policy used by
//! durability tests.

pub mod codec;
pub mod context;
pub mod crash;
pub mod driver;
pub mod identity;
pub mod memory_store;
pub mod record;
#[cfg(feature = "sqlite-persistence")]
pub mod sqlite_store;
pub mod step_key;
pub mod store;

pub use codec::{JsonCodec, VOID_TAG};
pub use context::DurableContext;
pub use crash::{CrashPhase, CrashPolicy};
pub use driver::{DurableEngine, EngineOptions, DEFAULT_LEASE_MS};
pub use identity::{StepId, StepKey, WorkerId, WorkflowId};
pub use memory_store::InMemoryStepStore;
pub use record::{Reservation, StepRecord, StepStatus};
#[cfg(feature = "sqlite-persistence")]
pub use sqlite_store::SqliteStepStore;
pub use step_key::StepKeyGenerator;
pub use store::{EngineError, StepError, StepStore};
