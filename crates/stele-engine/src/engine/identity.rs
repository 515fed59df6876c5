//! Identity types for the stele engine.
//!
//! WorkflowId identifies a workflow instance; StepKey is the engine-generated
//! primary-key component identifying one step invocation within it; StepId is
//! the user-authored logical name; WorkerId tags the owner of a lease.

/// Identifies a workflow instance (caller-supplied, non-empty).
pub type WorkflowId = String;

/// Engine-generated key, unique within a workflow (`step_id::callsite::sequence`).
pub type StepKey = String;

/// User-supplied logical step name (or `auto-<hash>` when omitted).
pub type StepId = String;

/// Identifier of the worker currently holding a step lease.
pub type WorkerId = String;
