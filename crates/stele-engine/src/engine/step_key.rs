//! Deterministic step keys under loops, conditionals, and parallelism.
//!
//! Each `step` invocation maps to `step_id::<callsite_hash>::<sequence>`:
//! identical on replay of the same code path, distinct across repeated visits
//! to the same call site. The generator also stamps a logical-clock tick into
//! a display key for logs; the tick is **not** part of the stored key, so
//! replay keys match original keys (the stored key depends only on
//! `(step_id, callsite, sequence)`).

use std::collections::HashMap;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use crate::engine::identity::{StepId, StepKey};
use crate::engine::store::EngineError;

/// Width of the hex-encoded callsite hash embedded in keys.
const CALLSITE_HASH_LEN: usize = 8;

/// Keys generated for one `step` invocation.
#[derive(Clone, Debug)]
pub struct StepKeys {
    /// Key the store is addressed with: `step_id::<callsite_hash>::<sequence>`.
    pub store_key: StepKey,
    /// Debugging form carrying all four fields:
    /// `step_id::t<clock_hex>::<callsite_hash>::<sequence>`.
    pub display_key: String,
    pub sequence: u64,
    pub tick: u64,
}

/// Maps each step invocation to a stable, unique key across runs.
///
/// Shared by all workers of one run: the clock is a single atomic counter and
/// the per-(step_id, callsite) sequence map uses locked insertion, so
/// concurrent `step` calls on distinct keys are safe.
pub struct StepKeyGenerator {
    clock: AtomicU64,
    sequences: Mutex<HashMap<String, u64>>,
}

impl StepKeyGenerator {
    pub fn new() -> Self {
        Self {
            clock: AtomicU64::new(0),
            sequences: Mutex::new(HashMap::new()),
        }
    }

    /// Next keys for `step_id` invoked from `callsite`. The sequence counter
    /// is per `(step_id, callsite)` and incremented before use.
    pub fn next(&self, step_id: &str, callsite: &Location<'_>) -> StepKeys {
        let callsite_hash = hash_callsite(callsite);
        let tick = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        let sequence = {
            // A panic while holding the lock cannot leave a counter half
            // updated; recover the map instead of propagating the poison.
            let mut sequences = self
                .sequences
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let counter = sequences
                .entry(format!("{step_id}|{callsite_hash}"))
                .or_insert(0);
            *counter += 1;
            *counter
        };

        StepKeys {
            store_key: format!("{step_id}::{callsite_hash}::{sequence}"),
            display_key: format!("{step_id}::t{tick:x}::{callsite_hash}::{sequence}"),
            sequence,
            tick,
        }
    }

    /// Logical id derived from the callsite when the user supplies none.
    pub fn auto_step_id(callsite: &Location<'_>) -> StepId {
        format!("auto-{}", hash_callsite(callsite))
    }
}

impl Default for StepKeyGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Trims a user-supplied step id; blank ids are rejected.
pub fn normalize_step_id(step_id: &str) -> Result<StepId, EngineError> {
    let trimmed = step_id.trim();
    if trimmed.is_empty() {
        return Err(EngineError::BlankStepId);
    }
    Ok(trimmed.to_string())
}

fn hash_callsite(callsite: &Location<'_>) -> String {
    let token = format!(
        "{}:{}:{}",
        callsite.file(),
        callsite.line(),
        callsite.column()
    );
    let digest = Sha256::digest(token.as_bytes());
    digest
        .iter()
        .take(CALLSITE_HASH_LEN / 2)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}
