//! Crash-injection policy for durability tests.
//!
//! A declarative rule `{step_id, phase}` consulted at each phase boundary of
//! a step. On a match the process is halted at the OS level, with no
//! destructors and no unwinding, so the store is left with exactly the state
//! that existed at the boundary. Durability tests depend on that contract.

use std::fmt;
use std::str::FromStr;

use crate::engine::store::EngineError;

/// Phase boundary at which a simulated crash may trigger.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CrashPhase {
    #[default]
    None,
    BeforeExecute,
    AfterExecuteBeforeCommit,
    AfterCommit,
}

impl CrashPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrashPhase::None => "none",
            CrashPhase::BeforeExecute => "before-execute",
            CrashPhase::AfterExecuteBeforeCommit => "after-execute-before-commit",
            CrashPhase::AfterCommit => "after-commit",
        }
    }
}

impl fmt::Display for CrashPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CrashPhase {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(CrashPhase::None),
            "before-execute" => Ok(CrashPhase::BeforeExecute),
            "after-execute-before-commit" => Ok(CrashPhase::AfterExecuteBeforeCommit),
            "after-commit" => Ok(CrashPhase::AfterCommit),
            other => Err(EngineError::Config(format!(
                "unsupported crash phase: {other}"
            ))),
        }
    }
}

/// Rule deciding whether to hard-halt at a phase boundary.
///
/// A blank or absent `step_id` matches any step.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CrashPolicy {
    pub step_id: Option<String>,
    pub phase: CrashPhase,
}

impl CrashPolicy {
    /// Policy that never crashes.
    pub const fn none() -> Self {
        Self {
            step_id: None,
            phase: CrashPhase::None,
        }
    }

    /// Crash any step at `phase`.
    pub fn at_phase(phase: CrashPhase) -> Self {
        Self {
            step_id: None,
            phase,
        }
    }

    /// Crash only `step_id` at `phase`.
    pub fn for_step(step_id: impl Into<String>, phase: CrashPhase) -> Self {
        Self {
            step_id: Some(step_id.into()),
            phase,
        }
    }

    pub fn should_crash(&self, current_step_id: &str, current_phase: CrashPhase) -> bool {
        if self.phase == CrashPhase::None || current_phase != self.phase {
            return false;
        }
        match &self.step_id {
            None => true,
            Some(step_id) if step_id.trim().is_empty() => true,
            Some(step_id) => step_id == current_step_id,
        }
    }
}
