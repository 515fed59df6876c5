//! Value codec: serialize a step's output with a type tag; restore a typed
//! value from the pair.
//!
//! The store preserves only text, but the workflow must observe the same
//! typed value on replay as on first execution. The tag namespace is owned by
//! this implementation (`std::any::type_name`); stored workflows are not
//! portable across incompatible tag schemes.

use std::any::TypeId;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::engine::store::EngineError;

/// Reserved tag meaning "null/void": the step returned `()`.
pub const VOID_TAG: &str = "void";

/// JSON codec over serde; one tag per concrete output type.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl JsonCodec {
    /// The tag written for outputs of type `T`.
    pub fn type_tag<T: 'static>() -> &'static str {
        std::any::type_name::<T>()
    }

    /// Serializes a step output into `(payload, type_tag)`. A void result
    /// encodes as `(None, VOID_TAG)`.
    pub fn encode<T>(&self, value: &T) -> Result<(Option<String>, String), EngineError>
    where
        T: Serialize + 'static,
    {
        if TypeId::of::<T>() == TypeId::of::<()>() {
            return Ok((None, VOID_TAG.to_string()));
        }
        let payload = serde_json::to_string(value)
            .map_err(|e| EngineError::Codec(format!("serialize step output: {e}")))?;
        Ok((Some(payload), Self::type_tag::<T>().to_string()))
    }

    /// Restores a typed value from a stored `(payload, type_tag)` pair.
    ///
    /// `VOID_TAG` or a missing payload decodes as JSON null. A tag that does
    /// not name `T`, or a payload that does not parse as `T`, is fatal for
    /// that step's replay.
    pub fn decode<T>(&self, payload: Option<&str>, type_tag: &str) -> Result<T, EngineError>
    where
        T: DeserializeOwned + 'static,
    {
        let payload = match payload {
            Some(payload) if type_tag != VOID_TAG => payload,
            _ => {
                return serde_json::from_str("null").map_err(|e| {
                    EngineError::Codec(format!("decode void output as requested type: {e}"))
                })
            }
        };
        if type_tag != Self::type_tag::<T>() {
            return Err(EngineError::Codec(format!(
                "unknown cached output type tag: {type_tag} (decoder registered for {})",
                Self::type_tag::<T>()
            )));
        }
        serde_json::from_str(payload)
            .map_err(|e| EngineError::Codec(format!("decode cached step output: {e}")))
    }
}
