//! Typed gate messages.
//!
//! Every frame is a JSON object with a `type` tag. Correlated messages carry
//! an `id`, a monotonic per-gate integer assigned by the controller. One
//! `execute` may be preceded by any number of `event` frames sharing its id
//! before the single terminating `result`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-gate monotonic request id. The controller guarantees at most one
/// in-flight request per id.
pub type RequestId = u64;

/// Controller → gate.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateRequest {
    /// Run a bundled module with the given parameters.
    Execute {
        id: RequestId,
        module: String,
        params: Value,
        check_mode: bool,
    },
    /// Request gate build/runtime information.
    Info { id: RequestId },
    /// List the modules baked into the gate's bundle.
    ListModules { id: RequestId },
    /// Clean shutdown; the gate exits after closing its output stream.
    Shutdown,
}

/// Event kinds a module may stream while executing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Progress,
    Log,
    Data,
}

/// Gate → controller.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateResponse {
    /// Emitted once after startup; the gate accepts requests from here on.
    Ready,
    /// Terminal answer for a correlated request. Exactly one per `execute`.
    Result {
        id: RequestId,
        success: bool,
        changed: bool,
        output: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Mid-execution event belonging to the call identified by `id`.
    Event {
        id: RequestId,
        kind: EventKind,
        payload: Value,
    },
    /// Gate-level failure. With an id, the correlated call fails; without,
    /// the whole gate is considered poisoned.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<RequestId>,
        message: String,
    },
}

impl GateResponse {
    /// The request this frame correlates to, when any.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            GateResponse::Ready => None,
            GateResponse::Result { id, .. } | GateResponse::Event { id, .. } => Some(*id),
            GateResponse::Error { id, .. } => *id,
        }
    }
}
