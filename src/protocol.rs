//! Wire messages for the editor ↔ daemon bridge.
//!
//! Build submissions and storage RPC share one socket. Inbound frames are
//! told apart by their field set (`build`/`run`/`level` vs
//! `method`/`params`/`id`); outbound frames carry either a correlation
//! token or a lifecycle event name in their `id` position.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::events::EventName;

/// Build submission (editor → worker): `{ build, run, level }`.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildSubmit {
    /// Artifact reference — a directory name under the artifacts dir.
    pub build: String,
    /// Caller-chosen correlation token, echoed back verbatim. Must be
    /// unique per in-flight build; the worker does not check this.
    pub run: Value,
    /// Level payload forwarded into the artifact entry point untouched.
    pub level: Value,
}

/// Storage RPC request (editor → adapter): `{ method, params, id }`.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreRequest {
    pub method: String,
    /// Positional arguments for the method.
    #[serde(default)]
    pub params: Vec<Value>,
    /// Caller-chosen call token, echoed back in the reply.
    pub id: Value,
}

/// Error body attached to failure frames.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    /// Stable machine-readable code (e.g. `LoadFailure`, `MethodNotFound`).
    pub code: String,
    pub message: String,
}

/// Any inbound frame from the editor.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ClientFrame {
    Build(BuildSubmit),
    Store(StoreRequest),
}

/// Any outbound frame to the editor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Frame {
    /// `{ run, data }` — exactly one per successful build submission.
    BuildDone { run: Value, data: Value },
    /// `{ run, error }` — the build never produced a result.
    BuildFailed { run: Value, error: ErrorBody },
    /// `{ id, data }` — storage call result, emitted in completion order.
    Result { id: Value, data: Value },
    /// `{ id, error }` — storage call failure.
    Error { id: Value, error: ErrorBody },
    /// `{ id: <event-name>, data }` — forwarded session lifecycle event.
    Event { id: EventName, data: Value },
}
