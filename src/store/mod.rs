//! Remote session adapter: a fixed table of storage operations plus
//! lifecycle-event forwarding, bridged to a subscriber over channels.
//!
//! Dispatch is by tagged variant — an unknown method name is caught at
//! decode and answered with an explicit error frame rather than looked up
//! dynamically. Replies are emitted in completion order: every call runs
//! in its own task, so a slow listing never delays a fast config read
//! queued behind it.

pub mod events;
pub mod session;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::protocol::{ErrorBody, Frame, StoreRequest};
use session::RemoteSession;

/// Path of the stored configuration object inside the private scope.
pub const CONFIG_PATH: &str = ".config";
/// Declared type of the configuration object.
pub const CONFIG_OBJECT_TYPE: &str = "web-tiled-config";
/// All files live under this prefix inside the scope.
pub const FILES_PREFIX: &str = "files/";

/// The fixed method table exported to the editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StoreMethod {
    GetConfig,
    SetConfig,
    GetFile,
    StoreFile,
    GetFiles,
    Connect,
    Disconnect,
}

impl StoreMethod {
    fn parse(name: &str) -> Option<Self> {
        serde_json::from_value(Value::String(name.to_string())).ok()
    }
}

/// Errors on the storage path. Each maps to a stable wire code.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage operation failed: {0}")]
    Operation(String),
    #[error("config is missing the required `file` string")]
    InvalidConfig,
    #[error("invalid params for `{method}`: {reason}")]
    InvalidParams {
        method: &'static str,
        reason: String,
    },
    #[error("unknown method `{0}`")]
    UnknownMethod(String),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Operation(_) => "StorageOperationFailure",
            StoreError::InvalidConfig => "InvalidConfig",
            StoreError::InvalidParams { .. } => "InvalidParams",
            StoreError::UnknownMethod(_) => "MethodNotFound",
        }
    }

    fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Operation(e.to_string())
    }
}

/// The adapter. Stateless beyond the session handle it relays to, so
/// clones are cheap and every in-flight call can own one.
#[derive(Clone)]
pub struct StoreAdapter {
    session: Arc<RemoteSession>,
}

impl StoreAdapter {
    pub fn new(session: Arc<RemoteSession>) -> Self {
        Self { session }
    }

    /// Bridge one subscriber: requests in, replies and lifecycle events out
    /// on the same sender. Both spawned tasks end when the subscriber goes
    /// away (request channel closed, send failing).
    pub fn rpc(&self, mut requests: mpsc::Receiver<StoreRequest>, send: mpsc::Sender<Frame>) {
        // Lifecycle event forwarding — one subscription per bridge,
        // installed before any request is served. The subscriber first
        // gets the session's current state (features-loaded, ready,
        // connected/not-connected), then the live stream.
        let mut lifecycle = self.session.events().subscribe();
        let attach = self.session.attach_events();
        let event_send = send.clone();
        tokio::spawn(async move {
            for event in attach {
                let frame = Frame::Event {
                    id: event.name,
                    data: event.data,
                };
                if event_send.send(frame).await.is_err() {
                    return;
                }
            }
            loop {
                match lifecycle.recv().await {
                    Ok(event) => {
                        let frame = Frame::Event {
                            id: event.name,
                            data: event.data,
                        };
                        if event_send.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "event forwarding lagged");
                    }
                }
            }
        });

        let adapter = self.clone();
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let adapter = adapter.clone();
                let send = send.clone();
                tokio::spawn(async move {
                    let StoreRequest { method, params, id } = request;
                    debug!(method = %method, "store dispatch");
                    let frame = match StoreMethod::parse(&method) {
                        Some(method) => match adapter.dispatch(method, params).await {
                            Ok(data) => Frame::Result { id, data },
                            Err(err) => {
                                warn!(method = ?method, error = %err, "store call failed");
                                Frame::Error {
                                    id,
                                    error: err.to_body(),
                                }
                            }
                        },
                        None => {
                            let err = StoreError::UnknownMethod(method);
                            warn!(error = %err, "store dispatch rejected");
                            Frame::Error {
                                id,
                                error: err.to_body(),
                            }
                        }
                    };
                    let _ = send.send(frame).await;
                });
            }
        });
    }

    /// Invoke one method with positional params.
    pub async fn dispatch(&self, method: StoreMethod, params: Vec<Value>) -> Result<Value, StoreError> {
        match method {
            StoreMethod::GetConfig => {
                self.get_config(required(&params, 0, "getConfig", "defaultConfig")?)
                    .await
            }
            StoreMethod::SetConfig => {
                self.set_config(required(&params, 0, "setConfig", "config")?)
                    .await
            }
            StoreMethod::GetFile => {
                self.get_file(
                    string_arg(&params, 0, "getFile", "path")?,
                    max_age_arg(&params, 1),
                )
                .await
            }
            StoreMethod::StoreFile => {
                self.store_file(
                    string_arg(&params, 0, "storeFile", "mimeType")?,
                    string_arg(&params, 1, "storeFile", "path")?,
                    string_arg(&params, 2, "storeFile", "body")?,
                )
                .await
            }
            StoreMethod::GetFiles => self.get_files(max_age_arg(&params, 0)).await,
            StoreMethod::Connect => {
                self.session.connect(&params.first().cloned().unwrap_or(Value::Null));
                Ok(Value::Null)
            }
            StoreMethod::Disconnect => {
                self.session
                    .disconnect(&params.first().cloned().unwrap_or(Value::Null));
                Ok(Value::Null)
            }
        }
    }

    /// Read the stored configuration, writing `default` through on a miss.
    /// A later call returns the stored value, never the new default.
    pub async fn get_config(&self, default: Value) -> Result<Value, StoreError> {
        match self.session.private().get_object(CONFIG_PATH).await? {
            Some(config) => Ok(config),
            None => self.set_config(default).await,
        }
    }

    /// Validate and store the configuration, returning the stored value.
    pub async fn set_config(&self, config: Value) -> Result<Value, StoreError> {
        validate_config(&config)?;
        self.session
            .private()
            .store_object(CONFIG_OBJECT_TYPE, CONFIG_PATH, &config)
            .await?;
        Ok(config)
    }

    pub async fn get_file(&self, path: String, max_age: Option<i64>) -> Result<Value, StoreError> {
        let stored = self
            .session
            .private()
            .get_file(&format!("{FILES_PREFIX}{path}"), max_age)
            .await?;
        Ok(match stored {
            Some(file) => json!({
                "mimeType": file.mime_type,
                "body": file.body,
                "revision": file.revision,
            }),
            None => Value::Null,
        })
    }

    /// Store a file, returning its new revision.
    pub async fn store_file(
        &self,
        mime_type: String,
        path: String,
        body: String,
    ) -> Result<Value, StoreError> {
        let revision = self
            .session
            .private()
            .store_file(&mime_type, &format!("{FILES_PREFIX}{path}"), &body)
            .await?;
        Ok(Value::String(revision))
    }

    /// List both scopes concurrently. A failed listing collapses to an
    /// empty one for that scope only; the other scope is unaffected.
    pub async fn get_files(&self, max_age: Option<i64>) -> Result<Value, StoreError> {
        let (in_private, in_public) = tokio::join!(
            self.session.private().get_listing(FILES_PREFIX, max_age),
            self.session.public().get_listing(FILES_PREFIX, max_age),
        );
        if let Err(err) = &in_private {
            debug!(error = %err, "private listing failed — substituting empty");
        }
        if let Err(err) = &in_public {
            debug!(error = %err, "public listing failed — substituting empty");
        }
        let empty = || Value::Object(serde_json::Map::new());
        Ok(json!({
            "private": in_private.unwrap_or_else(|_| empty()),
            "public": in_public.unwrap_or_else(|_| empty()),
        }))
    }
}

/// The declared `web-tiled-config` shape: an object with a `file` string.
fn validate_config(config: &Value) -> Result<(), StoreError> {
    match config.get("file") {
        Some(Value::String(_)) => Ok(()),
        _ => Err(StoreError::InvalidConfig),
    }
}

fn required(
    params: &[Value],
    idx: usize,
    method: &'static str,
    name: &str,
) -> Result<Value, StoreError> {
    params
        .get(idx)
        .cloned()
        .ok_or_else(|| StoreError::InvalidParams {
            method,
            reason: format!("missing `{name}` at position {idx}"),
        })
}

fn string_arg(
    params: &[Value],
    idx: usize,
    method: &'static str,
    name: &str,
) -> Result<String, StoreError> {
    match params.get(idx) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(StoreError::InvalidParams {
            method,
            reason: format!("`{name}` must be a string, got {other}"),
        }),
        None => Err(StoreError::InvalidParams {
            method,
            reason: format!("missing `{name}` at position {idx}"),
        }),
    }
}

/// `maxAge` is optional everywhere it appears; absent or null means "any".
fn max_age_arg(params: &[Value], idx: usize) -> Option<i64> {
    params.get(idx).and_then(Value::as_i64)
}
