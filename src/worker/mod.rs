//! Background build worker.
//!
//! Executes artifact builds off the interactive path. Requests arrive on a
//! channel and are handled one at a time, but a started run forwards its
//! completion from a spawned task — so builds overlap freely and finish in
//! execution order, not submission order.
//!
//! The worker owns the compiled-artifact cache for its whole lifetime:
//! each distinct reference is loaded and linked at most once, and entries
//! are never evicted or invalidated.

pub mod artifact;
pub mod dylib;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{ErrorBody, Frame};
use artifact::{ArtifactLoader, EntryPoint, RunFlags};

/// Errors on the build path. Each maps to a stable wire code so the editor
/// can tell a bad reference from a bad artifact.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The artifact reference could not be loaded and linked.
    #[error("failed to load artifact `{reference}`: {reason}")]
    LoadFailure { reference: String, reason: String },
    /// No namespace exposing `init` within the bounded search depth.
    #[error("no runnable entry point within {depth} namespace levels")]
    EntryPointNotFound { depth: usize },
    /// The artifact loaded but refused to start a run.
    #[error("artifact failed to start: {0}")]
    StartFailure(String),
}

impl BuildError {
    pub fn code(&self) -> &'static str {
        match self {
            BuildError::LoadFailure { .. } => "LoadFailure",
            BuildError::EntryPointNotFound { .. } => "EntryPointNotFound",
            BuildError::StartFailure(_) => "StartFailure",
        }
    }
}

/// One build submission, routed back to the submitting endpoint.
pub struct BuildRequest {
    /// Artifact reference.
    pub build: String,
    /// Caller-chosen correlation token, echoed back verbatim.
    pub run: Value,
    /// Level payload forwarded into the entry point untouched.
    pub level: Value,
    /// Where the single reply frame goes.
    pub reply_to: mpsc::Sender<Frame>,
}

/// Cloneable handle to the build worker.
#[derive(Clone)]
pub struct BuildWorker {
    tx: mpsc::Sender<BuildRequest>,
    in_flight: Arc<AtomicUsize>,
}

impl BuildWorker {
    /// Spawn the worker loop. The artifact cache lives inside the loop and
    /// dies with it.
    pub fn spawn(loader: Arc<dyn ArtifactLoader>) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let in_flight = Arc::new(AtomicUsize::new(0));
        tokio::spawn(run_loop(rx, loader, Arc::clone(&in_flight)));
        Self { tx, in_flight }
    }

    /// Submit a build. Exactly one `{run, data}` or `{run, error}` frame
    /// carrying the same token arrives later on `reply_to` — unless the
    /// artifact's instance never emits, which stalls only that call.
    pub async fn submit(&self, request: BuildRequest) {
        if self.tx.send(request).await.is_err() {
            warn!("build worker is gone — dropping submission");
        }
    }

    /// Number of builds currently awaiting their done signal.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}

async fn run_loop(
    mut rx: mpsc::Receiver<BuildRequest>,
    loader: Arc<dyn ArtifactLoader>,
    in_flight: Arc<AtomicUsize>,
) {
    let mut cache: HashMap<String, Arc<dyn EntryPoint>> = HashMap::new();

    while let Some(request) = rx.recv().await {
        let entry = match cache.get(&request.build) {
            Some(entry) => Arc::clone(entry),
            None => match loader.load(&request.build).await {
                Ok(entry) => {
                    info!(artifact = %request.build, name = entry.name(), "artifact loaded");
                    cache.insert(request.build.clone(), Arc::clone(&entry));
                    entry
                }
                Err(err) => {
                    warn!(artifact = %request.build, error = %err, "artifact load failed");
                    send_failure(&request.reply_to, request.run, &err).await;
                    continue;
                }
            },
        };

        match entry.start(RunFlags {
            level: request.level,
        }) {
            Ok(mut running) => {
                debug!(artifact = %request.build, "build started");
                in_flight.fetch_add(1, Ordering::Relaxed);
                let in_flight = Arc::clone(&in_flight);
                let reply_to = request.reply_to;
                let run = request.run;
                let build = request.build;
                tokio::spawn(async move {
                    // Forward the first done value only; later emissions
                    // from a chatty instance are dropped.
                    match running.done.recv().await {
                        Some(data) => {
                            let _ = reply_to.send(Frame::BuildDone { run, data }).await;
                        }
                        None => {
                            warn!(artifact = %build, "build instance exited without a result");
                        }
                    }
                    in_flight.fetch_sub(1, Ordering::Relaxed);
                });
            }
            Err(err) => {
                warn!(artifact = %request.build, error = %err, "build start failed");
                send_failure(&request.reply_to, request.run, &err).await;
            }
        }
    }
    debug!("build worker loop stopped");
}

async fn send_failure(reply_to: &mpsc::Sender<Frame>, run: Value, err: &BuildError) {
    let frame = Frame::BuildFailed {
        run,
        error: ErrorBody {
            code: err.code().to_string(),
            message: err.to_string(),
        },
    };
    let _ = reply_to.send(frame).await;
}
