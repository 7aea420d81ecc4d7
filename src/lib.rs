pub mod config;
pub mod ipc;
pub mod protocol;
pub mod store;
pub mod worker;

use std::sync::Arc;

use config::DaemonConfig;
use store::session::RemoteSession;
use store::StoreAdapter;
use worker::BuildWorker;

/// Shared daemon state passed to every bridge connection.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    /// The remote session the store adapter relays to.
    pub session: Arc<RemoteSession>,
    /// Storage operation dispatch + lifecycle event forwarding.
    pub store: StoreAdapter,
    /// Handle to the background build worker.
    pub worker: BuildWorker,
    pub started_at: std::time::Instant,
}
