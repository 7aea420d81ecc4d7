//! The remote session object: two scoped storage clients over a local
//! SQLite cache, a connection lifecycle, and the event stream the adapter
//! forwards to subscribers.
//!
//! The session is bound to the fixed application-private scope
//! `web-tiled`. The remote side of the protocol is owned elsewhere; this
//! module models the session's observable behavior — local reads and
//! writes, connection state, and the lifecycle events a sync cycle fires.

use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use super::events::{EventName, SessionBroadcaster, SessionEvent};
use super::StoreError;

/// The application-private storage scope every client is bound to.
pub const DATA_PATH: &str = "web-tiled";

/// Access mode claimed for the scope at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// A file read back from a scope.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub mime_type: String,
    pub body: String,
    pub revision: String,
}

/// One scope's view of the store. The session hands out a private and a
/// public client; paths are relative to the scope root.
#[async_trait]
pub trait ScopedClient: Send + Sync {
    async fn get_object(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Store a typed object. Returns the new revision.
    async fn store_object(
        &self,
        object_type: &str,
        path: &str,
        body: &Value,
    ) -> Result<String, StoreError>;

    /// `max_age` is the oldest acceptable cached copy in milliseconds.
    /// The local cache is authoritative here, so the hint is accepted but
    /// not acted on.
    async fn get_file(&self, path: &str, max_age: Option<i64>)
        -> Result<Option<StoredFile>, StoreError>;

    /// Store a file. Returns the new revision.
    async fn store_file(
        &self,
        mime_type: &str,
        path: &str,
        body: &str,
    ) -> Result<String, StoreError>;

    /// List the immediate children under `path`. Child folders appear with
    /// a trailing slash mapped to `true`; files map to their revision.
    async fn get_listing(&self, path: &str, max_age: Option<i64>) -> Result<Value, StoreError>;
}

// ─── SQLite-backed scope ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub(crate) enum Scope {
    Private,
    Public,
}

impl Scope {
    fn as_str(&self) -> &'static str {
        match self {
            Scope::Private => "private",
            Scope::Public => "public",
        }
    }
}

/// One scope of the local cache (WAL-mode SQLite shared between both
/// scopes via a `scope` column).
pub(crate) struct SqliteScopedClient {
    pool: SqlitePool,
    scope: Scope,
}

impl SqliteScopedClient {
    pub(crate) fn new(pool: SqlitePool, scope: Scope) -> Self {
        Self { pool, scope }
    }
}

#[async_trait]
impl ScopedClient for SqliteScopedClient {
    async fn get_object(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT body FROM objects WHERE scope = ? AND path = ?")
                .bind(self.scope.as_str())
                .bind(path)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((body,)) => {
                let value = serde_json::from_str(&body)
                    .map_err(|e| StoreError::Operation(format!("corrupt object at {path}: {e}")))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn store_object(
        &self,
        object_type: &str,
        path: &str,
        body: &Value,
    ) -> Result<String, StoreError> {
        // Revisions are opaque etag-style ids, not timestamps.
        let revision = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO objects (scope, path, object_type, body, revision, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (scope, path) DO UPDATE SET
                 object_type = excluded.object_type,
                 body = excluded.body,
                 revision = excluded.revision,
                 updated_at = excluded.updated_at",
        )
        .bind(self.scope.as_str())
        .bind(path)
        .bind(object_type)
        .bind(body.to_string())
        .bind(&revision)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(revision)
    }

    async fn get_file(
        &self,
        path: &str,
        _max_age: Option<i64>,
    ) -> Result<Option<StoredFile>, StoreError> {
        let row: Option<(String, String, String)> = sqlx::query_as(
            "SELECT mime_type, body, revision FROM files WHERE scope = ? AND path = ?",
        )
        .bind(self.scope.as_str())
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(mime_type, body, revision)| StoredFile {
            mime_type,
            body,
            revision,
        }))
    }

    async fn store_file(
        &self,
        mime_type: &str,
        path: &str,
        body: &str,
    ) -> Result<String, StoreError> {
        let revision = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO files (scope, path, mime_type, body, revision, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (scope, path) DO UPDATE SET
                 mime_type = excluded.mime_type,
                 body = excluded.body,
                 revision = excluded.revision,
                 updated_at = excluded.updated_at",
        )
        .bind(self.scope.as_str())
        .bind(path)
        .bind(mime_type)
        .bind(body)
        .bind(&revision)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(revision)
    }

    async fn get_listing(&self, path: &str, _max_age: Option<i64>) -> Result<Value, StoreError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT path, revision FROM files WHERE scope = ? AND path LIKE ? ORDER BY path",
        )
        .bind(self.scope.as_str())
        .bind(format!("{path}%"))
        .fetch_all(&self.pool)
        .await?;

        // Collapse to immediate children: nested entries contribute one
        // `folder/` key each.
        let mut listing = serde_json::Map::new();
        for (full_path, revision) in rows {
            let rest = &full_path[path.len()..];
            match rest.split_once('/') {
                Some((folder, _)) => {
                    listing.insert(format!("{folder}/"), Value::Bool(true));
                }
                None => {
                    listing.insert(rest.to_string(), Value::String(revision));
                }
            }
        }
        Ok(Value::Object(listing))
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// Connection descriptor exposed as the `connected` event payload.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDescriptor {
    pub user_address: Option<String>,
    pub connected: bool,
}

/// Initialization states. `Ready` is terminal; operations may only be
/// dispatched against a `Ready` session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    NotInitialized,
    RuntimeLoaded,
    SessionConstructed,
    Ready,
}

/// The remote session: scoped clients, connection lifecycle, event stream.
pub struct RemoteSession {
    access: AccessMode,
    caching_enabled: bool,
    private: Arc<dyn ScopedClient>,
    public: Arc<dyn ScopedClient>,
    events: SessionBroadcaster,
    remote: RwLock<RemoteDescriptor>,
    sync_interval_ms: AtomicU64,
    state: RwLock<InitState>,
}

impl RemoteSession {
    /// Bring the session up: load the storage runtime, bind the scope,
    /// install the sync loop, and only then hand out the handle.
    pub async fn open(data_dir: &Path, sync_interval_ms: u64) -> Result<Arc<Self>> {
        debug!(state = ?InitState::NotInitialized, "session init");
        let pool = open_pool(data_dir)
            .await
            .context("failed to open session store")?;
        debug!(state = ?InitState::RuntimeLoaded, "session init");

        // Bind to the application-private scope: claim rw access and
        // enable local caching for `/web-tiled/`.
        let session = Arc::new(Self {
            access: AccessMode::ReadWrite,
            caching_enabled: true,
            private: Arc::new(SqliteScopedClient::new(pool.clone(), Scope::Private)),
            public: Arc::new(SqliteScopedClient::new(pool, Scope::Public)),
            events: SessionBroadcaster::new(),
            remote: RwLock::new(RemoteDescriptor::default()),
            sync_interval_ms: AtomicU64::new(sync_interval_ms),
            state: RwLock::new(InitState::SessionConstructed),
        });
        debug!(state = ?InitState::SessionConstructed, "session init");

        session.spawn_sync_loop();
        *session.state.write().expect("state lock poisoned") = InitState::Ready;
        info!(scope = DATA_PATH, sync_interval_ms, "remote session ready");
        Ok(session)
    }

    /// Test constructor with injected clients and no backing store.
    #[cfg(test)]
    pub(crate) fn with_clients(
        private: Arc<dyn ScopedClient>,
        public: Arc<dyn ScopedClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            access: AccessMode::ReadWrite,
            caching_enabled: true,
            private,
            public,
            events: SessionBroadcaster::new(),
            remote: RwLock::new(RemoteDescriptor::default()),
            sync_interval_ms: AtomicU64::new(60_000),
            state: RwLock::new(InitState::Ready),
        })
    }

    pub fn events(&self) -> &SessionBroadcaster {
        &self.events
    }

    /// Lifecycle events describing the session's current state.
    ///
    /// The session reaches `Ready` before any subscriber can exist, so
    /// these are delivered to each subscriber when it attaches instead of
    /// being broadcast once at startup: `features-loaded`, `ready`, then
    /// `connected` (with the remote descriptor) or `not-connected`.
    pub fn attach_events(&self) -> Vec<SessionEvent> {
        let mut events = vec![
            SessionEvent {
                name: EventName::FeaturesLoaded,
                data: json!({ "scope": format!("/{DATA_PATH}/") }),
            },
            SessionEvent {
                name: EventName::Ready,
                data: Value::Null,
            },
        ];
        let remote = self.remote.read().expect("remote lock poisoned");
        if remote.connected {
            events.push(SessionEvent {
                name: EventName::Connected,
                data: serde_json::to_value(remote.clone()).unwrap_or(Value::Null),
            });
        } else {
            events.push(SessionEvent {
                name: EventName::NotConnected,
                data: Value::Null,
            });
        }
        events
    }

    pub fn private(&self) -> &Arc<dyn ScopedClient> {
        &self.private
    }

    pub fn public(&self) -> &Arc<dyn ScopedClient> {
        &self.public
    }

    pub fn state(&self) -> InitState {
        *self.state.read().expect("state lock poisoned")
    }

    pub fn access(&self) -> AccessMode {
        self.access
    }

    pub fn caching_enabled(&self) -> bool {
        self.caching_enabled
    }

    pub fn is_connected(&self) -> bool {
        self.remote.read().expect("remote lock poisoned").connected
    }

    /// Connect the session to a remote. `data` is the user address, either
    /// a bare string or `{ "userAddress": ... }`.
    pub fn connect(&self, data: &Value) {
        let user_address = data
            .as_str()
            .map(str::to_string)
            .or_else(|| {
                data.get("userAddress")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });

        self.events.emit(EventName::Connecting, Value::Null);
        self.events.emit(EventName::Authing, Value::Null);

        let descriptor = {
            let mut remote = self.remote.write().expect("remote lock poisoned");
            remote.user_address = user_address;
            remote.connected = true;
            remote.clone()
        };
        info!(user = ?descriptor.user_address, "session connected");

        // The connected payload is the remote descriptor, not the call arg.
        self.events.emit(
            EventName::Connected,
            serde_json::to_value(descriptor).unwrap_or(Value::Null),
        );
    }

    /// Disconnect from the remote. Local caching stays enabled.
    pub fn disconnect(&self, _data: &Value) {
        {
            let mut remote = self.remote.write().expect("remote lock poisoned");
            remote.connected = false;
        }
        info!("session disconnected");
        self.events.emit(EventName::Disconnected, Value::Null);
    }

    /// Change the sync interval. Takes effect on the next sync pass.
    pub fn set_sync_interval(&self, ms: u64) {
        let old = self.sync_interval_ms.swap(ms, Ordering::Relaxed);
        self.events.emit(
            EventName::SyncIntervalChange,
            json!({ "oldValue": old, "newValue": ms }),
        );
    }

    pub fn sync_interval_ms(&self) -> u64 {
        self.sync_interval_ms.load(Ordering::Relaxed)
    }

    /// One sync pass. Only the lifecycle events are observable from here;
    /// the wire protocol itself belongs to the remote side.
    fn sync_pass(&self) {
        self.events.emit(EventName::WireBusy, Value::Null);
        self.events
            .emit(EventName::SyncReqDone, json!({ "scope": format!("/{DATA_PATH}/") }));
        self.events.emit(EventName::WireDone, Value::Null);
        self.events
            .emit(EventName::SyncDone, json!({ "completed": true }));
    }

    fn spawn_sync_loop(self: &Arc<Self>) {
        // Weak handle — the loop must not keep a dropped session alive.
        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let interval = match session.upgrade() {
                    Some(s) => s.sync_interval_ms(),
                    None => break,
                };
                tokio::time::sleep(Duration::from_millis(interval.max(1))).await;
                match session.upgrade() {
                    Some(s) if s.is_connected() => s.sync_pass(),
                    Some(_) => {}
                    None => break,
                }
            }
            debug!("sync loop stopped");
        });
    }
}

/// Open the WAL-mode SQLite pool backing the local cache and run
/// migrations.
async fn open_pool(data_dir: &Path) -> Result<SqlitePool> {
    tokio::fs::create_dir_all(data_dir).await?;
    let db_path = data_dir.join("tiledd.db");
    let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .create_if_missing(true);
    let pool = SqlitePool::connect_with(opts).await?;
    sqlx::migrate!("src/store/migrations")
        .run(&pool)
        .await
        .context("failed to run store migrations")?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_session() -> (Arc<RemoteSession>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let session = RemoteSession::open(dir.path(), 60_000).await.unwrap();
        (session, dir)
    }

    #[tokio::test]
    async fn open_reaches_ready_state() {
        let (session, _dir) = test_session().await;
        assert_eq!(session.state(), InitState::Ready);
        assert_eq!(session.access(), AccessMode::ReadWrite);
        assert!(session.caching_enabled());
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn objects_roundtrip_per_scope() {
        let (session, _dir) = test_session().await;
        let config = serde_json::json!({ "file": "hello.json" });
        session
            .private()
            .store_object("web-tiled-config", ".config", &config)
            .await
            .unwrap();

        let got = session.private().get_object(".config").await.unwrap();
        assert_eq!(got, Some(config));
        // The public scope must not see private objects.
        let public = session.public().get_object(".config").await.unwrap();
        assert_eq!(public, None);
    }

    #[tokio::test]
    async fn listing_collapses_to_immediate_children() {
        let (session, _dir) = test_session().await;
        let private = session.private();
        private
            .store_file("application/json", "files/demo.json", "{}")
            .await
            .unwrap();
        private
            .store_file("application/json", "files/packs/dungeon.json", "{}")
            .await
            .unwrap();
        private
            .store_file("application/json", "files/packs/forest.json", "{}")
            .await
            .unwrap();

        let listing = private.get_listing("files/", None).await.unwrap();
        let listing = listing.as_object().unwrap();
        assert_eq!(listing.len(), 2);
        assert!(listing["demo.json"].is_string());
        assert_eq!(listing["packs/"], Value::Bool(true));
    }

    #[tokio::test]
    async fn connect_emits_lifecycle_with_remote_descriptor() {
        let (session, _dir) = test_session().await;
        let mut events = session.events().subscribe();
        session.connect(&serde_json::json!("user@storage.example"));

        let connecting = events.recv().await.unwrap();
        assert_eq!(connecting.name, EventName::Connecting);
        let authing = events.recv().await.unwrap();
        assert_eq!(authing.name, EventName::Authing);
        let connected = events.recv().await.unwrap();
        assert_eq!(connected.name, EventName::Connected);
        assert_eq!(connected.data["userAddress"], "user@storage.example");
        assert_eq!(connected.data["connected"], true);
        assert!(session.is_connected());

        session.disconnect(&Value::Null);
        let disconnected = events.recv().await.unwrap();
        assert_eq!(disconnected.name, EventName::Disconnected);
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn attach_events_reflect_connection_state() {
        let (session, _dir) = test_session().await;
        let names: Vec<_> = session.attach_events().iter().map(|e| e.name).collect();
        assert_eq!(
            names,
            vec![
                EventName::FeaturesLoaded,
                EventName::Ready,
                EventName::NotConnected
            ]
        );

        session.connect(&serde_json::json!("user@storage.example"));
        let events = session.attach_events();
        assert_eq!(events[2].name, EventName::Connected);
        assert_eq!(events[2].data["userAddress"], "user@storage.example");
    }

    #[tokio::test]
    async fn sync_interval_change_fires_event() {
        let (session, _dir) = test_session().await;
        let mut events = session.events().subscribe();
        session.set_sync_interval(30_000);
        let ev = events.recv().await.unwrap();
        assert_eq!(ev.name, EventName::SyncIntervalChange);
        assert_eq!(ev.data["oldValue"], 60_000);
        assert_eq!(ev.data["newValue"], 30_000);
        assert_eq!(session.sync_interval_ms(), 30_000);
    }
}
