use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_PORT: u16 = 4370;
const DEFAULT_SYNC_INTERVAL_MS: u64 = 60_000;

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

// ─── StorageConfig ───────────────────────────────────────────────────────────

/// Remote-session storage configuration (`[storage]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Milliseconds between sync passes while connected (default: 60000).
    /// Changing it at runtime fires a `sync-interval-change` event.
    pub sync_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: DEFAULT_SYNC_INTERVAL_MS,
        }
    }
}

// ─── TOML config file ────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
#[derive(Debug, Clone, Deserialize, Default)]
struct TomlConfig {
    port: Option<u16>,
    bind_address: Option<String>,
    artifacts_dir: Option<PathBuf>,
    log: Option<String>,
    storage: Option<StorageConfig>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let raw = std::fs::read_to_string(&path).ok()?;
    match toml::from_str(&raw) {
        Ok(config) => Some(config),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── DaemonConfig ────────────────────────────────────────────────────────────

/// Resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Bridge WebSocket port.
    pub port: u16,
    /// Bind address for the WebSocket server (default: 127.0.0.1).
    pub bind_address: String,
    /// Data directory for the session cache and config.toml.
    pub data_dir: PathBuf,
    /// Directory holding installed build artifacts, one per subdirectory.
    pub artifacts_dir: PathBuf,
    /// Log level (trace, debug, info, warn, error).
    pub log: String,
    /// Remote-session storage settings.
    pub storage: StorageConfig,
}

impl DaemonConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        artifacts_dir: Option<PathBuf>,
        log: Option<String>,
        bind_address: Option<String>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);

        // Load TOML as the lowest-priority override layer
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let artifacts_dir = artifacts_dir
            .or(toml.artifacts_dir)
            .unwrap_or_else(|| data_dir.join("artifacts"));
        let bind_address = bind_address
            .or(toml.bind_address)
            .unwrap_or_else(default_bind_address);
        let storage = toml.storage.unwrap_or_default();

        Self {
            port,
            bind_address,
            data_dir,
            artifacts_dir,
            log,
            storage,
        }
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        // ~/Library/Application Support/tiledd
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("tiledd");
        }
    }
    #[cfg(target_os = "linux")]
    {
        // $XDG_DATA_HOME/tiledd or ~/.local/share/tiledd
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            if !xdg.is_empty() {
                return PathBuf::from(xdg).join("tiledd");
            }
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("tiledd");
        }
    }
    #[cfg(target_os = "windows")]
    {
        // %APPDATA%\tiledd
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("tiledd");
        }
    }
    PathBuf::from(".tiledd")
}
