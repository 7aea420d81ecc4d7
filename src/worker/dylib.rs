// SPDX-License-Identifier: MIT
//! Native build-artifact runtime.
//!
//! Loads compiled artifacts (`.so` / `.dylib` / `.dll`) via `libloading`.
//! An artifact directory holds an `artifact.json` manifest next to its
//! binary; the manifest's export namespace is walked for a runnable entry
//! point before the binary is ever opened.

use std::ffi::{c_char, c_void, CStr, CString};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use libloading::{Library, Symbol};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use tiledd_artifact_abi::{
    manifest::ArtifactManifest, TiledArtifact, TiledArtifactError, TILEDD_ARTIFACT_ABI_VERSION,
    TILEDD_ARTIFACT_INIT_SYMBOL,
};

use super::artifact::{find_entry_point, ArtifactLoader, EntryPoint, RunFlags, RunningBuild};
use super::BuildError;

/// Loads artifacts from `{artifacts_dir}/{reference}/artifact.json`.
pub struct DylibArtifactLoader {
    artifacts_dir: PathBuf,
}

impl DylibArtifactLoader {
    pub fn new(artifacts_dir: impl Into<PathBuf>) -> Self {
        Self {
            artifacts_dir: artifacts_dir.into(),
        }
    }
}

#[async_trait]
impl ArtifactLoader for DylibArtifactLoader {
    async fn load(&self, artifact_ref: &str) -> Result<Arc<dyn EntryPoint>, BuildError> {
        // References are plain directory names, never paths.
        if artifact_ref.is_empty()
            || artifact_ref.contains(['/', '\\'])
            || artifact_ref.starts_with('.')
        {
            return Err(load_failure(
                artifact_ref,
                "artifact reference must be a plain directory name",
            ));
        }

        let dir = self.artifacts_dir.join(artifact_ref);
        let manifest_json = tokio::fs::read_to_string(dir.join("artifact.json"))
            .await
            .map_err(|e| load_failure(artifact_ref, format!("failed to read artifact.json: {e}")))?;
        let manifest = ArtifactManifest::from_json(&manifest_json)
            .map_err(|e| load_failure(artifact_ref, format!("failed to parse artifact.json: {e}")))?;

        let entry_path = find_entry_point(&manifest.exports)?;
        debug!(
            artifact = artifact_ref,
            entry = %entry_path.join("."),
            "entry point resolved"
        );

        let entry = DylibEntryPoint::open(&dir.join(&manifest.entry), artifact_ref)?;
        Ok(entry as Arc<dyn EntryPoint>)
    }
}

/// A loaded artifact binary bound to its resolved entry point.
#[derive(Debug)]
pub struct DylibEntryPoint {
    /// The underlying loaded library. Must outlive the vtable pointer.
    _lib: Library,
    /// Vtable returned by `tiledd_artifact_init()`.
    vtable: *mut TiledArtifact,
    /// Display name (from the vtable, or the binary's file stem).
    name: String,
}

// SAFETY: the vtable pointer is valid for the lifetime of `_lib`, and the
// ABI requires `start` and the done callback to be callable from any
// thread.
unsafe impl Send for DylibEntryPoint {}
unsafe impl Sync for DylibEntryPoint {}

impl DylibEntryPoint {
    /// Load an artifact binary.
    ///
    /// Steps:
    /// 1. `dlopen` the binary.
    /// 2. Resolve the `tiledd_artifact_init` symbol.
    /// 3. Call it and null-check the vtable.
    /// 4. Verify the ABI version.
    /// 5. Require a `start` function.
    fn open(binary_path: &Path, artifact_ref: &str) -> Result<Arc<Self>, BuildError> {
        // SAFETY: loading artifact code is inherently unsafe. Artifacts
        // are installed by the local user into the configured artifacts
        // dir; the daemon never fetches them.
        let lib = unsafe { Library::new(binary_path) }.map_err(|e| {
            load_failure(
                artifact_ref,
                format!("failed to open {}: {e}", binary_path.display()),
            )
        })?;

        let vtable = {
            let init: Symbol<unsafe extern "C" fn() -> *mut TiledArtifact> =
                unsafe { lib.get(TILEDD_ARTIFACT_INIT_SYMBOL) }.map_err(|_| {
                    load_failure(
                        artifact_ref,
                        "artifact missing required `tiledd_artifact_init` export",
                    )
                })?;
            unsafe { init() }
        };
        if vtable.is_null() {
            return Err(load_failure(
                artifact_ref,
                "tiledd_artifact_init() returned null",
            ));
        }

        let vt = unsafe { &*vtable };
        if vt.abi_version != TILEDD_ARTIFACT_ABI_VERSION {
            return Err(load_failure(
                artifact_ref,
                format!(
                    "ABI version mismatch: expected {}, got {}",
                    TILEDD_ARTIFACT_ABI_VERSION, vt.abi_version
                ),
            ));
        }
        if vt.start.is_none() {
            return Err(load_failure(artifact_ref, "artifact vtable has no start"));
        }

        let name = if vt.name.is_null() {
            binary_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| artifact_ref.to_string())
        } else {
            unsafe { CStr::from_ptr(vt.name) }
                .to_string_lossy()
                .into_owned()
        };

        Ok(Arc::new(Self {
            _lib: lib,
            vtable,
            name,
        }))
    }
}

impl Drop for DylibEntryPoint {
    fn drop(&mut self) {
        let vt = unsafe { &*self.vtable };
        if let Some(on_unload) = vt.on_unload {
            unsafe { on_unload() }
        }
    }
}

/// Pending done-channel state shared with the artifact's callback.
///
/// Leaked for the process lifetime: the ABI cannot promise the artifact
/// never fires a late callback, and foreign code must never observe a
/// freed sender. The sender itself is taken on first use, so extra
/// invocations are inert.
struct DoneState {
    tx: Mutex<Option<mpsc::Sender<Value>>>,
}

unsafe extern "C" fn forward_done(result_json: *const c_char, user_data: *mut c_void) {
    if result_json.is_null() || user_data.is_null() {
        return;
    }
    let state = unsafe { &*(user_data as *const DoneState) };
    let Some(tx) = state.tx.lock().ok().and_then(|mut guard| guard.take()) else {
        return;
    };
    let raw = unsafe { CStr::from_ptr(result_json) }
        .to_string_lossy()
        .into_owned();
    let data = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
    // try_send never blocks, so the callback is safe on any thread —
    // including synchronously inside start().
    let _ = tx.try_send(data);
}

impl EntryPoint for DylibEntryPoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self, flags: RunFlags) -> Result<RunningBuild, BuildError> {
        let vt = unsafe { &*self.vtable };
        let Some(start) = vt.start else {
            return Err(BuildError::StartFailure("artifact vtable has no start".into()));
        };

        let flags_json = serde_json::to_string(&flags)
            .map_err(|e| BuildError::StartFailure(format!("failed to encode flags: {e}")))?;
        let flags_c = CString::new(flags_json)
            .map_err(|e| BuildError::StartFailure(format!("flags contain NUL: {e}")))?;

        let (tx, rx) = mpsc::channel(4);
        let state: &'static DoneState = Box::leak(Box::new(DoneState {
            tx: Mutex::new(Some(tx)),
        }));

        // SAFETY: flags_c outlives the call; state is 'static.
        let rc = unsafe {
            start(
                flags_c.as_ptr(),
                forward_done,
                state as *const DoneState as *mut c_void,
            )
        };
        if rc != TiledArtifactError::None {
            return Err(BuildError::StartFailure(format!(
                "artifact returned {rc:?}"
            )));
        }
        Ok(RunningBuild { done: rx })
    }
}

fn load_failure(reference: &str, reason: impl Into<String>) -> BuildError {
    BuildError::LoadFailure {
        reference: reference.to_string(),
        reason: reason.into(),
    }
}
