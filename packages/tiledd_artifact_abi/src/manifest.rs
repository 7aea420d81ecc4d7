// SPDX-License-Identifier: MIT
//! Artifact manifest format — `artifact.json`.
//!
//! Every build artifact directory must include an `artifact.json` manifest
//! next to the binary. The daemon reads this before loading the artifact
//! and walks the `exports` tree to locate the runnable entry point.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Contents of an `artifact.json` manifest file.
///
/// # Example
///
/// ```json
/// {
///   "name": "top-down-adventure",
///   "version": "1.0.0",
///   "entry": "libtop_down_adventure.so",
///   "exports": { "Game": { "Main": { "init": true } } }
/// }
/// ```
///
/// `exports` mirrors the artifact's module namespace. The daemon descends
/// into the first child of each namespace until it finds one exposing an
/// `init` capability; the search depth is bounded, so deeply nested
/// namespaces must surface their entry point near the root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactManifest {
    /// Artifact display name (e.g. `"top-down-adventure"`).
    pub name: String,

    /// Semver version string (e.g. `"1.0.0"`).
    pub version: String,

    /// Artifact description shown in logs.
    #[serde(default)]
    pub description: String,

    /// Relative path to the artifact binary inside the directory.
    pub entry: String,

    /// Nested export namespace. Leaf namespaces carrying an `"init"` key
    /// mark a runnable entry point.
    pub exports: Value,
}

impl ArtifactManifest {
    /// Parse a manifest from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize the manifest to a pretty-printed JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
