//! Artifact loading seams and entry-point resolution.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use super::BuildError;

/// Maximum namespace depth searched for a runnable entry point. Export
/// shapes are not statically known, so the walk gives up past this depth
/// instead of chasing a pathological tree.
pub const EXPORT_SEARCH_DEPTH: usize = 5;

/// Flags handed to an entry point for a single run.
#[derive(Debug, Clone, Serialize)]
pub struct RunFlags {
    pub level: Value,
}

/// A started build run. `done` carries the instance's output; the worker
/// forwards only the first value.
pub struct RunningBuild {
    pub done: mpsc::Receiver<Value>,
}

/// A resolved, runnable entry point, cached per artifact reference for the
/// worker's lifetime.
pub trait EntryPoint: Send + Sync + std::fmt::Debug {
    /// Artifact display name for logs.
    fn name(&self) -> &str;

    /// Start one run with the given flags.
    fn start(&self, flags: RunFlags) -> Result<RunningBuild, BuildError>;
}

/// Loads artifacts by reference. The worker calls this at most once per
/// distinct reference.
#[async_trait]
pub trait ArtifactLoader: Send + Sync {
    async fn load(&self, artifact_ref: &str) -> Result<Arc<dyn EntryPoint>, BuildError>;
}

/// Locate the first runnable entry point in an export namespace.
///
/// Descends into the first child of each namespace; a namespace exposing
/// an `init` key terminates the search. Siblings past the first child are
/// never visited. Returns the key path to the entry namespace, or
/// [`BuildError::EntryPointNotFound`] once the walk has passed
/// [`EXPORT_SEARCH_DEPTH`] levels without a hit.
pub fn find_entry_point(exports: &Value) -> Result<Vec<String>, BuildError> {
    let mut node = exports;
    let mut path = Vec::new();
    for _ in 0..EXPORT_SEARCH_DEPTH {
        let Some((key, child)) = node.as_object().and_then(|obj| obj.iter().next()) else {
            break;
        };
        path.push(key.clone());
        if child.get("init").is_some() {
            return Ok(path);
        }
        node = child;
    }
    Err(BuildError::EntryPointNotFound {
        depth: EXPORT_SEARCH_DEPTH,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Build an export tree with `init` nested `levels` namespaces deep.
    fn nested(levels: usize) -> Value {
        let mut node = json!({ "init": true });
        for i in (0..levels).rev() {
            let mut map = serde_json::Map::new();
            map.insert(format!("NS{i}"), node);
            node = Value::Object(map);
        }
        node
    }

    #[test]
    fn finds_entry_at_the_first_level() {
        let path = find_entry_point(&nested(1)).unwrap();
        assert_eq!(path, vec!["NS0"]);
    }

    #[test]
    fn finds_entry_at_the_depth_bound() {
        let path = find_entry_point(&nested(EXPORT_SEARCH_DEPTH)).unwrap();
        assert_eq!(path.len(), EXPORT_SEARCH_DEPTH);
    }

    #[test]
    fn gives_up_one_level_past_the_bound() {
        let err = find_entry_point(&nested(EXPORT_SEARCH_DEPTH + 1)).unwrap_err();
        assert!(matches!(err, BuildError::EntryPointNotFound { depth } if depth == EXPORT_SEARCH_DEPTH));
    }

    #[test]
    fn only_the_first_sibling_is_walked() {
        // init lives in the second sibling — the walk never sees it.
        let exports = json!({
            "Dead": { "end": {} },
            "Alive": { "init": true }
        });
        let err = find_entry_point(&exports).unwrap_err();
        assert!(matches!(err, BuildError::EntryPointNotFound { .. }));
    }

    #[test]
    fn empty_and_scalar_namespaces_give_not_found() {
        assert!(find_entry_point(&json!({})).is_err());
        assert!(find_entry_point(&json!({ "Root": 3 })).is_err());
    }
}
