/// Per-run scratch state
///
/// A node may park a JSON value between its own invocations within one run
/// (e.g. a batch cursor). State is keyed by (execution id, node id) and lives
/// until the run is cleared.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct NodeStateStore {
    states: Mutex<HashMap<(String, String), Value>>,
}

impl NodeStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state, `{}` when nothing was stored
    pub fn get(&self, execution_id: &str, node_id: &str) -> Value {
        self.lock()
            .get(&(execution_id.to_string(), node_id.to_string()))
            .cloned()
            .unwrap_or_else(|| json!({}))
    }

    pub fn set(&self, execution_id: &str, node_id: &str, state: Value) {
        self.lock()
            .insert((execution_id.to_string(), node_id.to_string()), state);
    }

    /// Forget one node's state
    pub fn remove(&self, execution_id: &str, node_id: &str) {
        self.lock()
            .remove(&(execution_id.to_string(), node_id.to_string()));
    }

    /// Drop every node's state for a finished run; returns how many were removed
    pub fn clear_execution(&self, execution_id: &str) -> usize {
        let mut states = self.lock();
        let before = states.len();
        states.retain(|(execution, _), _| execution != execution_id);
        let removed = before - states.len();
        if removed > 0 {
            tracing::debug!("🧹 Cleared {} node state(s) for execution {}", removed, execution_id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), Value>> {
        self.states.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
