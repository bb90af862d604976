use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use podwatch_alert::AlertEvaluator;
use podwatch_common::types::NodeSnapshot;
use podwatch_store::AlertStore;

use crate::registry::AgentRegistry;

/// Shared server state handed to the gRPC ingress and the HTTP API.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<AgentRegistry>,
    pub store: Arc<dyn AlertStore>,
    pub evaluator: Arc<AlertEvaluator>,
    /// Most recent snapshot per node, for the control plane. No history is
    /// kept.
    pub latest: Arc<Mutex<HashMap<String, NodeSnapshot>>>,
}

impl AppState {
    pub fn new(
        registry: Arc<AgentRegistry>,
        store: Arc<dyn AlertStore>,
        evaluator: Arc<AlertEvaluator>,
    ) -> Self {
        Self {
            registry,
            store,
            evaluator,
            latest: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn record_snapshot(&self, snapshot: NodeSnapshot) {
        self.latest
            .lock()
            .unwrap()
            .insert(snapshot.node_name.clone(), snapshot);
    }

    pub fn latest_snapshot(&self, node_name: &str) -> Option<NodeSnapshot> {
        self.latest.lock().unwrap().get(node_name).cloned()
    }
}
