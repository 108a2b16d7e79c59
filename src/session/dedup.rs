use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::chain::Alert;

/// Deterministic fingerprint of an alert: SHA-256 over the alert type and
/// the canonical JSON of its payload.
///
/// Object keys are sorted before hashing, so key order in the submitted
/// payload does not change the fingerprint.
pub fn alert_fingerprint(alert: &Alert) -> String {
    let mut hasher = Sha256::new();
    hasher.update(alert.alert_type.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical(&alert.data).to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            Value::Object(
                keys.into_iter()
                    .map(|k| (k.clone(), canonical(&map[k])))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

/// In-flight alert registry.
///
/// Owned by the service; an alert stays registered from submission until its
/// session reaches a terminal status. A paused session keeps its alert.
#[derive(Debug, Clone, Default)]
pub struct AlertDeduplicator {
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl AlertDeduplicator {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `fingerprint`, atomically. Returns `false` if it is already
    /// in flight.
    pub async fn try_register(&self, fingerprint: &str) -> bool {
        self.in_flight.lock().await.insert(fingerprint.to_string())
    }

    /// Release `fingerprint` so the same alert can be submitted again
    pub async fn release(&self, fingerprint: &str) {
        self.in_flight.lock().await.remove(fingerprint);
    }

    /// Whether `fingerprint` is in flight
    pub async fn contains(&self, fingerprint: &str) -> bool {
        self.in_flight.lock().await.contains(fingerprint)
    }
}
