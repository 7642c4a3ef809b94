//! Append-only execution trace consumed by external debug tooling.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{Params, Result};

/// One executed step (one item, for batch nodes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub node_id: String,
    #[serde(rename = "type")]
    pub component_type: String,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub end_time: chrono::DateTime<chrono::Utc>,
    pub duration_ms: u64,
    pub resolved_params: Params,
    pub emitted_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_index: Option<usize>,
}

/// The ordered trace of a whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub run_id: uuid::Uuid,
    pub records: Vec<TraceRecord>,
}

impl Trace {
    /// Serialize this trace to JSON and write it to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Read a trace from a JSON file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let trace: Self = serde_json::from_str(&data)?;
        Ok(trace)
    }

    /// Records for one node, in execution order.
    pub fn for_node<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a TraceRecord> {
        self.records.iter().filter(move |r| r.node_id == node_id)
    }
}

/// Shared append-only sink for trace records.
///
/// Cloning yields another handle to the **same** record list, so batch
/// workers running on separate tasks append to one trace.
#[derive(Clone, Default)]
pub struct TraceRecorder {
    records: Arc<tokio::sync::Mutex<Vec<TraceRecord>>>,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, record: TraceRecord) {
        self.records.lock().await.push(record);
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// Copy of the records so far, in append order.
    pub async fn snapshot(&self) -> Vec<TraceRecord> {
        self.records.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(node: &str, action: &str) -> TraceRecord {
        let now = chrono::Utc::now();
        TraceRecord {
            node_id: node.into(),
            component_type: "echo".into(),
            start_time: now,
            end_time: now,
            duration_ms: 0,
            resolved_params: Params::new(),
            emitted_action: Some(action.into()),
            error: None,
            attempts: 1,
            batch_index: None,
        }
    }

    #[tokio::test]
    async fn recorder_clones_share_records() {
        let recorder = TraceRecorder::new();
        let other = recorder.clone();
        recorder.record(record("a", "default")).await;
        other.record(record("b", "default")).await;

        let records = recorder.snapshot().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].node_id, "a");
        assert_eq!(records[1].node_id, "b");
    }

    #[test]
    fn record_serializes_type_field_and_skips_empty_optionals() {
        let json = serde_json::to_value(record("a", "default")).unwrap();
        assert_eq!(json["type"], "echo");
        assert!(json.get("error").is_none());
        assert!(json.get("batch_index").is_none());
    }

    #[test]
    fn trace_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.json");
        let trace = Trace {
            run_id: uuid::Uuid::new_v4(),
            records: vec![record("a", "default"), record("b", "error")],
        };

        trace.save(&path).unwrap();
        let loaded = Trace::load(&path).unwrap();

        assert_eq!(loaded.run_id, trace.run_id);
        assert_eq!(loaded.records, trace.records);
        assert_eq!(loaded.for_node("b").count(), 1);
    }
}
