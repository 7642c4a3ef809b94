//! Run event system for observability.
//!
//! Emits [`PipelineEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! external observers (loggers, debuggers, UIs) can follow a run without
//! coupling to the engine internals.

use serde::{Deserialize, Serialize};

/// Events emitted during graph execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    RunStarted {
        run_id: String,
        entry_node: String,
        node_count: usize,
    },
    StepStarted {
        node_id: String,
        component_type: String,
    },
    StepRetrying {
        node_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    StepCompleted {
        node_id: String,
        action: String,
        attempts: u32,
        duration_ms: u64,
    },
    StepFailed {
        node_id: String,
        error: String,
    },
    TransitionTaken {
        from_node: String,
        action: String,
        to_node: String,
    },
    BatchProgress {
        node_id: String,
        completed: usize,
        failed: usize,
        total: usize,
    },
    RunCompleted {
        run_id: String,
        path: Vec<String>,
        duration_ms: u64,
    },
    RunHalted {
        run_id: String,
        node_id: String,
        action: String,
    },
    RunFailed {
        run_id: String,
        error: String,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_sends_and_receives() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();

        emitter.emit(PipelineEvent::RunStarted {
            run_id: "r1".into(),
            entry_node: "fetch".into(),
            node_count: 3,
        });

        match rx.recv().await.unwrap() {
            PipelineEvent::RunStarted {
                entry_node,
                node_count,
                ..
            } => {
                assert_eq!(entry_node, "fetch");
                assert_eq!(node_count, 3);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let emitter = EventEmitter::new(16);
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();

        emitter.emit(PipelineEvent::TransitionTaken {
            from_node: "a".into(),
            action: "default".into(),
            to_node: "b".into(),
        });

        let json1 = serde_json::to_string(&rx1.recv().await.unwrap()).unwrap();
        let json2 = serde_json::to_string(&rx2.recv().await.unwrap()).unwrap();
        assert_eq!(json1, json2);
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let emitter = EventEmitter::new(16);
        emitter.emit(PipelineEvent::RunFailed {
            run_id: "r".into(),
            error: "something went wrong".into(),
        });
    }

    #[test]
    fn event_serialization_round_trip() {
        let event = PipelineEvent::StepCompleted {
            node_id: "node_42".into(),
            action: "default".into(),
            attempts: 2,
            duration_ms: 123,
        };
        let json = serde_json::to_string(&event).unwrap();
        match serde_json::from_str::<PipelineEvent>(&json).unwrap() {
            PipelineEvent::StepCompleted {
                node_id, attempts, ..
            } => {
                assert_eq!(node_id, "node_42");
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected variant after round-trip: {other:?}"),
        }
    }
}
