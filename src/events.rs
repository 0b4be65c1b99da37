//! Event Emitter / Progress Channel
//!
//! Streams per-stage status to an external observer as JSON envelopes
//! `{type, data, timestamp}`, one per line on the transport side. Emission
//! must survive a departed observer: once the receiving end is gone every
//! emit is a silent no-op, and duplicate terminal sends are suppressed so a
//! run produces exactly one `complete` or `error` envelope.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// The pipeline stages an observer sees, by their wire names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Schema,
    Subproblem,
    Queryplan,
    Sql,
    Execute,
    Correction,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Schema => "schema",
            Stage::Subproblem => "subproblem",
            Stage::Queryplan => "queryplan",
            Stage::Sql => "sql",
            Stage::Execute => "execute",
            Stage::Correction => "correction",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl PipelineEvent {
    fn new(event_type: &str, data: Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// One line of the wire format.
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","data":{"error":"event serialization failed"}}"#.to_string()
        })
    }
}

#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<PipelineEvent>,
    terminal_sent: Arc<AtomicBool>,
}

impl EventEmitter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                terminal_sent: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    fn send(&self, event: PipelineEvent) {
        // A closed receiver means the observer went away; the run keeps going
        // and its remaining events are discarded.
        if self.tx.send(event).is_err() {
            debug!("Event dropped: observer channel closed");
        }
    }

    pub fn agent_start(&self, stage: Stage) {
        self.send(PipelineEvent::new(
            "agent_start",
            json!({"agent": stage.as_str()}),
        ));
    }

    pub fn agent_complete(&self, stage: Stage, output: &str) {
        self.send(PipelineEvent::new(
            "agent_complete",
            json!({"agent": stage.as_str(), "output": output}),
        ));
    }

    pub fn agent_error(&self, stage: Stage, error: &str) {
        self.send(PipelineEvent::new(
            "agent_error",
            json!({"agent": stage.as_str(), "error": error}),
        ));
    }

    /// Revise a stage's displayed output after the fact (the SQL view after a
    /// correction replaces the query).
    pub fn agent_update(&self, stage: Stage, output: &str) {
        self.send(PipelineEvent::new(
            "agent_update",
            json!({"agent": stage.as_str(), "output": output}),
        ));
    }

    /// Terminal success/failure envelope. Exactly one terminal event leaves
    /// the emitter; later attempts are dropped.
    pub fn complete(&self, success: bool, sql: &str, results: Value, attempts: u8) {
        if self.terminal_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        self.send(PipelineEvent::new(
            "complete",
            json!({
                "success": success,
                "sql": sql,
                "results": results,
                "attempts": attempts,
            }),
        ));
    }

    /// Terminal fatal-error envelope, mutually exclusive with `complete`.
    pub fn error(&self, error: &str) {
        if self.terminal_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        self.send(PipelineEvent::new("error", json!({"error": error})));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<PipelineEvent>) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_emission_order_preserved() {
        let (emitter, mut rx) = EventEmitter::new();
        emitter.agent_start(Stage::Schema);
        emitter.agent_complete(Stage::Schema, "2 tables linked");
        emitter.agent_start(Stage::Execute);
        emitter.agent_error(Stage::Execute, "no such table: x");

        let events = drain(&mut rx);
        let kinds: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            kinds,
            vec!["agent_start", "agent_complete", "agent_start", "agent_error"]
        );
        assert_eq!(events[0].data["agent"], "schema");
        assert_eq!(events[3].data["error"], "no such table: x");
    }

    #[test]
    fn test_exactly_one_terminal_event() {
        let (emitter, mut rx) = EventEmitter::new();
        emitter.complete(true, "SELECT 1", serde_json::Value::Null, 1);
        emitter.complete(true, "SELECT 1", serde_json::Value::Null, 1);
        emitter.error("late fatal");

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "complete");
        assert_eq!(events[0].data["attempts"], 1);
    }

    #[test]
    fn test_error_blocks_later_complete() {
        let (emitter, mut rx) = EventEmitter::new();
        emitter.error("fatal");
        emitter.complete(false, "", serde_json::Value::Null, 3);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "error");
    }

    #[test]
    fn test_emit_after_receiver_dropped_is_noop() {
        let (emitter, rx) = EventEmitter::new();
        drop(rx);
        // Nothing to assert beyond "does not panic".
        emitter.agent_start(Stage::Sql);
        emitter.complete(true, "SELECT 1", serde_json::Value::Null, 1);
        emitter.error("ignored");
    }

    #[test]
    fn test_json_line_shape() {
        let (emitter, mut rx) = EventEmitter::new();
        emitter.agent_start(Stage::Queryplan);
        let events = drain(&mut rx);
        let line = events[0].to_json_line();
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["type"], "agent_start");
        assert_eq!(parsed["data"]["agent"], "queryplan");
        assert!(parsed["timestamp"].is_string());
    }
}
