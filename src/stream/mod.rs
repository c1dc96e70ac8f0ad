//! Event stream (spec §4.9, §6.1): the tagged `Event` enum emitted during a
//! request, a channel-based writer with backpressure handling, and the SSE
//! encoder (the only place events are serialized to wire format).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::decision::Action;
use crate::pcn::DagDelta;
use crate::types::{PcnId, RequestId};

/// Token/time counters for one request (spec §6.3 `usage`). No per-token
/// LLM accounting exists in this engine, so usage is expressed in terms of
/// the quantities the engine itself actually meters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub tool_calls: u32,
    pub refinements: u32,
}

/// One iteration's trace summary (spec §6.1 `trace`, §6.3 `AgentResult.trace`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSummary {
    pub step: u32,
    pub is_refinement: bool,
    pub issues: Vec<String>,
    pub tools_used: Vec<String>,
    pub prompt_preview: Option<String>,
}

/// The full terminal payload of a request (spec §6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub request_id: RequestId,
    pub answer: String,
    pub action: Action,
    pub s1: f32,
    pub s2: f32,
    pub final_score: f32,
    pub cp_accept: Option<bool>,
    pub cp_tau: Option<f32>,
    pub issues: Vec<String>,
    pub tools_used: Vec<String>,
    pub pack_ids: Vec<String>,
    pub trace: Vec<TraceSummary>,
    pub latency_ms: u64,
    pub usage: Usage,
}

/// Every event kind a request's stream can emit (spec §6.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Ready { request_id: RequestId },
    Token { text: String },
    Score { s1: f32, s2: f32, final_score: f32, cp_accept: Option<bool>, cp_tau: Option<f32> },
    Tool { name: String, status: String, detail: Option<String> },
    Pcn { id: PcnId, status: String, value: Option<String> },
    Gov { dag_delta: DagDelta },
    Trace(TraceSummary),
    Heartbeat,
    Final(Box<AgentResult>),
    Error { code: String, message: String },
}

/// Default idle period before a heartbeat is emitted to keep intermediaries
/// (proxies, browsers) from closing the connection.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Bounded channel writer. On overflow, drops the oldest `Heartbeat` first —
/// heartbeats exist purely to keep the connection alive and are safe to
/// lose; every other event kind is load-bearing for the client.
pub struct EventWriter {
    tx: mpsc::Sender<Event>,
}

impl EventWriter {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Wrap an externally-owned sender, e.g. one already handed to an SSE
    /// response body.
    pub fn from_sender(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, event: Event) {
        if matches!(event, Event::Heartbeat) {
            // Heartbeats use try_send: if the channel is full, skip this one
            // rather than blocking the request on a slow consumer.
            let _ = self.tx.try_send(event);
            return;
        }
        if self.tx.send(event).await.is_err() {
            tracing::debug!("event receiver dropped, discarding event");
        }
    }
}

/// Encode one event as an SSE frame (`event: <kind>\ndata: <json>\n\n`).
/// This is the only serialization boundary for the stream — callers never
/// hand-format SSE elsewhere.
pub fn encode_sse(event: &Event) -> String {
    let kind = match event {
        Event::Ready { .. } => "ready",
        Event::Token { .. } => "token",
        Event::Score { .. } => "score",
        Event::Tool { .. } => "tool",
        Event::Pcn { .. } => "pcn",
        Event::Gov { .. } => "gov",
        Event::Trace(_) => "trace",
        Event::Heartbeat => "heartbeat",
        Event::Final(_) => "final",
        Event::Error { .. } => "error",
    };
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    format!("event: {kind}\ndata: {data}\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_sse_includes_event_name_and_json_body() {
        let frame = encode_sse(&Event::Ready { request_id: RequestId::new() });
        assert!(frame.starts_with("event: ready\n"));
        assert!(frame.contains("\"request_id\""));
        assert!(frame.ends_with("\n\n"));
    }

    #[tokio::test]
    async fn heartbeat_is_dropped_not_blocked_when_channel_full() {
        let (writer, mut rx) = EventWriter::new(1);
        writer.send(Event::Token { text: "a".into() }).await;
        // Channel now full (capacity 1, one unread message); heartbeat must
        // not block indefinitely.
        writer.send(Event::Heartbeat).await;
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, Event::Token { .. }));
    }

    fn sample_result() -> AgentResult {
        AgentResult {
            request_id: RequestId::new(),
            answer: "done".into(),
            action: Action::Accept,
            s1: 0.9,
            s2: 0.9,
            final_score: 0.9,
            cp_accept: Some(true),
            cp_tau: Some(0.7),
            issues: Vec::new(),
            tools_used: Vec::new(),
            pack_ids: vec!["c1".into()],
            trace: Vec::new(),
            latency_ms: 12,
            usage: Usage::default(),
        }
    }

    #[tokio::test]
    async fn final_event_carries_pack_ids() {
        let (writer, mut rx) = EventWriter::new(4);
        writer.send(Event::Final(Box::new(sample_result()))).await;
        let event = rx.recv().await.unwrap();
        match event {
            Event::Final(result) => {
                assert_eq!(result.answer, "done");
                assert_eq!(result.pack_ids, vec!["c1".to_string()]);
            }
            _ => panic!("wrong event"),
        }
    }

    #[test]
    fn gov_event_serializes_dag_delta() {
        let event = Event::Gov { dag_delta: DagDelta { ok: false, failing: vec!["x".into()] } };
        let frame = encode_sse(&event);
        assert!(frame.contains("\"dag_delta\""));
        assert!(frame.contains("\"failing\":[\"x\"]"));
    }
}
