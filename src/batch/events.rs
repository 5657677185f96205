//! Batch event stream and its wire format.
//!
//! Each event is one independently parseable JSON object tagged by `type`.
//! On the wire an event is an SSE frame (`data: <json>\n\n`).

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, Stream};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::run::{BatchMode, BatchPhase, ScreeningRecord};
use crate::device::PortId;
use crate::error::ErrorKind;
use crate::workflow::PortResetOutcome;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEvent {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl BatchEvent {
    /// Render as one SSE frame.
    pub fn to_sse_frame(&self) -> String {
        sse_frame(self)
    }

    pub fn is_summary(&self) -> bool {
        matches!(self.kind, EventKind::Summary(_))
    }
}

/// Render any serializable value as `data: <json>\n\n`.
pub fn sse_frame<T: Serialize>(value: &T) -> String {
    match serde_json::to_string(value) {
        Ok(json) => format!("data: {}\n\n", json),
        Err(e) => {
            tracing::error!("Failed to serialize event: {}", e);
            format!(
                "data: {}\n\n",
                serde_json::json!({"type": "error", "message": "event serialization failed"})
            )
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Start {
        mode: BatchMode,
        devices: Vec<String>,
    },
    Phase {
        phase: BatchPhase,
    },
    Screened(ScreeningRecord),
    Connecting {
        location: String,
        ip: IpAddr,
        attempt: u32,
    },
    Authenticated {
        location: String,
    },
    PortLocated {
        location: String,
        port: PortId,
    },
    PortDisabled {
        location: String,
        port: PortId,
        at: DateTime<Utc>,
    },
    PortEnabled {
        location: String,
        port: PortId,
        at: DateTime<Utc>,
    },
    ProbeLine {
        location: String,
        line: String,
    },
    DeviceReset {
        location: String,
        port: PortId,
    },
    DeviceFailed {
        location: String,
        error: ErrorKind,
        message: String,
    },
    Verified {
        location: String,
        reachable: bool,
    },
    VerificationError {
        location: String,
        error: ErrorKind,
        message: String,
    },
    Summary(BatchSummary),
}

/// Terminal event payload. Always the last event of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub mode: BatchMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Devices that entered the reset phase, in submission order.
    pub reset_locations: Vec<String>,
    pub outcomes: BTreeMap<String, PortResetOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub screening: Vec<ScreeningRecord>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub verified_reachable: usize,
    pub verified_unreachable: usize,
    /// False only when devices were attempted and none succeeded.
    pub success: bool,
}

/// Producer side of a run's event stream.
///
/// Delivery is unbounded so a slow consumer never stalls device workers.
/// Sends after the consumer is gone are discarded.
#[derive(Debug, Clone)]
pub struct EventSink {
    run_id: Uuid,
    tx: Option<mpsc::UnboundedSender<BatchEvent>>,
}

impl EventSink {
    pub fn new(run_id: Uuid, tx: mpsc::UnboundedSender<BatchEvent>) -> Self {
        Self {
            run_id,
            tx: Some(tx),
        }
    }

    /// Sink that drops every event, for callers that only want outcomes.
    pub fn detached() -> Self {
        Self {
            run_id: Uuid::nil(),
            tx: None,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn emit(&self, kind: EventKind) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(BatchEvent {
                run_id: self.run_id,
                timestamp: Utc::now(),
                kind,
            });
        }
    }
}

/// Consumer side of a run's event stream.
///
/// Dropping the stream cancels the run: no new devices are dispatched, and
/// devices whose port is already down still get their enable.
pub struct EventStream {
    run_id: Uuid,
    cancel: CancellationToken,
    inner: BoxStream<'static, BatchEvent>,
}

impl EventStream {
    pub fn new(
        run_id: Uuid,
        mut rx: mpsc::UnboundedReceiver<BatchEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let guard = cancel.clone().drop_guard();
        let inner = async_stream::stream! {
            let _guard = guard;
            while let Some(event) = rx.recv().await {
                yield event;
            }
        }
        .boxed();

        Self {
            run_id,
            cancel,
            inner,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Request cancellation while continuing to drain remaining events.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("run_id", &self.run_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl Stream for EventStream {
    type Item = BatchEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// Incremental SSE decoder.
///
/// Accepts text split at arbitrary points and yields every well-formed
/// frame. A malformed frame is dropped and decoding resumes at the next
/// blank-line boundary.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: String,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<T: DeserializeOwned>(&mut self, chunk: &str) -> Vec<T> {
        self.buffer.push_str(&chunk.replace("\r\n", "\n"));
        let mut decoded = Vec::new();

        while let Some(end) = self.buffer.find("\n\n") {
            let frame: String = self.buffer.drain(..end + 2).collect();
            match Self::decode_frame(&frame) {
                Some(value) => decoded.push(value),
                None => tracing::debug!("Discarding malformed frame: {:?}", frame.trim()),
            }
        }

        decoded
    }

    /// Bytes held back waiting for a frame boundary.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn decode_frame<T: DeserializeOwned>(frame: &str) -> Option<T> {
        let data: Vec<&str> = frame
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
            .collect();
        if data.is_empty() {
            return None;
        }
        serde_json::from_str(&data.join("\n")).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn event(kind: EventKind) -> BatchEvent {
        BatchEvent {
            run_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
        }
    }

    #[test]
    fn events_are_tagged_by_type() {
        let ev = event(EventKind::PortLocated {
            location: "Lobby-3".to_string(),
            port: PortId::ge(7),
        });
        let json: Value = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "port_located");
        assert_eq!(json["location"], "Lobby-3");
        assert_eq!(json["port"], "ge-0/0/7");
        assert!(json["run_id"].is_string());
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn sse_frame_format() {
        let ev = event(EventKind::Phase {
            phase: BatchPhase::Verifying,
        });
        let frame = ev.to_sse_frame();
        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("}\n\n"));
        assert!(frame.contains("\"phase\":\"verifying\""));
    }

    #[test]
    fn decoder_handles_split_chunks() {
        let a = event(EventKind::Authenticated {
            location: "Lobby-3".to_string(),
        });
        let b = event(EventKind::Verified {
            location: "Lobby-3".to_string(),
            reachable: true,
        });
        let wire = format!("{}{}", a.to_sse_frame(), b.to_sse_frame());

        let mut decoder = FrameDecoder::new();
        let mut out: Vec<BatchEvent> = Vec::new();
        for chunk in wire.as_bytes().chunks(7) {
            out.extend(decoder.push::<BatchEvent>(std::str::from_utf8(chunk).unwrap()));
        }
        assert_eq!(out, vec![a, b]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn decoder_resynchronizes_after_garbage() {
        let good = event(EventKind::Authenticated {
            location: "Room 101".to_string(),
        });
        let wire = format!(
            "data: {{\"type\": \"authen\n\ngarbage without prefix\n\n{}",
            good.to_sse_frame()
        );
        let mut decoder = FrameDecoder::new();
        let out: Vec<BatchEvent> = decoder.push(&wire);
        assert_eq!(out, vec![good]);
    }

    #[test]
    fn decoder_accepts_crlf() {
        let mut decoder = FrameDecoder::new();
        let out: Vec<Value> = decoder.push("data: {\"type\":\"start\"}\r\n\r\n");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["type"], "start");
    }

    #[test]
    fn detached_sink_discards() {
        let sink = EventSink::detached();
        sink.emit(EventKind::Authenticated {
            location: "x".to_string(),
        });
        assert!(sink.run_id().is_nil());
    }

    #[tokio::test]
    async fn dropping_stream_cancels_run() {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let stream = EventStream::new(Uuid::new_v4(), rx, token.clone());
        let sink = EventSink::new(stream.run_id(), tx);

        assert!(!token.is_cancelled());
        drop(stream);
        assert!(token.is_cancelled());
        // Emitting after the consumer left is harmless
        sink.emit(EventKind::Phase {
            phase: BatchPhase::Done,
        });
    }

    #[tokio::test]
    async fn stream_ends_when_all_sinks_drop() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut stream = EventStream::new(Uuid::new_v4(), rx, CancellationToken::new());
        let sink = EventSink::new(stream.run_id(), tx);
        sink.emit(EventKind::Phase {
            phase: BatchPhase::Resetting,
        });
        drop(sink);

        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
    }
}
