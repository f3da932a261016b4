use blockput_transfer::{ChunkPlan, ProgressInfo};
use serde_json::{Map, Value};

use crate::error::UploadFailure;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Uploading,
    Paused,
    Failed,
    Succeeded,
}

impl SessionState {
    /// `true` for `Failed` and `Succeeded`.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Succeeded)
    }
}

/// Payload of a `retry` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryInfo {
    /// Ambiguous status that triggered the retry.
    pub status_code: u16,
    pub url: String,
}

/// Payload of a `success` event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadOutcome {
    /// Top-level fields of the server's final JSON response.
    pub server_fields: Map<String, Value>,
}

impl UploadOutcome {
    /// Parses a final response body. Non-object bodies yield no fields.
    pub fn from_body(body: &[u8]) -> Self {
        let server_fields = match serde_json::from_slice(body) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        Self { server_fields }
    }

    /// Server fields plus `errCode: 0`.
    pub fn to_json(&self) -> Value {
        let mut map = self.server_fields.clone();
        map.insert("errCode".into(), Value::from(0));
        Value::Object(map)
    }
}

/// Terminal result of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Success(UploadOutcome),
    Fail(UploadFailure),
}

impl Completion {
    pub fn is_success(&self) -> bool {
        matches!(self, Completion::Success(_))
    }

    pub fn to_json(&self) -> Value {
        match self {
            Completion::Success(outcome) => outcome.to_json(),
            Completion::Fail(failure) => failure.to_json(),
        }
    }
}

/// Events emitted by a session, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Progress(ProgressInfo),
    Retry(RetryInfo),
    Success(UploadOutcome),
    Fail(UploadFailure),
    /// Follows `Success` or `Fail` with the same payload.
    Complete(Completion),
}

/// Point-in-time view of a session's bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub plan: ChunkPlan,
    /// Chunks not yet read, in read order.
    pub need_read: Vec<usize>,
    /// Chunks without a receipt, ascending.
    pub need_send: Vec<usize>,
    /// Loaded chunks waiting for a worker, in queue order.
    pub queued: Vec<usize>,
    /// Chunks with a block upload in flight, ascending.
    pub in_flight: Vec<usize>,
    pub reads_in_flight: usize,
    /// Chunks accounted as sent in this attempt.
    pub sent: usize,
    pub progress: ProgressInfo,
}
