//! Session error types.

use serde_json::{Value, json};

use crate::transport::{HttpResponse, TransportError};

/// Errors returned by the session API itself.
///
/// Upload failures are not errors of the API: they are reported through
/// [`UploadEvent::Fail`](crate::UploadEvent::Fail).
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("transfer error: {0}")]
    Transfer(#[from] blockput_transfer::TransferError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("no tokio runtime available")]
    NoRuntime,

    #[error("session closed")]
    SessionClosed,
}

/// Kind of fatal upload failure, with its stable numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// A chunk byte range could not be read.
    Read,
    /// A block upload was rejected or ran out of retries.
    ChunkUpload,
    /// The finalize request failed.
    Merge,
    /// The whole-file upload was rejected or ran out of retries.
    DirectUpload,
}

impl ErrorCode {
    pub fn code(self) -> u32 {
        match self {
            ErrorCode::Read => 10001,
            ErrorCode::ChunkUpload => 20002,
            ErrorCode::Merge => 20003,
            ErrorCode::DirectUpload => 20004,
        }
    }
}

/// Raw diagnostics attached to a failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureInfo {
    /// Status of the last response, when one was received.
    pub status: Option<u16>,
    /// Body of the last response, lossily decoded.
    pub body: Option<String>,
    /// Collaborator error message, when no response was received.
    pub error: Option<String>,
}

impl FailureInfo {
    pub fn response(response: &HttpResponse) -> Self {
        Self {
            status: Some(response.status),
            body: Some(response.text()),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

/// Payload of a `fail` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFailure {
    pub code: ErrorCode,
    pub message: String,
    pub info: FailureInfo,
}

impl UploadFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>, info: FailureInfo) -> Self {
        Self {
            code,
            message: message.into(),
            info,
        }
    }

    /// `{ errCode, errMsg, errInfo }` view of the failure.
    pub fn to_json(&self) -> Value {
        json!({
            "errCode": self.code.code(),
            "errMsg": self.message,
            "errInfo": {
                "statusCode": self.info.status,
                "data": self.info.body,
                "error": self.info.error,
            },
        })
    }
}

/// Outcome of a request sent through the retry policy.
#[derive(Debug)]
pub enum RequestError {
    /// Cancelled by pause/cancel; never a failure.
    Aborted,
    /// Status in the failure set.
    Rejected(HttpResponse),
    /// Ambiguous status with no retries left.
    Exhausted(HttpResponse),
    /// The transport failed without a response.
    Transport(TransportError),
}

impl RequestError {
    /// Converts into a failure payload of kind `code`.
    pub fn into_failure(self, code: ErrorCode) -> UploadFailure {
        match self {
            RequestError::Aborted => {
                UploadFailure::new(code, "request aborted", FailureInfo::error("aborted"))
            }
            RequestError::Rejected(response) => UploadFailure::new(
                code,
                format!("request rejected with status {}", response.status),
                FailureInfo::response(&response),
            ),
            RequestError::Exhausted(response) => UploadFailure::new(
                code,
                format!("retries exhausted, last status {}", response.status),
                FailureInfo::response(&response),
            ),
            RequestError::Transport(e) => {
                UploadFailure::new(code, e.to_string(), FailureInfo::error(e.to_string()))
            }
        }
    }
}
