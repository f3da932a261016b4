//! HTTP transport trait and its reqwest implementation.
//!
//! The session never talks to the network directly: every request goes
//! through a [`Transport`], which keeps the scheduling logic testable with
//! scripted mocks.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::UploadError;

/// A request with an in-memory body.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub timeout: Duration,
}

/// A multipart form post carrying a whole file.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub url: String,
    pub file_path: PathBuf,
    /// Form field holding the file content.
    pub file_field: String,
    /// Plain text form fields.
    pub form: Vec<(String, String)>,
    pub timeout: Duration,
}

/// Status and raw body of a completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Body decoded as UTF-8, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Transport-level failures. Status codes are never errors here.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The request was cancelled through its token.
    #[error("request aborted")]
    Aborted,

    #[error("request timed out")]
    Timeout,

    #[error("request failed: {0}")]
    Failed(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Failed(e.to_string())
        }
    }
}

type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<HttpResponse, TransportError>> + Send + 'a>>;

/// Sends upload requests.
///
/// Implementations must resolve with [`TransportError::Aborted`] once
/// `cancel` fires, so paused work is never mistaken for a failure.
pub trait Transport: Send + Sync {
    /// POSTs `request` and returns whatever status the server answered.
    fn request<'a>(
        &'a self,
        request: &'a HttpRequest,
        cancel: CancellationToken,
    ) -> TransportFuture<'a>;

    /// Sends a whole file as a multipart form.
    fn upload_file<'a>(
        &'a self,
        upload: &'a FileUpload,
        cancel: CancellationToken,
    ) -> TransportFuture<'a>;
}

// ---------------------------------------------------------------------------
// ReqwestTransport
// ---------------------------------------------------------------------------

/// [`Transport`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, UploadError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("blockput/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http })
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

/// Opens `path` as a streamed multipart part. Returns the part and the file
/// length; the content is read as the request body is sent.
async fn file_part(path: &Path) -> Result<(Part, u64), TransportError> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| TransportError::Failed(format!("open {}: {e}", path.display())))?;
    let len = file
        .metadata()
        .await
        .map_err(|e| TransportError::Failed(format!("stat {}: {e}", path.display())))?
        .len();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".into());

    let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
    Ok((Part::stream_with_length(body, len).file_name(file_name), len))
}

async fn into_response(resp: reqwest::Response) -> Result<HttpResponse, TransportError> {
    let status = resp.status().as_u16();
    let body = resp.bytes().await?.to_vec();
    Ok(HttpResponse { status, body })
}

impl Transport for ReqwestTransport {
    fn request<'a>(
        &'a self,
        request: &'a HttpRequest,
        cancel: CancellationToken,
    ) -> TransportFuture<'a> {
        Box::pin(async move {
            let mut builder = self
                .http
                .post(&request.url)
                .timeout(request.timeout)
                .body(request.body.clone());
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }

            trace!(url = %request.url, bytes = request.body.len(), "POST");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TransportError::Aborted),
                result = async { into_response(builder.send().await?).await } => result,
            }
        })
    }

    fn upload_file<'a>(
        &'a self,
        upload: &'a FileUpload,
        cancel: CancellationToken,
    ) -> TransportFuture<'a> {
        Box::pin(async move {
            let send = async {
                let (part, len) = file_part(&upload.file_path).await?;

                let mut form = Form::new();
                for (name, value) in &upload.form {
                    form = form.text(name.clone(), value.clone());
                }
                form = form.part(upload.file_field.clone(), part);

                trace!(
                    url = %upload.url,
                    path = %upload.file_path.display(),
                    bytes = len,
                    "multipart POST"
                );
                let resp = self
                    .http
                    .post(&upload.url)
                    .timeout(upload.timeout)
                    .multipart(form)
                    .send()
                    .await?;
                into_response(resp).await
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TransportError::Aborted),
                result = send => result,
            }
        })
    }
}
