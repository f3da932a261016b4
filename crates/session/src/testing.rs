//! Scripted collaborators for session tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use blockput_protocol::ChunkReceipt;
use blockput_resume::{CacheError, MemoryResumeCache, ResumeCache, ResumeRecord};
use blockput_transfer::{ChunkSource, Md5Fingerprint, TransferError};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::session::Collaborators;
use crate::transport::{FileUpload, HttpRequest, HttpResponse, Transport, TransportError};
use crate::types::UploadEvent;

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

pub(crate) struct MemorySource {
    data: Vec<u8>,
    fail_from: Option<u64>,
    reads: AtomicUsize,
}

impl MemorySource {
    pub(crate) fn new(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
            fail_from: None,
            reads: AtomicUsize::new(0),
        }
    }

    /// Fails every read starting at or after `offset`.
    pub(crate) fn failing_from(data: &[u8], offset: u64) -> Self {
        Self {
            fail_from: Some(offset),
            ..Self::new(data)
        }
    }

    pub(crate) fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl ChunkSource for MemorySource {
    fn read_range(
        &self,
        offset: u64,
        length: u64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, TransferError>> + Send + '_>> {
        Box::pin(async move {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.fail_from.is_some_and(|from| offset >= from) {
                return Err(TransferError::Io(std::io::Error::other("disk unplugged")));
            }
            let start = offset as usize;
            let end = start + length as usize;
            self.data
                .get(start..end)
                .map(<[u8]>::to_vec)
                .ok_or(TransferError::ShortRead {
                    offset,
                    expected: length,
                })
        })
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub url: String,
    pub body: Vec<u8>,
    pub direct: bool,
}

impl Call {
    pub(crate) fn is_block(&self) -> bool {
        self.url.contains("/mkblk/")
    }

    pub(crate) fn is_merge(&self) -> bool {
        self.url.contains("/mkfile/")
    }

    pub(crate) fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub(crate) enum Reply {
    Respond(HttpResponse),
    /// Responds after a delay unless cancelled first.
    Delay(Duration, HttpResponse),
    /// Never responds; resolves `Aborted` once cancelled.
    Hang,
    Fail(TransportError),
}

type Handler = Box<dyn Fn(&Call) -> Reply + Send + Sync>;

pub(crate) struct MockTransport {
    handler: Mutex<Handler>,
    calls: Mutex<Vec<Call>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockTransport {
    pub(crate) fn new(handler: impl Fn(&Call) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            handler: Mutex::new(Box::new(handler)),
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// A server that accepts everything.
    pub(crate) fn accepting() -> Self {
        Self::new(accept)
    }

    pub(crate) fn set_handler(&self, handler: impl Fn(&Call) -> Reply + Send + Sync + 'static) {
        *self.handler.lock().unwrap() = Box::new(handler);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn block_calls(&self) -> usize {
        self.calls().iter().filter(|c| c.is_block()).count()
    }

    pub(crate) fn merge_calls(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_merge).collect()
    }

    pub(crate) fn direct_calls(&self) -> usize {
        self.calls().iter().filter(|c| c.direct).count()
    }

    pub(crate) fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    async fn serve(
        &self,
        call: Call,
        cancel: CancellationToken,
    ) -> Result<HttpResponse, TransportError> {
        let reply = {
            let handler = self.handler.lock().unwrap();
            handler(&call)
        };
        self.calls.lock().unwrap().push(call);

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let result = match reply {
            Reply::Respond(response) => Ok(response),
            Reply::Delay(delay, response) => tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TransportError::Aborted),
                _ = tokio::time::sleep(delay) => Ok(response),
            },
            Reply::Hang => {
                cancel.cancelled().await;
                Err(TransportError::Aborted)
            }
            Reply::Fail(e) => Err(e),
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl Transport for MockTransport {
    fn request<'a>(
        &'a self,
        request: &'a HttpRequest,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, TransportError>> + Send + 'a>> {
        let call = Call {
            url: request.url.clone(),
            body: request.body.clone(),
            direct: false,
        };
        Box::pin(self.serve(call, cancel))
    }

    fn upload_file<'a>(
        &'a self,
        upload: &'a FileUpload,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, TransportError>> + Send + 'a>> {
        let call = Call {
            url: upload.url.clone(),
            body: Vec::new(),
            direct: true,
        };
        Box::pin(self.serve(call, cancel))
    }
}

pub(crate) fn json_response(status: u16, body: serde_json::Value) -> HttpResponse {
    HttpResponse::new(status, body.to_string())
}

/// Block token issued for `body`.
pub(crate) fn ctx_for(body: &[u8]) -> String {
    format!("ctx-{}", String::from_utf8_lossy(body))
}

/// Accepts blocks with a body-derived token and answers merges and direct
/// uploads with the stored object's fields.
pub(crate) fn accept(call: &Call) -> Reply {
    if call.is_block() {
        Reply::Respond(json_response(200, json!({ "ctx": ctx_for(&call.body) })))
    } else {
        Reply::Respond(json_response(
            200,
            json!({ "key": "movie.mp4", "hash": "FhAbc" }),
        ))
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// A cache whose writes block until the paired sender sends or drops.
pub(crate) struct GatedCache {
    inner: Arc<MemoryResumeCache>,
    gate: Mutex<std::sync::mpsc::Receiver<()>>,
}

impl GatedCache {
    pub(crate) fn new(inner: Arc<MemoryResumeCache>) -> (Self, std::sync::mpsc::Sender<()>) {
        let (open, gate) = std::sync::mpsc::channel();
        let cache = Self {
            inner,
            gate: Mutex::new(gate),
        };
        (cache, open)
    }
}

impl ResumeCache for GatedCache {
    fn get(&self, key: &str) -> Result<Option<ResumeRecord>, CacheError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, record: &[Option<ChunkReceipt>]) -> Result<(), CacheError> {
        let _ = self.gate.lock().unwrap().recv();
        self.inner.set(key, record)
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.inner.delete(key)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub(crate) struct Mocks {
    pub source: Arc<MemorySource>,
    pub transport: Arc<MockTransport>,
    pub cache: Arc<MemoryResumeCache>,
}

impl Mocks {
    pub(crate) fn new(source: MemorySource, transport: MockTransport) -> Self {
        Self {
            source: Arc::new(source),
            transport: Arc::new(transport),
            cache: Arc::new(MemoryResumeCache::new()),
        }
    }

    pub(crate) fn collaborators(&self) -> Collaborators {
        Collaborators {
            source: self.source.clone(),
            fingerprinter: Arc::new(Md5Fingerprint),
            transport: self.transport.clone(),
            cache: self.cache.clone(),
        }
    }
}

/// Everything currently queued on `rx`.
pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<UploadEvent>) -> Vec<UploadEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Lets spawned tasks run until they block.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
