//! Session controller: the single owner of all upload bookkeeping.
//!
//! Runs as one task. Commands from the [`UploadSession`](crate::UploadSession)
//! handle and completions from spawned read and upload tasks arrive on
//! channels, and every handled message ends with one scheduling pass.
//! Spawned tasks never touch the bookkeeping directly.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use blockput_protocol::{BlockResponse, ChunkReceipt};
use blockput_resume::ResumeRecord;
use blockput_transfer::{
    ChunkPlan, Fingerprinter, LoadedChunk, ProgressTracker, ReceiptBook, TransferError,
};
use chrono::Utc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::UploaderConfig;
use crate::error::{ErrorCode, FailureInfo, RequestError, UploadFailure};
use crate::requests;
use crate::retry::{RetryPolicy, send_with_retry};
use crate::session::Collaborators;
use crate::store::ResumeStore;
use crate::transport::{FileUpload, HttpRequest, HttpResponse};
use crate::types::{
    Completion, RetryInfo, SessionSnapshot, SessionState, UploadEvent, UploadOutcome,
};

/// Requests from the session handle.
pub(crate) enum Command {
    Upload,
    Pause,
    Resume,
    Cancel,
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Wait(oneshot::Sender<Option<Completion>>),
}

/// Completions reported by spawned tasks and the resume store.
pub(crate) enum TaskEvent {
    Loaded {
        epoch: u64,
        index: usize,
        result: Result<LoadedChunk, TransferError>,
    },
    Retry {
        task: u64,
        info: RetryInfo,
    },
    Block {
        task: u64,
        index: usize,
        length: u64,
        fingerprint: String,
        result: Result<HttpResponse, RequestError>,
    },
    Merge {
        task: u64,
        result: Result<HttpResponse, RequestError>,
    },
    Direct {
        task: u64,
        result: Result<HttpResponse, RequestError>,
    },
    CacheLoaded {
        epoch: u64,
        record: Option<ResumeRecord>,
    },
    /// The attempt ended and every cache write before it has finished.
    Settled {
        epoch: u64,
        completion: Completion,
    },
}

enum Outgoing {
    Request(HttpRequest),
    File(FileUpload),
}

impl Outgoing {
    fn url(&self) -> &str {
        match self {
            Outgoing::Request(request) => &request.url,
            Outgoing::File(upload) => &upload.url,
        }
    }
}

/// A running network task. Completions carrying another id are stale.
struct InFlight {
    task: u64,
    cancel: CancellationToken,
    started: Instant,
}

impl InFlight {
    fn abort(self) {
        self.cancel.cancel();
    }
}

pub(crate) struct Controller {
    id: Uuid,
    config: UploaderConfig,
    plan: ChunkPlan,
    max_loaded: usize,
    max_concurrency: usize,
    block_policy: RetryPolicy,
    direct_policy: RetryPolicy,
    resume_ttl: Duration,
    collab: Collaborators,
    store: ResumeStore,
    events: mpsc::UnboundedSender<UploadEvent>,
    tasks_tx: mpsc::UnboundedSender<TaskEvent>,
    /// Parent of every request token; fired when the handle is dropped.
    root: CancellationToken,

    state: SessionState,
    /// Bumped on reset so reads of an earlier attempt are dropped.
    epoch: u64,
    next_task: u64,
    need_read: VecDeque<usize>,
    need_send: BTreeSet<usize>,
    queue: VecDeque<LoadedChunk>,
    reads_in_flight: usize,
    in_flight: BTreeMap<usize, InFlight>,
    receipts: ReceiptBook,
    cached: Option<ResumeRecord>,
    /// Dispatch waits while the record of an earlier attempt is read.
    cache_loading: bool,
    direct: Option<InFlight>,
    merge: Option<InFlight>,
    progress: ProgressTracker,
    completion: Option<Completion>,
    waiters: Vec<oneshot::Sender<Option<Completion>>>,
}

impl Controller {
    /// Starts the controller task and returns its command channel.
    ///
    /// Emits the initial zeroed progress event before returning.
    pub(crate) fn spawn(
        runtime: &Handle,
        id: Uuid,
        config: UploaderConfig,
        plan: ChunkPlan,
        collab: Collaborators,
        events: mpsc::UnboundedSender<UploadEvent>,
    ) -> mpsc::UnboundedSender<Command> {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();

        let statuses = config.status_policy();
        let block_policy = RetryPolicy {
            statuses: statuses.clone(),
            max_retries: config.max_chunk_retries,
            interval: config.retry_interval(),
        };
        let direct_policy = RetryPolicy {
            statuses,
            max_retries: config.direct_retries(),
            interval: config.retry_interval(),
        };

        let store = ResumeStore::spawn(
            runtime,
            id,
            Arc::clone(&collab.cache),
            config.resume_key(),
            config.resume_ttl(),
            tasks_tx.clone(),
        );

        let controller = Controller {
            id,
            max_loaded: plan.max_loaded_chunks(config.max_memory),
            max_concurrency: config.concurrency(),
            block_policy,
            direct_policy,
            resume_ttl: config.resume_ttl(),
            plan,
            config,
            collab,
            store,
            events,
            tasks_tx,
            root: CancellationToken::new(),
            state: SessionState::Idle,
            epoch: 0,
            next_task: 0,
            need_read: (0..plan.chunk_count).collect(),
            need_send: (0..plan.chunk_count).collect(),
            queue: VecDeque::new(),
            reads_in_flight: 0,
            in_flight: BTreeMap::new(),
            receipts: ReceiptBook::new(plan.chunk_count),
            cached: None,
            cache_loading: false,
            direct: None,
            merge: None,
            progress: ProgressTracker::new(plan.total_size),
            completion: None,
            waiters: Vec::new(),
        };
        controller.emit(UploadEvent::Progress(controller.progress.snapshot()));

        runtime.spawn(controller.run(commands_rx, tasks_rx));
        commands_tx
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut tasks: mpsc::UnboundedReceiver<TaskEvent>,
    ) {
        debug!(
            session = %self.id,
            chunks = self.plan.chunk_count,
            direct = self.plan.direct,
            max_loaded = self.max_loaded,
            "controller started"
        );

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    self.handle_command(command);
                }
                Some(event) = tasks.recv() => self.handle_task(event),
            }
            self.schedule();
        }

        self.root.cancel();
        debug!(session = %self.id, "session handle dropped, controller stopped");
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Upload => self.upload(),
            Command::Pause => self.pause(),
            Command::Resume => self.resume(),
            Command::Cancel => self.cancel(),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Wait(reply) => match &self.completion {
                Some(completion) if self.state.is_terminal() => {
                    let _ = reply.send(Some(completion.clone()));
                }
                _ => self.waiters.push(reply),
            },
        }
    }

    fn upload(&mut self) {
        if matches!(self.state, SessionState::Uploading | SessionState::Paused) {
            warn!(session = %self.id, state = ?self.state, "upload already running, ignoring");
            return;
        }

        self.reset();
        self.state = SessionState::Uploading;
        if self.config.resume_by_fingerprint && !self.plan.direct {
            self.cache_loading = true;
            self.store.load(self.epoch);
        }
        info!(
            session = %self.id,
            size = self.plan.total_size,
            chunks = self.plan.chunk_count,
            direct = self.plan.direct,
            "upload started"
        );
        self.start_run();
    }

    fn pause(&mut self) {
        if self.state != SessionState::Uploading {
            return;
        }
        self.state = SessionState::Paused;
        let requeued = self.abort_uploads(true);
        info!(session = %self.id, requeued, "upload paused");
    }

    fn resume(&mut self) {
        if self.state != SessionState::Paused {
            return;
        }
        self.state = SessionState::Uploading;
        info!(session = %self.id, remaining = self.need_send.len(), "upload resumed");
        self.start_run();
    }

    fn cancel(&mut self) {
        let from = self.state;
        self.pause();
        self.reset();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(None);
        }
        info!(session = %self.id, from = ?from, "upload cancelled");
    }

    fn start_run(&mut self) {
        self.progress.start_run();
        if self.plan.direct {
            self.start_direct();
        }
    }

    /// Returns every chunk to its initial state and zeroes progress.
    fn reset(&mut self) {
        self.abort_uploads(false);
        if let Some(merge) = self.merge.take() {
            merge.abort();
        }

        let count = self.plan.chunk_count;
        self.epoch += 1;
        self.state = SessionState::Idle;
        self.need_read = (0..count).collect();
        self.need_send = (0..count).collect();
        self.queue.clear();
        self.reads_in_flight = 0;
        self.receipts = ReceiptBook::new(count);
        self.completion = None;
        self.cached = None;
        self.cache_loading = false;

        let needed = if self.plan.direct {
            self.plan.total_size
        } else {
            self.plan.bytes_for(&self.need_send)
        };
        let info = self.progress.reset(needed);
        self.emit(UploadEvent::Progress(info));
    }

    /// Aborts block and direct uploads. With `requeue`, aborted chunks go
    /// back to the end of the read list. Returns the number of aborted
    /// block uploads.
    fn abort_uploads(&mut self, requeue: bool) -> usize {
        let in_flight = std::mem::take(&mut self.in_flight);
        let aborted = in_flight.len();
        for (index, flight) in in_flight {
            flight.abort();
            if requeue {
                info!(session = %self.id, index, "chunk upload aborted");
                self.need_read.push_back(index);
            }
        }
        if let Some(direct) = self.direct.take() {
            direct.abort();
        }
        aborted
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            plan: self.plan,
            need_read: self.need_read.iter().copied().collect(),
            need_send: self.need_send.iter().copied().collect(),
            queued: self.queue.iter().map(|chunk| chunk.index).collect(),
            in_flight: self.in_flight.keys().copied().collect(),
            reads_in_flight: self.reads_in_flight,
            sent: self.receipts.filled(),
            progress: self.progress.snapshot(),
        }
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Refills the read-ahead window, hands queued chunks to free workers
    /// and starts the merge once every chunk has a receipt.
    fn schedule(&mut self) {
        if self.state != SessionState::Uploading || self.plan.direct || self.merge.is_some() {
            return;
        }

        loop {
            self.load_chunks();
            if !self.dispatch_next() {
                break;
            }
        }

        if self.receipts.is_complete() {
            self.start_merge();
        }
    }

    fn load_chunks(&mut self) {
        let pending = self.queue.len() + self.reads_in_flight;
        for _ in 0..self.max_loaded.saturating_sub(pending) {
            let Some(index) = self.need_read.pop_front() else {
                break;
            };
            self.spawn_read(index);
        }
    }

    fn spawn_read(&mut self, index: usize) {
        let offset = self.plan.chunk_offset(index);
        let length = self.plan.chunk_len(index);
        let source = Arc::clone(&self.collab.source);
        let fingerprinter = self
            .config
            .resume_by_fingerprint
            .then(|| Arc::clone(&self.collab.fingerprinter));
        let tx = self.tasks_tx.clone();
        let epoch = self.epoch;

        self.reads_in_flight += 1;
        trace!(session = %self.id, index, offset, length, "reading chunk");

        tokio::spawn(async move {
            let result = match source.read_range(offset, length).await {
                Ok(data) => fingerprint_chunk(fingerprinter, data).await,
                Err(e) => Err(e),
            }
            .map(|(data, fingerprint)| LoadedChunk {
                index,
                offset,
                length,
                data,
                fingerprint,
            });
            let _ = tx.send(TaskEvent::Loaded {
                epoch,
                index,
                result,
            });
        });
    }

    /// Takes the head of the queue. Returns `false` when nothing can be
    /// dispatched.
    fn dispatch_next(&mut self) -> bool {
        if self.cache_loading || self.in_flight.len() >= self.max_concurrency {
            return false;
        }
        let Some(chunk) = self.queue.pop_front() else {
            return false;
        };

        if let Some(receipt) = self.reusable_receipt(&chunk) {
            debug!(session = %self.id, index = chunk.index, "chunk already stored, skipping");
            self.accept(chunk.index, chunk.length, receipt);
        } else {
            self.spawn_block(chunk);
        }
        true
    }

    /// A cached receipt is reused only while fresh and only when its
    /// fingerprint equals the chunk's.
    fn reusable_receipt(&self, chunk: &LoadedChunk) -> Option<ChunkReceipt> {
        if !self.config.resume_by_fingerprint {
            return None;
        }
        let cached = self.cached.as_ref()?.get(chunk.index)?.as_ref()?;
        let ttl = chrono::Duration::from_std(self.resume_ttl).ok()?;
        let fresh = !cached.is_expired(ttl, Utc::now());
        (fresh && cached.fingerprint == chunk.fingerprint).then(|| cached.clone())
    }

    fn accept(&mut self, index: usize, length: u64, receipt: ChunkReceipt) {
        self.receipts.insert(index, receipt);
        self.need_send.remove(&index);
        let info = self.progress.record(length);
        self.emit(UploadEvent::Progress(info));
    }

    fn next_task(&mut self) -> u64 {
        self.next_task += 1;
        self.next_task
    }

    fn spawn_block(&mut self, chunk: LoadedChunk) {
        let LoadedChunk {
            index,
            length,
            data,
            fingerprint,
            ..
        } = chunk;
        let task = self.next_task();
        let cancel = self.root.child_token();
        self.in_flight.insert(
            index,
            InFlight {
                task,
                cancel: cancel.clone(),
                started: Instant::now(),
            },
        );

        debug!(session = %self.id, index, length, task, "uploading chunk");
        let request = requests::block_request(&self.config, data);
        self.spawn_request(
            cancel,
            self.block_policy.clone(),
            task,
            Outgoing::Request(request),
            move |result| TaskEvent::Block {
                task,
                index,
                length,
                fingerprint,
                result,
            },
        );
    }

    fn start_merge(&mut self) {
        let Some(tokens) = self.receipts.tokens() else {
            return;
        };
        let request = requests::merge_request(&self.config, tokens);

        let task = self.next_task();
        let cancel = self.root.child_token();
        self.merge = Some(InFlight {
            task,
            cancel: cancel.clone(),
            started: Instant::now(),
        });

        info!(session = %self.id, chunks = self.plan.chunk_count, "all chunks stored, merging");
        self.spawn_request(
            cancel,
            self.block_policy.clone(),
            task,
            Outgoing::Request(request),
            move |result| TaskEvent::Merge { task, result },
        );
    }

    fn start_direct(&mut self) {
        let task = self.next_task();
        let cancel = self.root.child_token();
        self.direct = Some(InFlight {
            task,
            cancel: cancel.clone(),
            started: Instant::now(),
        });

        info!(session = %self.id, size = self.plan.total_size, "direct upload started");
        let upload = requests::direct_upload(&self.config);
        self.spawn_request(
            cancel,
            self.direct_policy.clone(),
            task,
            Outgoing::File(upload),
            move |result| TaskEvent::Direct { task, result },
        );
    }

    /// Runs `outgoing` through the retry policy on its own task and reports
    /// the outcome through `finish`.
    fn spawn_request(
        &self,
        cancel: CancellationToken,
        policy: RetryPolicy,
        task: u64,
        outgoing: Outgoing,
        finish: impl FnOnce(Result<HttpResponse, RequestError>) -> TaskEvent + Send + 'static,
    ) {
        let transport = Arc::clone(&self.collab.transport);
        let tx = self.tasks_tx.clone();

        tokio::spawn(async move {
            let result = {
                let transport = &*transport;
                let outgoing = &outgoing;
                let attempt_cancel = cancel.clone();
                send_with_retry(
                    &policy,
                    &cancel,
                    outgoing.url(),
                    move || match outgoing {
                        Outgoing::Request(request) => {
                            transport.request(request, attempt_cancel.clone())
                        }
                        Outgoing::File(upload) => {
                            transport.upload_file(upload, attempt_cancel.clone())
                        }
                    },
                    |info| {
                        let _ = tx.send(TaskEvent::Retry { task, info });
                    },
                )
                .await
            };
            let _ = tx.send(finish(result));
        });
    }

    // -----------------------------------------------------------------------
    // Completions
    // -----------------------------------------------------------------------

    fn handle_task(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::Loaded {
                epoch,
                index,
                result,
            } => self.on_loaded(epoch, index, result),
            TaskEvent::Retry { task, info } => {
                if self.is_live(task) {
                    self.emit(UploadEvent::Retry(info));
                }
            }
            TaskEvent::Block {
                task,
                index,
                length,
                fingerprint,
                result,
            } => self.on_block(task, index, length, fingerprint, result),
            TaskEvent::Merge { task, result } => self.on_merge(task, result),
            TaskEvent::Direct { task, result } => self.on_direct(task, result),
            TaskEvent::CacheLoaded { epoch, record } => self.on_cache_loaded(epoch, record),
            TaskEvent::Settled { epoch, completion } => {
                if epoch == self.epoch {
                    self.complete(completion);
                }
            }
        }
    }

    fn is_live(&self, task: u64) -> bool {
        self.in_flight.values().any(|f| f.task == task)
            || self.direct.as_ref().is_some_and(|f| f.task == task)
            || self.merge.as_ref().is_some_and(|f| f.task == task)
    }

    fn on_loaded(&mut self, epoch: u64, index: usize, result: Result<LoadedChunk, TransferError>) {
        if epoch != self.epoch {
            trace!(session = %self.id, index, "dropping read of an earlier attempt");
            return;
        }
        self.reads_in_flight = self.reads_in_flight.saturating_sub(1);
        if self.state == SessionState::Failed {
            return;
        }

        match result {
            Ok(chunk) => self.queue.push_back(chunk),
            Err(e) => self.fail(UploadFailure::new(
                ErrorCode::Read,
                format!("failed to read chunk {index}: {e}"),
                FailureInfo::error(e.to_string()),
            )),
        }
    }

    fn on_cache_loaded(&mut self, epoch: u64, record: Option<ResumeRecord>) {
        if epoch != self.epoch || !self.cache_loading {
            return;
        }
        self.cache_loading = false;
        if let Some(record) = &record {
            info!(
                session = %self.id,
                receipts = record.iter().flatten().count(),
                "resuming from earlier attempt"
            );
        }
        self.cached = record;
    }

    fn on_block(
        &mut self,
        task: u64,
        index: usize,
        length: u64,
        fingerprint: String,
        result: Result<HttpResponse, RequestError>,
    ) {
        if self.in_flight.get(&index).map(|f| f.task) != Some(task) {
            trace!(session = %self.id, index, task, "ignoring stale block completion");
            return;
        }
        let Some(flight) = self.in_flight.remove(&index) else {
            return;
        };
        let elapsed_ms = flight.started.elapsed().as_millis() as u64;

        match result {
            Ok(response) => match serde_json::from_slice::<BlockResponse>(&response.body) {
                Ok(block) => {
                    if self.config.verbose {
                        info!(session = %self.id, index, length, elapsed_ms, "chunk stored");
                    } else {
                        debug!(session = %self.id, index, length, elapsed_ms, "chunk stored");
                    }
                    self.accept(index, length, ChunkReceipt::new(block.ctx, length, fingerprint));
                    self.persist_receipts();
                }
                Err(e) => self.fail(UploadFailure::new(
                    ErrorCode::ChunkUpload,
                    format!("invalid block response for chunk {index}: {e}"),
                    FailureInfo::response(&response),
                )),
            },
            Err(RequestError::Aborted) => {
                trace!(session = %self.id, index, "block upload aborted");
            }
            Err(e) => self.fail(e.into_failure(ErrorCode::ChunkUpload)),
        }
    }

    fn on_merge(&mut self, task: u64, result: Result<HttpResponse, RequestError>) {
        if self.merge.as_ref().map(|f| f.task) != Some(task) {
            return;
        }
        let Some(merge) = self.merge.take() else {
            return;
        };

        if self.config.resume_by_fingerprint {
            self.store.purge();
        }

        match result {
            Ok(response) => {
                info!(
                    session = %self.id,
                    elapsed_ms = merge.started.elapsed().as_millis() as u64,
                    "merge complete"
                );
                self.succeed(&response);
            }
            Err(RequestError::Aborted) => {}
            Err(e) => self.fail(e.into_failure(ErrorCode::Merge)),
        }
    }

    fn on_direct(&mut self, task: u64, result: Result<HttpResponse, RequestError>) {
        if self.direct.as_ref().map(|f| f.task) != Some(task) {
            return;
        }
        let Some(direct) = self.direct.take() else {
            return;
        };

        match result {
            Ok(response) => {
                info!(
                    session = %self.id,
                    elapsed_ms = direct.started.elapsed().as_millis() as u64,
                    "direct upload complete"
                );
                let info = self.progress.record(self.plan.total_size);
                self.emit(UploadEvent::Progress(info));
                self.succeed(&response);
            }
            Err(RequestError::Aborted) => {}
            Err(e) => self.fail(e.into_failure(ErrorCode::DirectUpload)),
        }
    }

    fn succeed(&mut self, response: &HttpResponse) {
        let outcome = UploadOutcome::from_body(&response.body);
        self.state = SessionState::Succeeded;
        info!(session = %self.id, size = self.plan.total_size, "upload succeeded");
        self.settle(Completion::Success(outcome));
    }

    /// Enters `Failed` and reports `failure`, at most once per attempt.
    fn fail(&mut self, failure: UploadFailure) {
        if self.state == SessionState::Failed {
            debug!(session = %self.id, error = %failure.message, "suppressing failure after the first");
            return;
        }

        error!(
            session = %self.id,
            code = failure.code.code(),
            error = %failure.message,
            "upload failed"
        );
        self.abort_uploads(false);
        if let Some(merge) = self.merge.take() {
            merge.abort();
        }
        self.queue.clear();
        self.state = SessionState::Failed;
        self.settle(Completion::Fail(failure));
    }

    /// Reports `completion` once pending resume cache writes are done.
    fn settle(&self, completion: Completion) {
        self.store.flush(TaskEvent::Settled {
            epoch: self.epoch,
            completion,
        });
    }

    fn complete(&mut self, completion: Completion) {
        match &completion {
            Completion::Success(outcome) => self.emit(UploadEvent::Success(outcome.clone())),
            Completion::Fail(failure) => self.emit(UploadEvent::Fail(failure.clone())),
        }
        self.emit(UploadEvent::Complete(completion.clone()));
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Some(completion.clone()));
        }
        self.completion = Some(completion);
    }

    fn emit(&self, event: UploadEvent) {
        let _ = self.events.send(event);
    }

    // -----------------------------------------------------------------------
    // Resume cache
    // -----------------------------------------------------------------------

    fn persist_receipts(&self) {
        if !self.config.resume_by_fingerprint {
            return;
        }
        self.store.store(self.receipts.slots().to_vec());
    }
}

/// Fingerprints `data` on the blocking pool. Without a fingerprinter the
/// fingerprint is empty.
async fn fingerprint_chunk(
    fingerprinter: Option<Arc<dyn Fingerprinter>>,
    data: Vec<u8>,
) -> Result<(Vec<u8>, String), TransferError> {
    let Some(fingerprinter) = fingerprinter else {
        return Ok((data, String::new()));
    };
    tokio::task::spawn_blocking(move || {
        let fingerprint = fingerprinter.fingerprint(&data);
        (data, fingerprint)
    })
    .await
    .map_err(|e| TransferError::Join(e.to_string()))
}
