//! Public session handle.

use std::sync::Arc;

use blockput_resume::ResumeCache;
use blockput_transfer::{ChunkPlan, ChunkSource, FileChunkSource, Fingerprinter, Md5Fingerprint};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::info;
use uuid::Uuid;

use crate::config::UploaderConfig;
use crate::controller::{Command, Controller};
use crate::error::UploadError;
use crate::transport::{ReqwestTransport, Transport};
use crate::types::{Completion, SessionSnapshot, UploadEvent};

/// Everything a session talks to outside of its own bookkeeping.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn ChunkSource>,
    pub fingerprinter: Arc<dyn Fingerprinter>,
    pub transport: Arc<dyn Transport>,
    pub cache: Arc<dyn ResumeCache>,
}

impl Collaborators {
    /// Disk reads of `config.file_path`, MD5 fingerprints and a reqwest
    /// transport.
    pub fn for_file(
        config: &UploaderConfig,
        cache: Arc<dyn ResumeCache>,
    ) -> Result<Self, UploadError> {
        Ok(Self {
            source: Arc::new(FileChunkSource::new(&config.file_path)),
            fingerprinter: Arc::new(Md5Fingerprint),
            transport: Arc::new(ReqwestTransport::new()?),
            cache,
        })
    }
}

/// Handle to one upload session.
///
/// The session runs on its own task; every control method only enqueues a
/// command and returns immediately. Dropping the handle stops the session
/// and aborts any request in flight.
pub struct UploadSession {
    id: Uuid,
    plan: ChunkPlan,
    commands: mpsc::UnboundedSender<Command>,
    events_rx: Option<mpsc::UnboundedReceiver<UploadEvent>>,
}

impl UploadSession {
    /// Validates `config`, plans the upload and starts the session task.
    ///
    /// Must be called from within a tokio runtime. A zeroed progress event
    /// is queued before this returns.
    pub fn new(config: UploaderConfig, collaborators: Collaborators) -> Result<Self, UploadError> {
        config.validate()?;
        let plan = config.plan()?;
        let runtime = Handle::try_current().map_err(|_| UploadError::NoRuntime)?;

        let id = Uuid::new_v4();
        info!(
            session = %id,
            file = %config.file_path.display(),
            size = plan.total_size,
            chunks = plan.chunk_count,
            direct = plan.direct,
            "session created"
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let commands = Controller::spawn(&runtime, id, config, plan, collaborators, events_tx);

        Ok(Self {
            id,
            plan,
            commands,
            events_rx: Some(events_rx),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Chunk layout and strategy, fixed for the session's lifetime.
    pub fn plan(&self) -> &ChunkPlan {
        &self.plan
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<UploadEvent>> {
        self.events_rx.take()
    }

    /// Starts a fresh attempt from `Idle`, `Failed` or `Succeeded`.
    pub fn upload(&self) -> Result<(), UploadError> {
        self.send(Command::Upload)
    }

    /// Aborts in-flight requests and keeps completed chunks.
    pub fn pause(&self) -> Result<(), UploadError> {
        self.send(Command::Pause)
    }

    pub fn resume(&self) -> Result<(), UploadError> {
        self.send(Command::Resume)
    }

    /// Aborts everything and returns to `Idle` with zeroed progress.
    pub fn cancel(&self) -> Result<(), UploadError> {
        self.send(Command::Cancel)
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, UploadError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await.map_err(|_| UploadError::SessionClosed)
    }

    /// Waits for the current attempt to end.
    ///
    /// Resolves immediately when the session already sits in a terminal
    /// state, and with `None` when the attempt is cancelled.
    pub async fn wait(&self) -> Result<Option<Completion>, UploadError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Wait(tx))?;
        rx.await.map_err(|_| UploadError::SessionClosed)
    }

    fn send(&self, command: Command) -> Result<(), UploadError> {
        self.commands
            .send(command)
            .map_err(|_| UploadError::SessionClosed)
    }
}
