//! Runs one upload and renders its events.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use blockput_resume::{JsonFileResumeCache, MemoryResumeCache, ResumeCache};
use blockput_session::{Collaborators, Completion, UploadEvent, UploadSession};
use blockput_transfer::{FileChunkSource, ProgressInfo};

use crate::config::Config;

/// Uploads the configured file. Returns `None` when interrupted.
pub async fn run(mut config: Config) -> anyhow::Result<Option<Completion>> {
    if config.upload.total_size == 0 {
        let source = FileChunkSource::new(&config.upload.file_path);
        config.upload.total_size = source
            .size()
            .await
            .with_context(|| format!("cannot stat {}", config.upload.file_path.display()))?;
    }

    let cache = open_cache(&config)?;
    let collaborators = Collaborators::for_file(&config.upload, cache)?;
    let mut session = UploadSession::new(config.upload, collaborators)?;
    let mut events = session
        .take_events()
        .context("event receiver already taken")?;

    session.upload()?;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    anyhow::bail!("session stopped without completing");
                };
                if let Some(completion) = render(event) {
                    return Ok(Some(completion));
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("SIGINT received, cancelling upload");
                session.cancel()?;
                return Ok(None);
            }
        }
    }
}

fn open_cache(config: &Config) -> anyhow::Result<Arc<dyn ResumeCache>> {
    if config.cache.in_memory {
        return Ok(Arc::new(MemoryResumeCache::new()));
    }
    let ttl = config.upload.resume_ttl();
    let cache = match &config.cache.path {
        Some(path) => JsonFileResumeCache::open(path, ttl)?,
        None => JsonFileResumeCache::open_default(ttl)?,
    };
    tracing::debug!(path = %cache.path().display(), "resume cache opened");
    Ok(Arc::new(cache))
}

/// Logs `event`; returns the completion once the attempt ends.
fn render(event: UploadEvent) -> Option<Completion> {
    match event {
        UploadEvent::Progress(p) => {
            tracing::info!(
                progress = p.progress,
                uploaded = p.uploaded_size,
                total = p.total_size,
                speed = %format_speed(p.average_speed),
                eta = %format_eta(p.time_remaining),
                "{}",
                progress_bar(&p)
            );
            None
        }
        UploadEvent::Retry(info) => {
            tracing::warn!(status = info.status_code, url = %info.url, "retrying request");
            None
        }
        UploadEvent::Success(outcome) => {
            tracing::info!(fields = outcome.server_fields.len(), "upload succeeded");
            None
        }
        UploadEvent::Fail(failure) => {
            tracing::error!(code = failure.code.code(), error = %failure.message, "upload failed");
            None
        }
        UploadEvent::Complete(completion) => Some(completion),
    }
}

fn progress_bar(p: &ProgressInfo) -> String {
    const WIDTH: usize = 20;
    let filled = usize::from(p.progress) * WIDTH / 100;
    format!(
        "[{}{}] {:>3}%",
        "#".repeat(filled),
        "-".repeat(WIDTH - filled),
        p.progress
    )
}

fn format_speed(bytes_per_sec: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * 1024;
    match bytes_per_sec {
        b if b >= MIB => format!("{:.1} MiB/s", b as f64 / MIB as f64),
        b if b >= KIB => format!("{:.1} KiB/s", b as f64 / KIB as f64),
        b => format!("{b} B/s"),
    }
}

fn format_eta(remaining: Option<Duration>) -> String {
    match remaining {
        None => "unknown".into(),
        Some(d) => {
            let secs = d.as_secs();
            format!("{}:{:02}", secs / 60, secs % 60)
        }
    }
}
