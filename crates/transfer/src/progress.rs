use std::time::{Duration, Instant};

/// Snapshot of upload progress, emitted on every accounting step.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressInfo {
    /// Size of the whole file in bytes.
    pub total_size: u64,
    /// Whole percent of the needed bytes sent, 0..=100.
    pub progress: u8,
    /// Bytes accounted across every run of the current attempt.
    pub uploaded_size: u64,
    /// Average speed of the current run in bytes/second.
    pub average_speed: u64,
    /// Estimated time to send the remaining bytes; `None` while unknown.
    pub time_remaining: Option<Duration>,
}

impl ProgressInfo {
    fn zeroed(total_size: u64) -> Self {
        Self {
            total_size,
            progress: 0,
            uploaded_size: 0,
            average_speed: 0,
            time_remaining: None,
        }
    }
}

/// Derives percentage, throughput and ETA from accounted bytes.
///
/// Cumulative bytes survive pause/resume; the speed average only covers the
/// current run, which restarts on every resume.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total_size: u64,
    bytes_needed: u64,
    uploaded: u64,
    run_uploaded: u64,
    run_started: Instant,
    last: ProgressInfo,
}

impl ProgressTracker {
    pub fn new(total_size: u64) -> Self {
        Self {
            total_size,
            bytes_needed: total_size,
            uploaded: 0,
            run_uploaded: 0,
            run_started: Instant::now(),
            last: ProgressInfo::zeroed(total_size),
        }
    }

    /// Clears all counters. `bytes_needed` is the denominator of the
    /// percentage and ETA for the new attempt.
    pub fn reset(&mut self, bytes_needed: u64) -> ProgressInfo {
        self.bytes_needed = bytes_needed;
        self.uploaded = 0;
        self.run_uploaded = 0;
        self.run_started = Instant::now();
        self.last = ProgressInfo::zeroed(self.total_size);
        self.last.clone()
    }

    /// Starts a new run (upload or resume).
    pub fn start_run(&mut self) {
        self.start_run_at(Instant::now());
    }

    pub fn start_run_at(&mut self, now: Instant) {
        self.run_uploaded = 0;
        self.run_started = now;
    }

    /// Accounts `bytes` sent and returns the updated snapshot.
    pub fn record(&mut self, bytes: u64) -> ProgressInfo {
        self.record_at(bytes, Instant::now())
    }

    pub fn record_at(&mut self, bytes: u64, now: Instant) -> ProgressInfo {
        self.uploaded += bytes;
        self.run_uploaded += bytes;

        // Sub-millisecond runs count as one millisecond.
        let elapsed_ms = now
            .saturating_duration_since(self.run_started)
            .as_millis()
            .max(1) as u64;
        let bytes_per_ms = self.run_uploaded / elapsed_ms;
        let remaining = self.bytes_needed.saturating_sub(self.uploaded);

        let time_remaining = if self.run_uploaded == 0 {
            None
        } else {
            // remaining / (run_uploaded / elapsed), kept in integer millis.
            let ms = (remaining as u128 * elapsed_ms as u128) / self.run_uploaded as u128;
            Some(Duration::from_millis(ms.min(u64::MAX as u128) as u64))
        };

        let progress = if self.bytes_needed == 0 {
            100
        } else {
            ((self.uploaded as u128 * 100) / self.bytes_needed as u128).min(100) as u8
        };

        self.last = ProgressInfo {
            total_size: self.total_size,
            progress,
            uploaded_size: self.uploaded,
            average_speed: bytes_per_ms * 1000,
            time_remaining,
        };
        self.last.clone()
    }

    /// Returns the most recent snapshot.
    pub fn snapshot(&self) -> ProgressInfo {
        self.last.clone()
    }
}
