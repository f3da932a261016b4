use std::path::PathBuf;
use std::time::Duration;

use blockput_protocol::{PutExtra, StatusPolicy, constants};
use blockput_resume::{DEFAULT_RESUME_TTL, size_key};
use blockput_transfer::{
    ChunkPlan, DEFAULT_CHUNK_SIZE, DEFAULT_DIRECT_THRESHOLD, DEFAULT_MAX_MEMORY, MAX_CHUNK_COUNT,
};
use serde::{Deserialize, Serialize};

use crate::error::UploadError;

/// Options of one upload session.
///
/// Every field except `file_path`, `upload_host` and `token` has a default,
/// so a config file only needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploaderConfig {
    /// File to upload.
    pub file_path: PathBuf,

    /// Size of the file in bytes. Zero lets the caller derive it.
    #[serde(default)]
    pub total_size: u64,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Upper bound on simultaneous block uploads.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Upper bound on bytes held by loaded-but-unsent chunks.
    #[serde(default = "default_max_memory")]
    pub max_memory: u64,

    #[serde(default)]
    pub chunk_retry_interval_ms: u64,

    /// Retries per request after an ambiguous status.
    #[serde(default)]
    pub max_chunk_retries: u32,

    /// Retry budget of the direct upload; shares `max_chunk_retries` when
    /// unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_max_retries: Option<u32>,

    /// Per-request timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_success_status")]
    pub success_status: Vec<u16>,

    #[serde(default = "default_fail_status")]
    pub fail_status: Vec<u16>,

    /// Logs per-chunk timings at info level.
    #[serde(default)]
    pub verbose: bool,

    /// Skips chunks whose fingerprint matches a cached receipt.
    #[serde(default = "default_true")]
    pub resume_by_fingerprint: bool,

    #[serde(default)]
    pub force_direct: bool,

    /// Files smaller than this are uploaded in one request.
    #[serde(default = "default_direct_threshold")]
    pub direct_threshold: u64,

    /// Object name on the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Opaque authorization token.
    #[serde(default)]
    pub token: String,

    /// Base URL of the upload service.
    #[serde(default)]
    pub upload_host: String,

    #[serde(default)]
    pub put_extra: PutExtra,

    /// Resume cache key; the total size in decimal when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_key: Option<String>,

    #[serde(default = "default_resume_ttl_secs")]
    pub resume_ttl_secs: u64,
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_max_concurrency() -> usize {
    3
}

fn default_max_memory() -> u64 {
    DEFAULT_MAX_MEMORY
}

fn default_timeout_ms() -> u64 {
    20_000
}

fn default_success_status() -> Vec<u16> {
    constants::DEFAULT_SUCCESS_STATUS.to_vec()
}

fn default_fail_status() -> Vec<u16> {
    constants::DEFAULT_FAIL_STATUS.to_vec()
}

fn default_true() -> bool {
    true
}

fn default_direct_threshold() -> u64 {
    DEFAULT_DIRECT_THRESHOLD
}

fn default_resume_ttl_secs() -> u64 {
    DEFAULT_RESUME_TTL.as_secs()
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            file_path: PathBuf::new(),
            total_size: 0,
            chunk_size: default_chunk_size(),
            max_concurrency: default_max_concurrency(),
            max_memory: default_max_memory(),
            chunk_retry_interval_ms: 0,
            max_chunk_retries: 0,
            direct_max_retries: None,
            timeout_ms: default_timeout_ms(),
            success_status: default_success_status(),
            fail_status: default_fail_status(),
            verbose: false,
            resume_by_fingerprint: true,
            force_direct: false,
            direct_threshold: default_direct_threshold(),
            key: None,
            token: String::new(),
            upload_host: String::new(),
            put_extra: PutExtra::default(),
            resume_key: None,
            resume_ttl_secs: default_resume_ttl_secs(),
        }
    }
}

impl UploaderConfig {
    pub fn new(
        file_path: impl Into<PathBuf>,
        total_size: u64,
        upload_host: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            total_size,
            upload_host: upload_host.into(),
            token: token.into(),
            ..Self::default()
        }
    }

    /// Rejects configurations no session can run with.
    pub fn validate(&self) -> Result<(), UploadError> {
        if self.chunk_size == 0 {
            return Err(UploadError::Config("chunk_size must be positive".into()));
        }
        let chunks = self.total_size.div_ceil(self.chunk_size);
        if chunks > MAX_CHUNK_COUNT {
            return Err(UploadError::Config(format!(
                "{} bytes in {}-byte chunks needs {chunks} chunks (at most {MAX_CHUNK_COUNT})",
                self.total_size, self.chunk_size
            )));
        }
        if self.upload_host.trim().is_empty() {
            return Err(UploadError::Config("upload_host is required".into()));
        }
        if let Some(status) = self.status_policy().overlap() {
            return Err(UploadError::Config(format!(
                "status {status} is both a success and a failure status"
            )));
        }
        Ok(())
    }

    pub fn plan(&self) -> Result<ChunkPlan, UploadError> {
        Ok(ChunkPlan::new(
            self.total_size,
            self.chunk_size,
            self.direct_threshold,
            self.force_direct,
        )?)
    }

    pub fn status_policy(&self) -> StatusPolicy {
        StatusPolicy {
            success: self.success_status.clone(),
            fail: self.fail_status.clone(),
        }
    }

    /// `max_concurrency`, never below one.
    pub fn concurrency(&self) -> usize {
        self.max_concurrency.max(1)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.chunk_retry_interval_ms)
    }

    pub fn direct_retries(&self) -> u32 {
        self.direct_max_retries.unwrap_or(self.max_chunk_retries)
    }

    pub fn resume_key(&self) -> String {
        self.resume_key
            .clone()
            .unwrap_or_else(|| size_key(self.total_size))
    }

    pub fn resume_ttl(&self) -> Duration {
        Duration::from_secs(self.resume_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> UploaderConfig {
        UploaderConfig::new("/tmp/a.bin", 10, "https://up.example.com", "tok")
    }

    #[test]
    fn defaults_follow_documented_values() {
        let config = UploaderConfig::default();
        assert_eq!(config.chunk_size, 4 * 1024 * 1024);
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.max_memory, 100 * 1024 * 1024);
        assert_eq!(config.timeout_ms, 20_000);
        assert_eq!(config.max_chunk_retries, 0);
        assert_eq!(config.success_status, vec![200, 201, 202]);
        assert_eq!(config.fail_status, vec![404, 415, 500, 501]);
        assert!(config.resume_by_fingerprint);
        assert!(!config.force_direct);
        assert_eq!(config.resume_ttl(), Duration::from_secs(6000));
    }

    #[test]
    fn validate_accepts_minimal_config() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_chunk_size() {
        let config = UploaderConfig {
            chunk_size: 0,
            ..valid()
        };
        assert!(matches!(config.validate(), Err(UploadError::Config(_))));
    }

    #[test]
    fn validate_rejects_absurd_chunk_count() {
        let config = UploaderConfig {
            total_size: u64::MAX,
            chunk_size: 1,
            ..valid()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("chunks"));

        let at_limit = UploaderConfig {
            total_size: MAX_CHUNK_COUNT * 4,
            chunk_size: 4,
            ..valid()
        };
        assert!(at_limit.validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_host() {
        let config = UploaderConfig {
            upload_host: "  ".into(),
            ..valid()
        };
        assert!(matches!(config.validate(), Err(UploadError::Config(_))));
    }

    #[test]
    fn validate_rejects_overlapping_status_sets() {
        let config = UploaderConfig {
            fail_status: vec![200, 500],
            ..valid()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("200"));
    }

    #[test]
    fn concurrency_is_clamped() {
        let config = UploaderConfig {
            max_concurrency: 0,
            ..valid()
        };
        assert_eq!(config.concurrency(), 1);
    }

    #[test]
    fn direct_retries_share_chunk_budget_when_unset() {
        let mut config = UploaderConfig {
            max_chunk_retries: 4,
            ..valid()
        };
        assert_eq!(config.direct_retries(), 4);
        config.direct_max_retries = Some(1);
        assert_eq!(config.direct_retries(), 1);
    }

    #[test]
    fn resume_key_defaults_to_size() {
        let mut config = valid();
        assert_eq!(config.resume_key(), "10");
        config.resume_key = Some("bucket/a.bin".into());
        assert_eq!(config.resume_key(), "bucket/a.bin");
    }

    #[test]
    fn deserialize_fills_defaults() {
        let json = r#"{
            "file_path": "/data/video.mp4",
            "upload_host": "https://up.example.com",
            "token": "abc",
            "max_chunk_retries": 2
        }"#;
        let config: UploaderConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_chunk_retries, 2);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(config.key.is_none());
        assert!(config.put_extra.params.is_empty());
    }
}
