use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_FAIL_STATUS, DEFAULT_SUCCESS_STATUS};

/// Response body of a successful `mkblk` request.
///
/// Only the continuation token is read; other fields are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockResponse {
    pub ctx: String,
}

/// Proof that the server accepted one chunk.
///
/// Receipts are persisted in the resume cache, so the field names are part
/// of the on-disk format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkReceipt {
    /// Opaque continuation token returned by `mkblk`.
    pub ctx: String,
    /// Byte length of the chunk.
    pub size: u64,
    /// Content fingerprint of the chunk (empty when fingerprinting is off).
    #[serde(rename = "md5")]
    pub fingerprint: String,
    /// When the server accepted the chunk.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub time: DateTime<Utc>,
}

impl ChunkReceipt {
    /// Creates a receipt stamped with the current time.
    pub fn new(ctx: impl Into<String>, size: u64, fingerprint: impl Into<String>) -> Self {
        Self {
            ctx: ctx.into(),
            size,
            fingerprint: fingerprint.into(),
            time: Utc::now(),
        }
    }

    /// Returns `true` once the receipt is older than `ttl`.
    pub fn is_expired(&self, ttl: chrono::Duration, now: DateTime<Utc>) -> bool {
        now > self.time + ttl
    }
}

/// Extra parameters appended to the finalize URL.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PutExtra {
    /// Original file name, forwarded when non-empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fname: Option<String>,
    /// Custom parameters. Only keys carrying the `x:` prefix are forwarded.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

/// How a response status is handled by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Fail,
    Retry,
}

/// Configured success and failure status sets.
///
/// Any status in neither set is ambiguous and eligible for retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPolicy {
    pub success: Vec<u16>,
    pub fail: Vec<u16>,
}

impl Default for StatusPolicy {
    fn default() -> Self {
        Self {
            success: DEFAULT_SUCCESS_STATUS.to_vec(),
            fail: DEFAULT_FAIL_STATUS.to_vec(),
        }
    }
}

impl StatusPolicy {
    /// Classifies a response status.
    pub fn classify(&self, status: u16) -> StatusClass {
        if self.success.contains(&status) {
            StatusClass::Success
        } else if self.fail.contains(&status) {
            StatusClass::Fail
        } else {
            StatusClass::Retry
        }
    }

    /// Returns the first status present in both sets, if any.
    pub fn overlap(&self) -> Option<u16> {
        self.success.iter().copied().find(|s| self.fail.contains(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_response_only_ctx_required() {
        let resp: BlockResponse = serde_json::from_str(r#"{"ctx":"abc"}"#).unwrap();
        assert_eq!(resp.ctx, "abc");

        let full: BlockResponse = serde_json::from_str(
            r#"{"ctx":"c","checksum":"s","crc32":7,"offset":4194304,"host":"h","expired_at":1}"#,
        )
        .unwrap();
        assert_eq!(full.ctx, "c");
    }

    #[test]
    fn block_response_without_ctx_is_rejected() {
        assert!(serde_json::from_str::<BlockResponse>(r#"{"checksum":"x"}"#).is_err());
    }

    #[test]
    fn receipt_uses_storage_field_names() {
        let receipt = ChunkReceipt::new("ctx-1", 42, "d41d8cd9");
        let json = serde_json::to_value(&receipt).unwrap();
        assert_eq!(json["ctx"], "ctx-1");
        assert_eq!(json["size"], 42);
        assert_eq!(json["md5"], "d41d8cd9");
        assert!(json["time"].is_i64());

        let parsed: ChunkReceipt = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.ctx, "ctx-1");
        assert_eq!(parsed.time.timestamp_millis(), receipt.time.timestamp_millis());
    }

    #[test]
    fn receipt_expiry() {
        let mut receipt = ChunkReceipt::new("c", 1, "");
        let now = Utc::now();
        receipt.time = now - chrono::Duration::minutes(101);
        assert!(receipt.is_expired(chrono::Duration::minutes(100), now));

        receipt.time = now - chrono::Duration::minutes(99);
        assert!(!receipt.is_expired(chrono::Duration::minutes(100), now));
    }

    #[test]
    fn status_policy_classifies() {
        let policy = StatusPolicy::default();
        assert_eq!(policy.classify(200), StatusClass::Success);
        assert_eq!(policy.classify(202), StatusClass::Success);
        assert_eq!(policy.classify(404), StatusClass::Fail);
        assert_eq!(policy.classify(501), StatusClass::Fail);
        assert_eq!(policy.classify(503), StatusClass::Retry);
        assert_eq!(policy.classify(599), StatusClass::Retry);
    }

    #[test]
    fn status_policy_overlap() {
        assert_eq!(StatusPolicy::default().overlap(), None);
        let policy = StatusPolicy {
            success: vec![200, 500],
            fail: vec![500],
        };
        assert_eq!(policy.overlap(), Some(500));
    }
}
