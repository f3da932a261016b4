//! Resume records for interrupted uploads.
//!
//! A record is the receipt array of the most recent attempt for a given
//! key, one slot per chunk. Records are keyed by total file size unless the
//! caller supplies a stronger key, so two different files of the same size
//! share a slot; fingerprint comparison keeps that from reusing the wrong
//! blocks, at the cost of a wasted lookup.

pub mod cache;

pub use cache::{
    CacheError, DEFAULT_RESUME_TTL, JsonFileResumeCache, MemoryResumeCache, ResumeCache,
    ResumeRecord, record_expired, size_key,
};
