//! Resumable chunked upload sessions.
//!
//! A session splits a file into fixed-size chunks, reads a bounded window
//! of them ahead, uploads them through a bounded worker pool and merges the
//! stored blocks into the final object. Small files skip all of that and go
//! out in one multipart post.
//!
//! Completed blocks are remembered in a [`ResumeCache`](blockput_resume::ResumeCache)
//! so a later attempt only sends what the server does not already hold.

pub mod config;
mod controller;
pub mod error;
mod requests;
mod retry;
mod session;
mod store;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::UploaderConfig;
pub use error::{ErrorCode, FailureInfo, RequestError, UploadError, UploadFailure};
pub use session::{Collaborators, UploadSession};
pub use transport::{
    FileUpload, HttpRequest, HttpResponse, ReqwestTransport, Transport, TransportError,
};
pub use types::{
    Completion, RetryInfo, SessionSnapshot, SessionState, UploadEvent, UploadOutcome,
};
