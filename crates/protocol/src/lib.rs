//! Wire protocol for the block upload API.
//!
//! The upload host exposes two endpoints used by chunked uploads:
//!
//! - `POST <host>/mkblk/<length>` stores one block and answers with a
//!   continuation token (`ctx`).
//! - `POST <host>/mkfile/<size>/...` assembles previously stored blocks,
//!   in the order their tokens appear in the body, into the final object.
//!
//! Small files bypass both and go through a single multipart form post.

pub mod constants;
pub mod types;
pub mod wire;

pub use types::{BlockResponse, ChunkReceipt, PutExtra, StatusClass, StatusPolicy};
pub use wire::{
    auth_header_value, block_url, custom_params, join_block_tokens, mkfile_url, urlsafe_base64,
};
