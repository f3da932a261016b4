/// Path segment of the block upload endpoint.
pub const MKBLK_PATH: &str = "mkblk";

/// Path segment of the finalize (merge) endpoint.
pub const MKFILE_PATH: &str = "mkfile";

/// Scheme prefix of the `Authorization` header value.
pub const AUTH_SCHEME: &str = "UpToken";

/// Only custom parameters whose key starts with this prefix are forwarded
/// to the finalize request.
pub const CUSTOM_PARAM_PREFIX: &str = "x:";

/// Content type of a block upload body.
pub const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";

/// Content type of a finalize body (comma-joined block tokens).
pub const CONTENT_TYPE_TEXT_PLAIN: &str = "text/plain";

/// Multipart field name carrying the file in a direct upload.
pub const DIRECT_FILE_FIELD: &str = "file";

/// Multipart field carrying the destination key in a direct upload.
pub const DIRECT_KEY_FIELD: &str = "key";

/// Multipart field carrying the upload token in a direct upload.
pub const DIRECT_TOKEN_FIELD: &str = "token";

/// Statuses treated as success unless configured otherwise.
pub const DEFAULT_SUCCESS_STATUS: [u16; 3] = [200, 201, 202];

/// Statuses treated as a permanent failure unless configured otherwise.
pub const DEFAULT_FAIL_STATUS: [u16; 4] = [404, 415, 500, 501];
