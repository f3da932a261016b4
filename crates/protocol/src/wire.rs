//! URL and header construction for the block upload endpoints.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

use crate::constants::{AUTH_SCHEME, CUSTOM_PARAM_PREFIX, MKBLK_PATH, MKFILE_PATH};
use crate::types::PutExtra;

/// Characters escaped in a URL path component (everything except
/// alphanumerics and `-_.!~*'()`).
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Encodes `value` as padded URL-safe base64 (`+` → `-`, `/` → `_`).
pub fn urlsafe_base64(value: &str) -> String {
    URL_SAFE.encode(value.as_bytes())
}

/// Builds the `Authorization` header value for an upload token.
pub fn auth_header_value(token: &str) -> String {
    format!("{AUTH_SCHEME} {token}")
}

/// Builds `<host>/mkblk/<length>`.
pub fn block_url(host: &str, length: u64) -> String {
    format!("{}/{MKBLK_PATH}/{length}", host.trim_end_matches('/'))
}

/// Returns the custom parameters forwarded to the finalize request, in the
/// map's key order.
pub fn custom_params(extra: &PutExtra) -> impl Iterator<Item = (&str, &str)> {
    extra
        .params
        .iter()
        .filter(|(k, _)| k.starts_with(CUSTOM_PARAM_PREFIX))
        .map(|(k, v)| (k.as_str(), v.as_str()))
}

/// Builds the finalize URL.
///
/// Segments are appended in a fixed order: destination key, original file
/// name, then each `x:` custom parameter as `/<urlencoded key>/<b64 value>`.
pub fn mkfile_url(host: &str, total_size: u64, key: Option<&str>, extra: &PutExtra) -> String {
    let mut url = format!("{}/{MKFILE_PATH}/{total_size}", host.trim_end_matches('/'));

    if let Some(key) = key {
        url.push_str("/key/");
        url.push_str(&urlsafe_base64(key));
    }

    if let Some(fname) = extra.fname.as_deref().filter(|f| !f.is_empty()) {
        url.push_str("/fname/");
        url.push_str(&urlsafe_base64(fname));
    }

    for (name, value) in custom_params(extra) {
        url.push('/');
        url.extend(utf8_percent_encode(name, URI_COMPONENT));
        url.push('/');
        url.push_str(&urlsafe_base64(value));
    }

    url
}

/// Joins block tokens with commas, the finalize request body format.
pub fn join_block_tokens<'a>(tokens: impl IntoIterator<Item = &'a str>) -> String {
    tokens.into_iter().collect::<Vec<_>>().join(",")
}
