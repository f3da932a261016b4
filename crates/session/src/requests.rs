//! Builders for the three request kinds a session sends.

use blockput_protocol::{auth_header_value, block_url, constants, join_block_tokens, mkfile_url};

use crate::config::UploaderConfig;
use crate::transport::{FileUpload, HttpRequest};

fn headers(token: &str, content_type: &str) -> Vec<(String, String)> {
    vec![
        ("Authorization".into(), auth_header_value(token)),
        ("Content-Type".into(), content_type.into()),
    ]
}

/// `mkblk` request storing one chunk.
pub(crate) fn block_request(config: &UploaderConfig, data: Vec<u8>) -> HttpRequest {
    HttpRequest {
        url: block_url(&config.upload_host, data.len() as u64),
        headers: headers(&config.token, constants::CONTENT_TYPE_OCTET_STREAM),
        body: data,
        timeout: config.timeout(),
    }
}

/// `mkfile` request assembling blocks, tokens in index order.
pub(crate) fn merge_request<'a>(
    config: &UploaderConfig,
    tokens: impl IntoIterator<Item = &'a str>,
) -> HttpRequest {
    HttpRequest {
        url: mkfile_url(
            &config.upload_host,
            config.total_size,
            config.key.as_deref(),
            &config.put_extra,
        ),
        headers: headers(&config.token, constants::CONTENT_TYPE_TEXT_PLAIN),
        body: join_block_tokens(tokens).into_bytes(),
        timeout: config.timeout(),
    }
}

/// Whole-file multipart post to the upload host.
pub(crate) fn direct_upload(config: &UploaderConfig) -> FileUpload {
    let mut form = Vec::with_capacity(2);
    if let Some(key) = &config.key {
        form.push((constants::DIRECT_KEY_FIELD.to_string(), key.clone()));
    }
    form.push((constants::DIRECT_TOKEN_FIELD.to_string(), config.token.clone()));

    FileUpload {
        url: config.upload_host.clone(),
        file_path: config.file_path.clone(),
        file_field: constants::DIRECT_FILE_FIELD.to_string(),
        form,
        timeout: config.timeout(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> UploaderConfig {
        let mut config = UploaderConfig::new("/data/a.bin", 10, "https://up.example.com", "tok");
        config.key = Some("a.bin".into());
        config
    }

    #[test]
    fn block_request_targets_mkblk_with_length() {
        let req = block_request(&config(), b"AAAA".to_vec());
        assert_eq!(req.url, "https://up.example.com/mkblk/4");
        assert!(
            req.headers
                .contains(&("Authorization".into(), "UpToken tok".into()))
        );
        assert!(
            req.headers
                .contains(&("Content-Type".into(), "application/octet-stream".into()))
        );
        assert_eq!(req.body, b"AAAA");
    }

    #[test]
    fn merge_request_joins_tokens_in_given_order() {
        let req = merge_request(&config(), ["c0", "c1", "c2"]);
        assert!(req.url.starts_with("https://up.example.com/mkfile/10/key/"));
        assert_eq!(req.body, b"c0,c1,c2");
        assert!(
            req.headers
                .contains(&("Content-Type".into(), "text/plain".into()))
        );
    }

    #[test]
    fn direct_upload_form_fields() {
        let upload = direct_upload(&config());
        assert_eq!(upload.url, "https://up.example.com");
        assert_eq!(upload.file_field, "file");
        assert_eq!(
            upload.form,
            vec![
                ("key".to_string(), "a.bin".to_string()),
                ("token".to_string(), "tok".to_string()),
            ]
        );
    }

    #[test]
    fn direct_upload_without_key_sends_token_only() {
        let mut config = config();
        config.key = None;
        let upload = direct_upload(&config);
        assert_eq!(upload.form, vec![("token".to_string(), "tok".to_string())]);
    }
}
