use std::time::Duration;

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine as _};
use reqwest::{Client, StatusCode};
use tracing::warn;

pub fn detect_mime_type(data: &[u8]) -> Option<String> {
    if data.len() > 12 {
        let ftyp = &data[4..12];
        if ftyp.starts_with(b"ftyp") {
            let brand = &ftyp[4..8];
            if brand == b"heic" || brand == b"heif" || brand == b"hevc" {
                return Some("image/heic".to_string());
            }
        }
    }

    infer::get(data).map(|kind| kind.mime_type().to_string())
}

pub fn is_image(data: &[u8]) -> bool {
    detect_mime_type(data)
        .map(|mime| mime.starts_with("image/"))
        .unwrap_or(false)
}

pub fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/heic" => "heic",
        _ => "bin",
    }
}

pub fn to_data_uri(data: &[u8]) -> String {
    let mime_type = detect_mime_type(data).unwrap_or_else(|| "image/png".to_string());
    format!(
        "data:{};base64,{}",
        mime_type,
        general_purpose::STANDARD.encode(data)
    )
}

/// Decodes standard or URL-safe base64, tolerating line breaks and missing padding.
pub fn decode_base64(payload: &str) -> Result<Vec<u8>> {
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(anyhow!("empty base64 payload"));
    }
    general_purpose::STANDARD
        .decode(&compact)
        .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(compact.trim_end_matches('=')))
        .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(compact.trim_end_matches('=')))
        .map_err(|err| anyhow!("invalid base64 payload: {err}"))
}

/// Splits `data:<mime>;base64,<payload>` and decodes the payload.
pub fn decode_data_uri(uri: &str) -> Result<Vec<u8>> {
    let rest = uri
        .trim()
        .strip_prefix("data:")
        .ok_or_else(|| anyhow!("not a data URI"))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| anyhow!("data URI has no payload separator"))?;
    if !header.ends_with(";base64") {
        return Err(anyhow!("data URI is not base64 encoded: {header}"));
    }
    decode_base64(payload)
}

const MEDIA_DOWNLOAD_MAX_ATTEMPTS: usize = 3;
const MEDIA_DOWNLOAD_BASE_DELAY_MS: u64 = 400;
const MEDIA_DOWNLOAD_ERROR_BODY_LIMIT: usize = 800;

pub fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

fn should_retry_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn should_retry_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Fetches a file over HTTP with a short retry on transient failures.
pub async fn download_media(client: &Client, url: &str) -> Result<Vec<u8>> {
    let mut last_error = anyhow!("download not attempted");
    for attempt in 0..MEDIA_DOWNLOAD_MAX_ATTEMPTS {
        if attempt > 0 {
            let delay = Duration::from_millis(MEDIA_DOWNLOAD_BASE_DELAY_MS << (attempt - 1));
            tokio::time::sleep(delay).await;
        }

        let response = match client.get(url).send().await {
            Ok(resp) => resp,
            Err(err) => {
                let err = err.without_url();
                warn!(
                    "Failed to fetch media: {err} (timeout={}, connect={}, attempt={}/{})",
                    err.is_timeout(),
                    err.is_connect(),
                    attempt + 1,
                    MEDIA_DOWNLOAD_MAX_ATTEMPTS
                );
                let retry = should_retry_error(&err);
                last_error = anyhow!("media request failed: {err}");
                if !retry {
                    break;
                }
                continue;
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(
                "Media download failed with status {}: {}",
                status,
                truncate_for_log(&body, MEDIA_DOWNLOAD_ERROR_BODY_LIMIT)
            );
            last_error = anyhow!("media download failed with status {status}");
            if !should_retry_status(status) {
                break;
            }
            continue;
        }

        match response.bytes().await {
            Ok(bytes) => return Ok(bytes.to_vec()),
            Err(err) => {
                let err = err.without_url();
                warn!(
                    "Failed to read media bytes: {err} (attempt={}/{})",
                    attempt + 1,
                    MEDIA_DOWNLOAD_MAX_ATTEMPTS
                );
                last_error = anyhow!("failed to read media bytes: {err}");
            }
        }
    }

    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: [u8; 16] = [
        0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D, b'I', b'H', b'D', b'R',
    ];

    #[test]
    fn data_uri_round_trips_exact_bytes() {
        let uri = to_data_uri(&PNG_HEADER);
        assert!(uri.starts_with("data:image/png;base64,"));
        assert_eq!(decode_data_uri(&uri).unwrap(), PNG_HEADER.to_vec());
    }

    #[test]
    fn base64_tolerates_wrapping_and_missing_padding() {
        assert_eq!(decode_base64("aGVs\nbG8").unwrap(), b"hello".to_vec());
        assert!(decode_base64("   ").is_err());
        assert!(decode_base64("not base64 at all!").is_err());
    }

    #[test]
    fn rejects_non_base64_data_uris() {
        assert!(decode_data_uri("data:image/svg+xml,<svg/>").is_err());
        assert!(decode_data_uri("https://example.com/a.png").is_err());
    }

    #[test]
    fn sniffs_image_types() {
        assert!(is_image(&PNG_HEADER));
        assert!(!is_image(b"plain text"));
        assert_eq!(extension_for_mime("image/jpeg"), "jpg");
    }
}
