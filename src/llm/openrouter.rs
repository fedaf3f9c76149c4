use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::llm::media::{
    decode_base64, decode_data_uri, detect_mime_type, download_media, is_image, to_data_uri,
    truncate_for_log,
};
use crate::llm::{GenerationFailure, GenerationRequest, GenerationResult, ImageGenerator};
use crate::utils::timing::log_llm_timing;

const ERROR_BODY_LOG_LIMIT: usize = 2000;
const MIN_BARE_BASE64_LEN: usize = 64;

static DATA_URI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"data:image/[A-Za-z0-9.+-]+;base64,[A-Za-z0-9+/=_-]+").expect("valid data URI regex")
});
static BARE_BASE64_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9+/=_\-\s]+$").expect("valid base64 regex"));

/// Where the image bytes of a provider response can be found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ImageSource {
    DataUri(String),
    Base64(String),
    Url(String),
}

fn summarize_payload(payload: &Value) -> String {
    let model = payload
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    let parts = payload
        .pointer("/messages/0/content")
        .and_then(|v| v.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("type").and_then(|v| v.as_str()))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let aspect = payload
        .pointer("/image_config/aspect_ratio")
        .and_then(|v| v.as_str())
        .unwrap_or("original");

    format!(
        "model={}, parts=[{}], aspect_ratio={}",
        model,
        parts.join(","),
        aspect
    )
}

fn summarize_error_body(body: &str) -> (Option<String>, String) {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return (None, "empty response body".to_string());
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        let message = value
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
            .or_else(|| {
                value
                    .get("message")
                    .and_then(|v| v.as_str())
                    .map(|v| v.to_string())
            });
        return (message, truncate_for_log(&value.to_string(), ERROR_BODY_LOG_LIMIT));
    }

    (None, truncate_for_log(trimmed, ERROR_BODY_LOG_LIMIT))
}

/// Chat-style payload; the source image (if any) goes before the text part.
pub(crate) fn build_payload(request: &GenerationRequest) -> Value {
    let mut content = Vec::new();
    if let Some(image) = &request.source_image {
        content.push(json!({
            "type": "image_url",
            "image_url": { "url": to_data_uri(image) }
        }));
    }
    content.push(json!({
        "type": "text",
        "text": request.prompt
    }));

    let mut payload = json!({
        "model": request.model,
        "modalities": ["image", "text"],
        "messages": [{ "role": "user", "content": content }],
    });
    if let Some(aspect_ratio) = request.format.aspect_ratio() {
        payload["image_config"] = json!({ "aspect_ratio": aspect_ratio });
    }
    payload
}

fn classify_reference(reference: &str) -> Option<ImageSource> {
    let reference = reference.trim();
    if reference.starts_with("data:") {
        return Some(ImageSource::DataUri(reference.to_string()));
    }
    if reference.starts_with("https://") || reference.starts_with("http://") {
        return Some(ImageSource::Url(reference.to_string()));
    }
    None
}

fn from_image_objects(message: &Value) -> Option<ImageSource> {
    let images = message.get("images")?.as_array()?;
    images.iter().find_map(|image| {
        let reference = image
            .pointer("/image_url/url")
            .or_else(|| image.get("image_url"))
            .or_else(|| image.get("url"))
            .and_then(|v| v.as_str())?;
        classify_reference(reference)
    })
}

fn from_text_content(message: &Value) -> Option<ImageSource> {
    let content = message.get("content")?.as_str()?.trim();
    if let Some(found) = DATA_URI_RE.find(content) {
        return Some(ImageSource::DataUri(found.as_str().to_string()));
    }
    if content.len() >= MIN_BARE_BASE64_LEN && BARE_BASE64_RE.is_match(content) {
        return Some(ImageSource::Base64(content.to_string()));
    }
    None
}

fn from_part(part: &Value) -> Option<ImageSource> {
    let part_type = part.get("type").and_then(|v| v.as_str()).unwrap_or("");
    if !part_type.contains("image") {
        return None;
    }

    let inline = part
        .get("b64_json")
        .or_else(|| part.get("image_base64"))
        .or_else(|| part.get("data"))
        .or_else(|| part.pointer("/inline_data/data"))
        .or_else(|| part.pointer("/inlineData/data"))
        .and_then(|v| v.as_str());
    if let Some(data) = inline {
        return classify_reference(data).or_else(|| Some(ImageSource::Base64(data.to_string())));
    }

    part.pointer("/image_url/url")
        .or_else(|| part.get("image_url"))
        .or_else(|| part.get("url"))
        .and_then(|v| v.as_str())
        .and_then(classify_reference)
}

fn from_output_parts(response: &Value, message: Option<&Value>) -> Option<ImageSource> {
    let message_parts = message
        .and_then(|message| message.get("content"))
        .and_then(|v| v.as_array());
    if let Some(source) = message_parts.and_then(|parts| parts.iter().find_map(from_part)) {
        return Some(source);
    }

    let output = response.get("output")?.as_array()?;
    output.iter().find_map(|item| {
        from_part(item).or_else(|| {
            item.get("content")
                .and_then(|v| v.as_array())
                .and_then(|parts| parts.iter().find_map(from_part))
        })
    })
}

/// Finds the image in a provider response. Image objects on the message are checked
/// first, then base64 text content, then typed output parts.
pub(crate) fn locate_image(response: &Value) -> Result<ImageSource, GenerationFailure> {
    if let Some(error) = response.get("error").filter(|v| !v.is_null()) {
        let status = error
            .get("code")
            .and_then(|v| v.as_u64())
            .and_then(|code| u16::try_from(code).ok())
            .unwrap_or(200);
        let detail = error
            .get("message")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
            .unwrap_or_else(|| truncate_for_log(&error.to_string(), ERROR_BODY_LOG_LIMIT));
        return Err(GenerationFailure::Provider { status, detail });
    }

    let message = response.pointer("/choices/0/message");
    message
        .and_then(from_image_objects)
        .or_else(|| message.and_then(from_text_content))
        .or_else(|| from_output_parts(response, message))
        .ok_or_else(|| {
            GenerationFailure::Parse(truncate_for_log(&response.to_string(), ERROR_BODY_LOG_LIMIT))
        })
}

pub(crate) async fn fetch_image(
    client: &Client,
    source: ImageSource,
) -> Result<Vec<u8>, GenerationFailure> {
    let bytes = match source {
        ImageSource::DataUri(uri) => {
            decode_data_uri(&uri).map_err(|err| GenerationFailure::Decode(err.to_string()))?
        }
        ImageSource::Base64(payload) => {
            decode_base64(&payload).map_err(|err| GenerationFailure::Decode(err.to_string()))?
        }
        ImageSource::Url(url) => {
            debug!("Downloading generated image from provider URL");
            download_media(client, &url)
                .await
                .map_err(|err| GenerationFailure::Transport(err.to_string()))?
        }
    };

    if bytes.is_empty() {
        return Err(GenerationFailure::Decode("image payload is empty".to_string()));
    }
    if !is_image(&bytes) {
        let sniffed = detect_mime_type(&bytes).unwrap_or_else(|| "unknown".to_string());
        return Err(GenerationFailure::Decode(format!(
            "payload is not an image (detected {sniffed}, {} bytes)",
            bytes.len()
        )));
    }
    Ok(bytes)
}

#[derive(Clone)]
pub struct OpenRouterImageClient {
    http: Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl OpenRouterImageClient {
    pub fn new(http: Client, base_url: &str, api_key: &str, timeout: Duration) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            timeout,
        }
    }

    async fn call_api(&self, payload: &Value) -> Result<Value, GenerationFailure> {
        debug!("OpenRouter image request: {}", summarize_payload(payload));

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("X-Title", "Image Studio Bot")
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await
            .map_err(|err| {
                warn!(
                    "OpenRouter request failed to send: {err} (timeout={}, connect={})",
                    err.is_timeout(),
                    err.is_connect()
                );
                GenerationFailure::Transport(err.to_string())
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| GenerationFailure::Transport(err.to_string()))?;

        if !status.is_success() {
            let (message, body_summary) = summarize_error_body(&body);
            warn!(
                "OpenRouter API error: status={}, body={}",
                status, body_summary
            );
            return Err(GenerationFailure::Provider {
                status: status.as_u16(),
                detail: message.unwrap_or(body_summary),
            });
        }

        serde_json::from_str::<Value>(&body).map_err(|err| {
            GenerationFailure::Parse(format!(
                "invalid JSON ({err}): {}",
                truncate_for_log(&body, ERROR_BODY_LOG_LIMIT)
            ))
        })
    }

    async fn generate_image(&self, request: &GenerationRequest) -> Result<Vec<u8>, GenerationFailure> {
        if request.prompt.trim().is_empty() {
            return Err(GenerationFailure::Parse("prompt is empty".to_string()));
        }
        let payload = build_payload(request);
        let response = self.call_api(&payload).await?;
        let source = locate_image(&response)?;
        fetch_image(&self.http, source).await
    }
}

#[async_trait]
impl ImageGenerator for OpenRouterImageClient {
    async fn generate(&self, request: &GenerationRequest) -> GenerationResult {
        let operation = if request.source_image.is_some() {
            "openrouter:image_edit"
        } else {
            "openrouter:image_generate"
        };
        let metadata = json!({ "format": request.format.tag() });

        let outcome = log_llm_timing(
            "openrouter",
            &request.model,
            operation,
            Some(metadata),
            || async {
                match tokio::time::timeout(self.timeout, self.generate_image(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(GenerationFailure::Transport(format!(
                        "generation timed out after {}s",
                        self.timeout.as_secs()
                    ))),
                }
            },
        )
        .await;

        if let Err(failure) = &outcome {
            warn!(
                model = %request.model,
                kind = failure.kind(),
                "Image generation failed: {failure}"
            );
        }
        GenerationResult::from(outcome)
    }
}
