use anyhow::Result;
use reqwest::Client;
use teloxide::prelude::*;
use teloxide::types::FileId;

use crate::llm::media::download_media;

pub const SOURCE_TOO_LARGE_TEXT: &str =
    "That image is too large. Please send a smaller photo.";
pub const SOURCE_DOWNLOAD_FAILED_TEXT: &str =
    "I couldn't download that photo. Please try sending it again.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub file_id: FileId,
    pub size: u32,
}

#[derive(Debug)]
pub enum SourceDownload {
    TooLarge { size: usize },
    Downloaded(Vec<u8>),
}

fn is_image_mime(mime: Option<&str>) -> bool {
    mime.map(|value| value.starts_with("image/"))
        .unwrap_or(false)
}

/// The largest size of a photo, or a document sent with an image MIME type.
pub fn find_source_file(message: &Message) -> Option<SourceFile> {
    if let Some(photo) = message.photo().and_then(|sizes| sizes.last()) {
        return Some(SourceFile {
            file_id: photo.file.id.clone(),
            size: photo.file.size,
        });
    }
    let document = message.document()?;
    let mime = document.mime_type.as_ref().map(|mime| mime.essence_str());
    if !is_image_mime(mime) {
        return None;
    }
    Some(SourceFile {
        file_id: document.file.id.clone(),
        size: document.file.size,
    })
}

pub async fn get_file_url(bot: &Bot, bot_token: &str, file_id: &FileId) -> Result<String> {
    let file = bot.get_file(file_id.clone()).await?;
    Ok(format!(
        "https://api.telegram.org/file/bot{}/{}",
        bot_token, file.path
    ))
}

pub async fn download_source_image(
    bot: &Bot,
    http: &Client,
    bot_token: &str,
    source: &SourceFile,
    max_bytes: usize,
) -> Result<SourceDownload> {
    if source.size as usize > max_bytes {
        return Ok(SourceDownload::TooLarge {
            size: source.size as usize,
        });
    }
    let url = get_file_url(bot, bot_token, &source.file_id).await?;
    let bytes = download_media(http, &url).await?;
    if bytes.len() > max_bytes {
        return Ok(SourceDownload::TooLarge { size: bytes.len() });
    }
    Ok(SourceDownload::Downloaded(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_image_documents_count_as_sources() {
        assert!(is_image_mime(Some("image/png")));
        assert!(is_image_mime(Some("image/webp")));
        assert!(!is_image_mime(Some("application/pdf")));
        assert!(!is_image_mime(None));
    }
}
