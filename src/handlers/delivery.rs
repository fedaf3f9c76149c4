use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::InputFile;
use teloxide::RequestError;
use tracing::{debug, warn};

use crate::flow::ports::DeliveryChannel;
use crate::flow::screens::Menu;
use crate::handlers::keyboards::menu_to_keyboard;
use crate::utils::imaging::{DeliveryMode, PreparedImage};
use crate::utils::telegram::{show_upload_photo, ActivityHandle};

const TELEGRAM_RETRY_ATTEMPTS: usize = 3;

fn telegram_retryable_error(err: &RequestError) -> bool {
    matches!(
        err,
        RequestError::Network(_) | RequestError::RetryAfter(_) | RequestError::Io(_)
    )
}

async fn with_retry<T, F, Fut>(operation: &str, mut send: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RequestError>>,
{
    let mut delay = Duration::from_secs_f32(1.5);
    let mut attempt = 0;
    loop {
        match send().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if !telegram_retryable_error(&err) || attempt == TELEGRAM_RETRY_ATTEMPTS {
                    return Err(err.into());
                }
                warn!("{operation} attempt {attempt} failed: {err}");
                if let RequestError::RetryAfter(wait) = err {
                    tokio::time::sleep(wait.duration()).await;
                } else {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
}

/// Delivery channel over the Bot API. The user id doubles as the private chat id.
#[derive(Clone)]
pub struct TelegramDelivery {
    bot: Bot,
}

impl TelegramDelivery {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl DeliveryChannel for TelegramDelivery {
    async fn send_text(&self, user_id: i64, text: &str, menu: Option<&Menu>) -> Result<()> {
        let chat_id = ChatId(user_id);
        let keyboard = menu.map(menu_to_keyboard);
        with_retry("send_message", || {
            let mut request = self.bot.send_message(chat_id, text.to_string());
            if let Some(keyboard) = &keyboard {
                request = request.reply_markup(keyboard.clone());
            }
            async move { request.await }
        })
        .await?;
        Ok(())
    }

    async fn send_image(
        &self,
        user_id: i64,
        image: &PreparedImage,
        caption: &str,
        menu: Option<&Menu>,
    ) -> Result<()> {
        let chat_id = ChatId(user_id);
        let keyboard = menu.map(menu_to_keyboard);
        debug!(
            user_id,
            size = image.bytes.len(),
            mode = ?image.mode,
            quality = ?image.quality,
            "Sending generated image"
        );
        match image.mode {
            DeliveryMode::InlinePhoto => {
                with_retry("send_photo", || {
                    let input = InputFile::memory(image.bytes.clone())
                        .file_name(image.file_name.clone());
                    let mut request = self
                        .bot
                        .send_photo(chat_id, input)
                        .caption(caption.to_string());
                    if let Some(keyboard) = &keyboard {
                        request = request.reply_markup(keyboard.clone());
                    }
                    async move { request.await }
                })
                .await?;
            }
            DeliveryMode::Attachment => {
                with_retry("send_document", || {
                    let input = InputFile::memory(image.bytes.clone())
                        .file_name(image.file_name.clone());
                    let mut request = self
                        .bot
                        .send_document(chat_id, input)
                        .caption(caption.to_string());
                    if let Some(keyboard) = &keyboard {
                        request = request.reply_markup(keyboard.clone());
                    }
                    async move { request.await }
                })
                .await?;
            }
        }
        Ok(())
    }

    fn start_activity(&self, user_id: i64) -> ActivityHandle {
        show_upload_photo(self.bot.clone(), ChatId(user_id))
    }
}
