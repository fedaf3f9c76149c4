use std::future::Future;
use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::ChatAction;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Telegram clears a chat action after about five seconds.
const ACTIVITY_REFRESH_INTERVAL: Duration = Duration::from_secs(4);
const MAX_CONSECUTIVE_ACTION_FAILURES: u32 = 3;

/// A background indicator that runs until dropped.
pub struct ActivityHandle {
    task: Option<JoinHandle<()>>,
}

impl ActivityHandle {
    /// No indicator at all.
    pub fn idle() -> Self {
        Self { task: None }
    }

    pub fn spawn<F>(indicator: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            task: Some(tokio::spawn(indicator)),
        }
    }
}

impl Drop for ActivityHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Shows "sending photo..." in the chat while a generation runs. Gives up after a few
/// failures in a row, e.g. when the user has blocked the bot.
pub fn show_upload_photo(bot: Bot, chat_id: ChatId) -> ActivityHandle {
    ActivityHandle::spawn(async move {
        let mut ticker = tokio::time::interval(ACTIVITY_REFRESH_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0;
        loop {
            ticker.tick().await;
            match bot.send_chat_action(chat_id, ChatAction::UploadPhoto).await {
                Ok(_) => failures = 0,
                Err(err) => {
                    failures += 1;
                    warn!(chat_id = chat_id.0, failures, "send_chat_action failed: {err}");
                    if failures >= MAX_CONSECUTIVE_ACTION_FAILURES {
                        debug!(chat_id = chat_id.0, "Stopping upload indicator");
                        return;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropping_the_handle_stops_the_indicator() {
        let (alive_tx, mut alive_rx) = tokio::sync::mpsc::channel::<()>(1);
        let handle = ActivityHandle::spawn(async move {
            let _alive = alive_tx;
            std::future::pending::<()>().await;
        });
        drop(handle);
        assert!(alive_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn idle_handle_owns_no_task() {
        let handle = ActivityHandle::idle();
        assert!(handle.task.is_none());
    }
}
