use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::Recipient;
use tracing::{debug, warn};

use crate::flow::ports::EligibilityGate;
use crate::state::AppState;

fn parse_channel(raw: &str) -> Recipient {
    let trimmed = raw.trim();
    if let Ok(id) = trimmed.parse::<i64>() {
        return Recipient::Id(ChatId(id));
    }
    if trimmed.starts_with('@') {
        Recipient::ChannelUsername(trimmed.to_string())
    } else {
        Recipient::ChannelUsername(format!("@{trimmed}"))
    }
}

/// Lets users generate only while they are members of the required channel. Lookup
/// failures deny access.
pub struct SubscriptionGate {
    bot: Bot,
    channel: Recipient,
    channel_url: Option<String>,
}

impl SubscriptionGate {
    pub fn new(bot: Bot, channel: &str, channel_url: Option<String>) -> Self {
        Self {
            bot,
            channel: parse_channel(channel),
            channel_url,
        }
    }
}

#[async_trait]
impl EligibilityGate for SubscriptionGate {
    async fn is_eligible(&self, user_id: i64) -> bool {
        let Ok(raw_id) = u64::try_from(user_id) else {
            return false;
        };
        match self
            .bot
            .get_chat_member(self.channel.clone(), UserId(raw_id))
            .await
        {
            Ok(member) => {
                let present = member.kind.is_present();
                debug!(user_id, present, "Checked channel membership");
                present
            }
            Err(err) => {
                warn!(user_id, "Channel membership check failed, denying: {err}");
                false
            }
        }
    }

    fn remediation_url(&self) -> Option<String> {
        self.channel_url.clone()
    }
}

pub fn message_user_id(message: &Message) -> Option<i64> {
    message
        .from
        .as_ref()
        .and_then(|user| i64::try_from(user.id.0).ok())
}

pub async fn check_admin_access(bot: &Bot, state: &AppState, message: &Message) -> bool {
    let allowed = message_user_id(message)
        .map(|user_id| state.config.is_admin(user_id))
        .unwrap_or(false);
    if !allowed {
        let _ = bot
            .send_message(message.chat.id, "You are not authorized to use this command.")
            .await;
    }
    allowed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_ids_and_usernames_are_recognized() {
        assert_eq!(
            parse_channel("-1001234567890"),
            Recipient::Id(ChatId(-1001234567890))
        );
        assert_eq!(
            parse_channel("@prompts"),
            Recipient::ChannelUsername("@prompts".to_string())
        );
        assert_eq!(
            parse_channel(" prompts "),
            Recipient::ChannelUsername("@prompts".to_string())
        );
    }
}
