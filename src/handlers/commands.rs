use anyhow::{anyhow, Result};
use teloxide::prelude::*;
use teloxide::types::ReplyParameters;
use tracing::info;

use crate::flow::ports::AccountStore;
use crate::flow::screens;
use crate::handlers::access::{check_admin_access, message_user_id};
use crate::handlers::keyboards::menu_to_keyboard;
use crate::state::AppState;
use crate::utils::logging::{read_recent_log_lines, LogStream};

const LOG_TAIL_DEFAULT_LINES: usize = 30;
const LOG_TAIL_MAX_LINES: usize = 200;
const ADMIN_TEXT_LIMIT: usize = 3900;

const HELP_TEXT: &str = "Image Studio Bot

Tap \"Generate an image\" in the main menu, pick a model, a mode and a format, then send your prompt (and a photo for photo + text mode).

/start - Open the main menu
/balance - Show your balance, current model and prices
/help - Show this help message";

const ADMIN_HELP_TEXT: &str = "

Admin commands:
/stats - Usage statistics
/credit <user_id> <amount> - Add credits to an account
/setbalance <user_id> <amount> - Overwrite an account balance
/logs [bot|timing|generations] [lines] - Show the tail of a log stream";

fn parse_user_amount(arg: &str) -> Result<(i64, i64)> {
    let mut parts = arg.split_whitespace();
    let user_id = parts
        .next()
        .ok_or_else(|| anyhow!("missing user id"))?
        .parse::<i64>()
        .map_err(|_| anyhow!("user id must be a number"))?;
    let amount = parts
        .next()
        .ok_or_else(|| anyhow!("missing amount"))?
        .parse::<i64>()
        .map_err(|_| anyhow!("amount must be a number"))?;
    if parts.next().is_some() {
        return Err(anyhow!("too many arguments"));
    }
    Ok((user_id, amount))
}

/// `/logs` arguments: an optional stream name and an optional line count, in any order.
fn parse_log_request(arg: &str) -> (LogStream, usize) {
    let mut stream = LogStream::Bot;
    let mut lines = LOG_TAIL_DEFAULT_LINES;
    for token in arg.split_whitespace() {
        if let Ok(count) = token.parse::<usize>() {
            lines = count;
        } else if let Some(parsed) = LogStream::parse(token) {
            stream = parsed;
        }
    }
    (stream, lines.clamp(1, LOG_TAIL_MAX_LINES))
}

fn redact_sensitive_text(text: &str, secrets: &[&str]) -> String {
    let mut redacted = text.to_string();
    for secret in secrets {
        let secret = secret.trim();
        if !secret.is_empty() {
            redacted = redacted.replace(secret, "[REDACTED]");
        }
    }
    redacted
}

/// Keeps the last `max_chars` characters, which hold the newest log lines.
fn keep_tail_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

async fn reply(bot: &Bot, message: &Message, text: impl Into<String>) -> Result<()> {
    bot.send_message(message.chat.id, text.into())
        .reply_parameters(ReplyParameters::new(message.id))
        .await?;
    Ok(())
}

pub async fn help_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let mut text = HELP_TEXT.to_string();
    if message_user_id(&message).is_some_and(|user_id| state.config.is_admin(user_id)) {
        text.push_str(ADMIN_HELP_TEXT);
    }
    reply(&bot, &message, text).await
}

pub async fn balance_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let Some(user_id) = message_user_id(&message) else {
        return Ok(());
    };
    let account = state.db.create_if_absent(user_id).await?;
    let menu = screens::main_menu(state.config.prompts_channel_url.as_deref());
    bot.send_message(
        message.chat.id,
        screens::balance_text(&account, state.flow.catalog()),
    )
    .reply_markup(menu_to_keyboard(&menu))
    .await?;
    Ok(())
}

pub async fn stats_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    if !check_admin_access(&bot, &state, &message).await {
        return Ok(());
    }
    let db_status = match state.db.health_check().await {
        Ok(()) => "ok".to_string(),
        Err(err) => format!("error ({err})"),
    };
    let stats = state.db.stats().await?;
    let report = format!(
        "📊 Stats\n\nUsers: {}\nCredits held: {}\nGenerations: {} ({} today)\nCredits spent: {}\nDatabase: {}",
        stats.users,
        stats.total_balance,
        stats.generations,
        stats.generations_today,
        stats.credits_spent,
        db_status
    );
    reply(&bot, &message, report).await
}

pub async fn credit_handler(bot: Bot, state: AppState, message: Message, arg: String) -> Result<()> {
    if !check_admin_access(&bot, &state, &message).await {
        return Ok(());
    }
    let (user_id, amount) = match parse_user_amount(&arg) {
        Ok(parsed) if parsed.1 > 0 => parsed,
        Ok(_) => return reply(&bot, &message, "Amount must be positive.").await,
        Err(err) => {
            return reply(
                &bot,
                &message,
                format!("Usage: /credit <user_id> <amount> ({err})"),
            )
            .await
        }
    };

    if !state.db.credit(user_id, amount).await? {
        return reply(&bot, &message, format!("No account for user {user_id}.")).await;
    }
    info!(
        admin = message_user_id(&message),
        user_id, amount, "Admin credited account"
    );
    let balance = state
        .db
        .get(user_id)
        .await?
        .map(|account| account.balance)
        .unwrap_or_default();
    reply(
        &bot,
        &message,
        format!("Credited {amount} to {user_id}. New balance: {balance}."),
    )
    .await
}

pub async fn setbalance_handler(
    bot: Bot,
    state: AppState,
    message: Message,
    arg: String,
) -> Result<()> {
    if !check_admin_access(&bot, &state, &message).await {
        return Ok(());
    }
    let (user_id, balance) = match parse_user_amount(&arg) {
        Ok(parsed) if parsed.1 >= 0 => parsed,
        Ok(_) => return reply(&bot, &message, "Balance cannot be negative.").await,
        Err(err) => {
            return reply(
                &bot,
                &message,
                format!("Usage: /setbalance <user_id> <amount> ({err})"),
            )
            .await
        }
    };

    if !state.db.set_balance(user_id, balance).await? {
        return reply(&bot, &message, format!("No account for user {user_id}.")).await;
    }
    info!(
        admin = message_user_id(&message),
        user_id, balance, "Admin set account balance"
    );
    reply(
        &bot,
        &message,
        format!("Balance of {user_id} set to {balance}."),
    )
    .await
}

pub async fn logs_handler(bot: Bot, state: AppState, message: Message, arg: String) -> Result<()> {
    if !check_admin_access(&bot, &state, &message).await {
        return Ok(());
    }
    let (stream, max_lines) = parse_log_request(&arg);
    let report = match read_recent_log_lines(stream, max_lines) {
        Ok(Some(tail)) if !tail.lines.is_empty() => {
            let body = redact_sensitive_text(
                &tail.lines.join("\n"),
                &[
                    state.config.bot_token.as_str(),
                    state.config.openrouter_api_key.as_str(),
                ],
            );
            format!(
                "source: {}\n{}",
                tail.path.display(),
                keep_tail_chars(&body, ADMIN_TEXT_LIMIT)
            )
        }
        Ok(_) => format!("No {} log files found.", stream.name()),
        Err(err) => format!("Failed to read log tail: {err}"),
    };
    reply(&bot, &message, report).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_user_and_amount() {
        assert_eq!(parse_user_amount("42 100").unwrap(), (42, 100));
        assert_eq!(parse_user_amount("  7   -3 ").unwrap(), (7, -3));
        assert!(parse_user_amount("42").is_err());
        assert!(parse_user_amount("abc 10").is_err());
        assert!(parse_user_amount("1 2 3").is_err());
    }

    #[test]
    fn log_request_picks_stream_and_clamps_lines() {
        assert_eq!(parse_log_request(""), (LogStream::Bot, LOG_TAIL_DEFAULT_LINES));
        assert_eq!(parse_log_request("0"), (LogStream::Bot, 1));
        assert_eq!(parse_log_request("5000"), (LogStream::Bot, LOG_TAIL_MAX_LINES));
        assert_eq!(parse_log_request("timing 12"), (LogStream::Timing, 12));
        assert_eq!(parse_log_request("40 generations"), (LogStream::Generations, 40));
        assert_eq!(parse_log_request("nonsense"), (LogStream::Bot, LOG_TAIL_DEFAULT_LINES));
    }

    #[test]
    fn secrets_are_redacted() {
        let text = "calling https://api.telegram.org/bot123:abc/getMe with key sk-or-1";
        let redacted = redact_sensitive_text(text, &["123:abc", "sk-or-1", " "]);
        assert_eq!(
            redacted,
            "calling https://api.telegram.org/bot[REDACTED]/getMe with key [REDACTED]"
        );
    }

    #[test]
    fn log_tail_keeps_newest_text() {
        assert_eq!(keep_tail_chars("abcdef", 3), "def");
        assert_eq!(keep_tail_chars("ab", 3), "ab");
    }
}
