use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use dotenvy::dotenv;
use teloxide::dispatching::UpdateFilterExt;
use teloxide::prelude::*;
use teloxide::update_listeners::webhooks;
use teloxide::utils::command::BotCommands;
use tracing::{debug, error, info, warn};

mod config;
mod db;
mod flow;
mod handlers;
mod llm;
mod state;
mod utils;

use config::{log_level_from_env, Config};
use db::database::Database;
use flow::controller::{FlowController, FlowDeps, FlowEvent, FlowSettings};
use flow::intent::Intent;
use flow::ports::{EligibilityGate, OpenGate};
use flow::session::InMemorySessionStore;
use handlers::access::{message_user_id, SubscriptionGate};
use handlers::commands;
use handlers::delivery::TelegramDelivery;
use handlers::media::{
    download_source_image, find_source_file, SourceDownload, SOURCE_DOWNLOAD_FAILED_TEXT,
    SOURCE_TOO_LARGE_TEXT,
};
use llm::OpenRouterImageClient;
use state::AppState;
use utils::http::build_http_client;
use utils::logging::init_logging;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
enum Command {
    Start,
    Help,
    Balance,
    Stats,
    Credit(String),
    Setbalance(String),
    Logs(String),
}

type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

#[tokio::main]
async fn main() -> HandlerResult {
    dotenv().ok();
    let _guards = init_logging(&log_level_from_env());

    let config = Arc::new(Config::load()?);
    info!("Starting image_studio_bot");

    let bot = Bot::new(config.bot_token.clone());
    let db = Database::init(&config.database_url, config.starting_balance).await?;
    let http = build_http_client(config.generation_timeout)?;

    let catalog = config.model_catalog();
    info!(
        models = catalog.models().len(),
        default = %catalog.default_model().key,
        source = %config.image_models_config_path.display(),
        "Model catalog ready"
    );

    let gate: Arc<dyn EligibilityGate> = match &config.required_channel {
        Some(channel) => {
            info!("Generation requires membership in {}", channel);
            Arc::new(SubscriptionGate::new(
                bot.clone(),
                channel,
                config.required_channel_url.clone(),
            ))
        }
        None => Arc::new(OpenGate),
    };

    if config.openrouter_api_key.trim().is_empty() {
        warn!("OPENROUTER_API_KEY is empty; generation requests will fail");
    }
    let generator = OpenRouterImageClient::new(
        http.clone(),
        &config.openrouter_base_url,
        &config.openrouter_api_key,
        config.generation_timeout,
    );

    let flow = FlowController::new(
        FlowDeps {
            accounts: Arc::new(db.clone()),
            sessions: Arc::new(InMemorySessionStore::with_idle_ttl(config.session_idle_ttl)),
            gate,
            generator: Arc::new(generator),
            delivery: Arc::new(TelegramDelivery::new(bot.clone())),
        },
        FlowSettings {
            catalog,
            encoding: config.encoding_policy(),
            prompts_channel_url: config.prompts_channel_url.clone(),
        },
    );
    let state = AppState::new(config.clone(), db, http, flow);

    let command_handler = dptree::entry()
        .filter_command::<Command>()
        .endpoint(handle_command);

    let message_handler = Update::filter_message()
        .branch(dptree::filter(|msg: Message| !msg.chat.is_private()).endpoint(ignore_message))
        .branch(command_handler)
        .endpoint(handle_message);

    let callback_handler = Update::filter_callback_query().endpoint(handle_callback_query);

    let handler = dptree::entry()
        .branch(message_handler)
        .branch(callback_handler);

    let mut dispatcher = Dispatcher::builder(bot.clone(), handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build();

    match &config.webhook_url {
        Some(webhook_url) => {
            let url = url::Url::parse(webhook_url)?;
            let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
            info!("Receiving updates through webhook on {}", addr);
            let listener = webhooks::axum(bot, webhooks::Options::new(addr, url)).await?;
            dispatcher
                .dispatch_with_listener(
                    listener,
                    LoggingErrorHandler::with_custom_text("An error from the update listener"),
                )
                .await;
        }
        None => {
            info!("Receiving updates through long polling");
            dispatcher.dispatch().await;
        }
    }

    Ok(())
}

/// Feeds one event to the controller and spawns the generation it may start.
async fn run_flow(state: &AppState, user_id: i64, event: FlowEvent) {
    match state.flow.handle(user_id, event).await {
        Ok(Some(job)) => {
            debug!(user_id = job.user_id(), "Spawning generation job");
            tokio::spawn(job.run());
        }
        Ok(None) => {}
        Err(err) => debug!(user_id, "Flow event ended with error: {err}"),
    }
}

async fn handle_command(
    bot: Bot,
    state: AppState,
    message: Message,
    command: Command,
) -> HandlerResult {
    match command {
        Command::Start => {
            if let Some(user_id) = message_user_id(&message) {
                run_flow(&state, user_id, FlowEvent::Start).await;
            }
        }
        Command::Help => commands::help_handler(bot, state, message).await?,
        Command::Balance => commands::balance_handler(bot, state, message).await?,
        Command::Stats => commands::stats_handler(bot, state, message).await?,
        Command::Credit(arg) => commands::credit_handler(bot, state, message, arg).await?,
        Command::Setbalance(arg) => {
            commands::setbalance_handler(bot, state, message, arg).await?
        }
        Command::Logs(arg) => commands::logs_handler(bot, state, message, arg).await?,
    }
    Ok(())
}

async fn handle_message(bot: Bot, state: AppState, message: Message) -> HandlerResult {
    let Some(user_id) = message_user_id(&message) else {
        return Ok(());
    };

    let event = if let Some(source) = find_source_file(&message) {
        if !state.flow.wants_photo(user_id) {
            debug!(user_id, size = source.size, "Photo not expected here; skipping download");
            run_flow(&state, user_id, FlowEvent::Unsupported).await;
            return Ok(());
        }
        match download_source_image(
            &bot,
            &state.http,
            &state.config.bot_token,
            &source,
            state.config.source_image_max_bytes,
        )
        .await
        {
            Ok(SourceDownload::Downloaded(bytes)) => FlowEvent::Photo {
                bytes,
                caption: message.caption().map(str::to_string),
            },
            Ok(SourceDownload::TooLarge { size }) => {
                info!(user_id, size, "Source image exceeds the size limit");
                bot.send_message(message.chat.id, SOURCE_TOO_LARGE_TEXT)
                    .await?;
                return Ok(());
            }
            Err(err) => {
                error!(user_id, "Failed to download source image: {err:#}");
                bot.send_message(message.chat.id, SOURCE_DOWNLOAD_FAILED_TEXT)
                    .await?;
                return Ok(());
            }
        }
    } else {
        match message.text() {
            Some(text) if !text.trim_start().starts_with('/') => FlowEvent::Text(text.to_string()),
            _ => FlowEvent::Unsupported,
        }
    };

    run_flow(&state, user_id, event).await;
    Ok(())
}

async fn handle_callback_query(bot: Bot, state: AppState, query: CallbackQuery) -> HandlerResult {
    if let Err(err) = bot.answer_callback_query(query.id.clone()).await {
        warn!("answer_callback_query failed: {err}");
    }
    let Some(data) = query.data.as_deref() else {
        return Ok(());
    };
    let Ok(user_id) = i64::try_from(query.from.id.0) else {
        return Ok(());
    };

    match Intent::parse(data) {
        Some(intent) => run_flow(&state, user_id, FlowEvent::Intent(intent)).await,
        None => info!(user_id, data, "Ignoring unknown callback data"),
    }
    Ok(())
}

async fn ignore_message(_message: Message) -> HandlerResult {
    Ok(())
}
