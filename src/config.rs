use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use tracing::{info, warn};

use crate::flow::catalog::{ImageModel, ModelCatalog};
use crate::flow::session::DEFAULT_SESSION_IDLE_TTL;
use crate::utils::imaging::EncodingPolicy;

#[derive(Debug, Clone, Deserialize)]
struct ImageModelsFile {
    models: Vec<ImageModelEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct ImageModelEntry {
    #[serde(default)]
    key: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    price: i64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub database_url: String,
    pub openrouter_api_key: String,
    pub openrouter_base_url: String,
    pub generation_timeout: Duration,
    pub starting_balance: i64,
    pub image_models_config_path: PathBuf,
    pub image_models: Vec<ImageModel>,
    pub required_channel: Option<String>,
    pub required_channel_url: Option<String>,
    pub prompts_channel_url: Option<String>,
    pub admin_user_ids: Vec<i64>,
    pub webhook_url: Option<String>,
    pub port: u16,
    pub photo_max_bytes: usize,
    pub jpeg_start_quality: u8,
    pub jpeg_quality_step: u8,
    pub jpeg_min_quality: u8,
    pub source_image_max_bytes: usize,
    pub session_idle_ttl: Duration,
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_optional(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_i64(name: &str, default: i64) -> i64 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_u8(name: &str, default: u8) -> u8 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u8>().ok())
        .unwrap_or(default)
}

fn normalize_database_url(value: String) -> String {
    if value.starts_with("sqlite+aiosqlite://") {
        return value.replacen("sqlite+aiosqlite://", "sqlite://", 1);
    }
    value
}

fn parse_id_list(raw: &str) -> Vec<i64> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.parse::<i64>() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!("Ignoring invalid admin user id '{}'", entry);
                None
            }
        })
        .collect()
}

/// `@channel` links to `https://t.me/channel`; numeric ids have no public link.
fn derive_channel_url(channel: &str) -> Option<String> {
    let username = channel.trim().strip_prefix('@')?;
    if username.is_empty() {
        return None;
    }
    Some(format!("https://t.me/{username}"))
}

fn resolve_image_models_path() -> PathBuf {
    let configured = PathBuf::from(env_string("IMAGE_MODELS_CONFIG_PATH", "image_models.json"));
    if configured.is_absolute() {
        return configured;
    }
    env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(configured)
}

fn parse_image_models(raw: &str) -> Result<Vec<ImageModel>> {
    let parsed: ImageModelsFile = serde_json::from_str(raw)?;
    let mut models: Vec<ImageModel> = Vec::new();
    for entry in parsed.models {
        let key = entry.key.trim();
        let name = entry.name.trim();
        let model = entry.model.trim();
        if key.is_empty() || name.is_empty() || model.is_empty() || entry.price <= 0 {
            warn!("Skipping invalid image model entry '{}'", key);
            continue;
        }
        if models.iter().any(|existing| existing.key == key) {
            warn!("Skipping duplicate image model key '{}'", key);
            continue;
        }
        models.push(ImageModel::new(key, name, model, entry.price));
    }
    Ok(models)
}

fn load_image_models_from_path(path: &Path) -> Vec<ImageModel> {
    if !path.exists() {
        info!("Image model config not found at {}", path.display());
        return Vec::new();
    }

    let raw = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            warn!(
                "Failed to read image model config at {}: {}",
                path.display(),
                err
            );
            return Vec::new();
        }
    };

    match parse_image_models(&raw) {
        Ok(models) => {
            info!(
                "Loaded {} image model(s) from {}",
                models.len(),
                path.display()
            );
            models
        }
        Err(err) => {
            warn!(
                "Failed to parse image model config at {}: {}",
                path.display(),
                err
            );
            Vec::new()
        }
    }
}

/// Read ahead of [`Config::load`] so logging is up before configuration is parsed.
pub fn log_level_from_env() -> String {
    env_string("LOG_LEVEL", "info").to_lowercase()
}

impl Config {
    pub fn load() -> Result<Self> {
        let bot_token = env::var("BOT_TOKEN").unwrap_or_default();
        if bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!("BOT_TOKEN is required"));
        }

        let image_models_config_path = resolve_image_models_path();
        let image_models = load_image_models_from_path(&image_models_config_path);

        let required_channel = env_optional("REQUIRED_CHANNEL");
        let required_channel_url = env_optional("REQUIRED_CHANNEL_URL").or_else(|| {
            required_channel
                .as_deref()
                .and_then(derive_channel_url)
        });

        let starting_balance = env_i64("STARTING_BALANCE", 50).max(0);

        Ok(Config {
            bot_token,
            database_url: normalize_database_url(env_string("DATABASE_URL", "sqlite://bot.db")),
            openrouter_api_key: env_string("OPENROUTER_API_KEY", ""),
            openrouter_base_url: env_string("OPENROUTER_BASE_URL", "https://openrouter.ai/api/v1"),
            generation_timeout: Duration::from_secs(
                env_u64("GENERATION_TIMEOUT_SECONDS", 120).max(1),
            ),
            starting_balance,
            image_models_config_path,
            image_models,
            required_channel,
            required_channel_url,
            prompts_channel_url: env_optional("PROMPTS_CHANNEL_URL"),
            admin_user_ids: parse_id_list(&env_string("ADMIN_USER_IDS", "")),
            webhook_url: env_optional("WEBHOOK_URL"),
            port: env_u64("PORT", 8080).clamp(1, u16::MAX as u64) as u16,
            photo_max_bytes: env_usize("PHOTO_MAX_BYTES", 10_000_000),
            jpeg_start_quality: env_u8("JPEG_START_QUALITY", 95).clamp(1, 100),
            jpeg_quality_step: env_u8("JPEG_QUALITY_STEP", 10),
            jpeg_min_quality: env_u8("JPEG_MIN_QUALITY", 40).clamp(1, 100),
            source_image_max_bytes: env_usize("SOURCE_IMAGE_MAX_BYTES", 20_000_000),
            session_idle_ttl: Duration::from_secs(
                env_u64("SESSION_IDLE_TTL_SECONDS", DEFAULT_SESSION_IDLE_TTL.as_secs()).max(60),
            ),
        })
    }

    /// Configured models, or the built-in catalog when none were loaded.
    pub fn model_catalog(&self) -> ModelCatalog {
        if self.image_models.is_empty() {
            info!("Using built-in image model catalog");
        }
        ModelCatalog::new(self.image_models.clone())
    }

    pub fn encoding_policy(&self) -> EncodingPolicy {
        EncodingPolicy {
            max_bytes: self.photo_max_bytes,
            start_quality: self.jpeg_start_quality,
            quality_step: self.jpeg_quality_step,
            min_quality: self.jpeg_min_quality,
        }
        .normalized()
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admin_user_ids.contains(&user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_legacy_database_urls() {
        assert_eq!(
            normalize_database_url("sqlite+aiosqlite:///bot.db".to_string()),
            "sqlite:///bot.db"
        );
        assert_eq!(
            normalize_database_url("sqlite://bot.db".to_string()),
            "sqlite://bot.db"
        );
    }

    #[test]
    fn parses_admin_ids_and_skips_garbage() {
        assert_eq!(parse_id_list("1, 22 ,abc,,-5"), vec![1, 22, -5]);
        assert!(parse_id_list("").is_empty());
    }

    #[test]
    fn derives_channel_links_only_for_usernames() {
        assert_eq!(
            derive_channel_url("@prompts").as_deref(),
            Some("https://t.me/prompts")
        );
        assert_eq!(derive_channel_url("-1001234567890"), None);
        assert_eq!(derive_channel_url("@"), None);
    }

    #[test]
    fn model_file_skips_invalid_and_duplicate_entries() {
        let raw = r#"{"models":[
            {"key":"fast","name":"Fast","model":"vendor/fast","price":5},
            {"key":"","name":"Nameless","model":"vendor/x","price":5},
            {"key":"free","name":"Free","model":"vendor/free","price":0},
            {"key":"fast","name":"Again","model":"vendor/again","price":7},
            {"key":"slow","name":"Slow","model":"vendor/slow","price":30}
        ]}"#;
        let models = parse_image_models(raw).unwrap();
        let keys: Vec<&str> = models.iter().map(|model| model.key.as_str()).collect();
        assert_eq!(keys, vec!["fast", "slow"]);
        assert_eq!(models[1].price, 30);
    }

    #[test]
    fn missing_or_broken_model_file_yields_nothing() {
        assert!(load_image_models_from_path(Path::new("/nonexistent/image_models.json")).is_empty());
        assert!(parse_image_models("{not json").is_err());
    }
}
