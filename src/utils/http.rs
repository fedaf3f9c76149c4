use std::time::Duration;

use anyhow::Result;
use reqwest::Client;

/// Shared client for provider calls and file downloads. Per-request timeouts override
/// the default set here.
pub fn build_http_client(timeout: Duration) -> Result<Client> {
    Ok(Client::builder()
        .timeout(timeout)
        .user_agent(concat!("image_studio_bot/", env!("CARGO_PKG_VERSION")))
        .build()?)
}
