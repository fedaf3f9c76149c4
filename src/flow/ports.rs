//! Collaborators the conversation controller talks to. Concrete implementations live in
//! `db` (accounts) and `handlers` (Telegram delivery and subscription gate); tests swap in
//! fakes.

use anyhow::Result;
use async_trait::async_trait;

use crate::flow::catalog::AspectFormat;
use crate::flow::screens::Menu;
use crate::utils::imaging::PreparedImage;
use crate::utils::telegram::ActivityHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub user_id: i64,
    pub balance: i64,
    pub selected_model: Option<String>,
    pub selected_format: AspectFormat,
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Creates the account with the starting grant if it does not exist yet.
    async fn create_if_absent(&self, user_id: i64) -> Result<Account>;
    async fn get(&self, user_id: i64) -> Result<Option<Account>>;
    async fn set_model(&self, user_id: i64, model_key: &str) -> Result<()>;
    async fn set_format(&self, user_id: i64, format: AspectFormat) -> Result<()>;
    /// Returns false when the account does not exist.
    async fn credit(&self, user_id: i64, amount: i64) -> Result<bool>;
    /// Single conditional update; returns false and changes nothing when the balance
    /// would go negative.
    async fn debit(&self, user_id: i64, amount: i64) -> Result<bool>;
    async fn record_generation(&self, user_id: i64, model_key: &str, price: i64) -> Result<()>;
}

#[async_trait]
pub trait EligibilityGate: Send + Sync {
    async fn is_eligible(&self, user_id: i64) -> bool;

    /// Where the user should go to become eligible, if there is such a place.
    fn remediation_url(&self) -> Option<String> {
        None
    }
}

#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn send_text(&self, user_id: i64, text: &str, menu: Option<&Menu>) -> Result<()>;

    /// `Ok` means the transport acknowledged the image.
    async fn send_image(
        &self,
        user_id: i64,
        image: &PreparedImage,
        caption: &str,
        menu: Option<&Menu>,
    ) -> Result<()>;

    /// Keeps an "uploading photo" indicator alive until the handle is dropped.
    fn start_activity(&self, _user_id: i64) -> ActivityHandle {
        ActivityHandle::idle()
    }
}

/// Gate used when no subscription requirement is configured.
pub struct OpenGate;

#[async_trait]
impl EligibilityGate for OpenGate {
    async fn is_eligible(&self, _user_id: i64) -> bool {
        true
    }
}
