use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::flow::catalog::AspectFormat;
use crate::flow::ports::Account;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AccountRow {
    pub user_id: i64,
    pub balance: i64,
    pub model: String,
    pub format: String,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        let model = row.model.trim();
        Account {
            user_id: row.user_id,
            balance: row.balance.max(0),
            selected_model: if model.is_empty() {
                None
            } else {
                Some(model.to_string())
            },
            selected_format: AspectFormat::from_tag(&row.format).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    pub users: i64,
    pub total_balance: i64,
    pub generations: i64,
    pub generations_today: i64,
    pub credits_spent: i64,
}
