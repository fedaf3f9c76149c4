use std::str::FromStr;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::db::models::{AccountRow, UsageStats};
use crate::flow::catalog::AspectFormat;
use crate::flow::ports::{Account, AccountStore};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    starting_balance: i64,
}

impl Database {
    pub async fn init(database_url: &str, starting_balance: i64) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let in_memory = database_url.contains(":memory:");
        // An in-memory database lives as long as its single connection.
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?
        };

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS users (\
                user_id INTEGER PRIMARY KEY,\
                balance INTEGER NOT NULL DEFAULT 0,\
                model TEXT NOT NULL DEFAULT '',\
                format TEXT NOT NULL DEFAULT '1:1',\
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP\
            );",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS generations (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                user_id INTEGER NOT NULL,\
                model TEXT NOT NULL,\
                price INTEGER NOT NULL,\
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP\
            );",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_generations_user_id ON generations(user_id);",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_generations_created_at ON generations(created_at);",
        )
        .execute(&pool)
        .await?;

        info!("Database tables created successfully");

        Ok(Database {
            pool,
            starting_balance,
        })
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Administrative overwrite. Returns false when the account does not exist.
    pub async fn set_balance(&self, user_id: i64, balance: i64) -> Result<bool> {
        if balance < 0 {
            return Err(anyhow!("balance cannot be negative"));
        }
        let result = sqlx::query("UPDATE users SET balance = ? WHERE user_id = ?")
            .bind(balance)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn stats(&self) -> Result<UsageStats> {
        let (users, total_balance) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT COUNT(*), COALESCE(SUM(balance), 0) FROM users",
        )
        .fetch_one(&self.pool)
        .await?;
        let (generations, credits_spent) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT COUNT(*), COALESCE(SUM(price), 0) FROM generations",
        )
        .fetch_one(&self.pool)
        .await?;
        let today_start = Utc::now().format("%Y-%m-%d 00:00:00").to_string();
        let (generations_today,) = sqlx::query_as::<_, (i64,)>(
            "SELECT COUNT(*) FROM generations WHERE created_at >= ?",
        )
        .bind(today_start)
        .fetch_one(&self.pool)
        .await?;

        Ok(UsageStats {
            users,
            total_balance,
            generations,
            generations_today,
            credits_spent,
        })
    }
}

#[async_trait]
impl AccountStore for Database {
    async fn create_if_absent(&self, user_id: i64) -> Result<Account> {
        let inserted = sqlx::query(
            "INSERT INTO users (user_id, balance) VALUES (?, ?) ON CONFLICT(user_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(self.starting_balance)
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() > 0 {
            info!(
                user_id,
                balance = self.starting_balance,
                "Created account with starting balance"
            );
        }

        let row = sqlx::query_as::<_, AccountRow>(
            "SELECT user_id, balance, model, format FROM users WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn get(&self, user_id: i64) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(
            "SELECT user_id, balance, model, format FROM users WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Account::from))
    }

    async fn set_model(&self, user_id: i64, model_key: &str) -> Result<()> {
        sqlx::query("UPDATE users SET model = ? WHERE user_id = ?")
            .bind(model_key)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_format(&self, user_id: i64, format: AspectFormat) -> Result<()> {
        sqlx::query("UPDATE users SET format = ? WHERE user_id = ?")
            .bind(format.tag())
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn credit(&self, user_id: i64, amount: i64) -> Result<bool> {
        if amount <= 0 {
            return Err(anyhow!("credit amount must be positive"));
        }
        let result = sqlx::query("UPDATE users SET balance = balance + ? WHERE user_id = ?")
            .bind(amount)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn debit(&self, user_id: i64, amount: i64) -> Result<bool> {
        if amount < 0 {
            return Err(anyhow!("debit amount cannot be negative"));
        }
        let result = sqlx::query(
            "UPDATE users SET balance = balance - ? WHERE user_id = ? AND balance >= ?",
        )
        .bind(amount)
        .bind(user_id)
        .bind(amount)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_generation(&self, user_id: i64, model_key: &str, price: i64) -> Result<()> {
        sqlx::query("INSERT INTO generations (user_id, model, price) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(model_key)
            .bind(price)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
