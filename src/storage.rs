use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite, sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous}, Row};
use uuid::Uuid;

const LAST_MODEL_KEY: &str = "last_model";

#[derive(Clone)]
pub struct SqliteChatStore {
    pool: Pool<Sqlite>,
}

/// Best-effort persistence used by the chat front end. Callers log and
/// ignore failures.
#[async_trait]
pub trait ChatPersistence: Send + Sync {
    async fn append_chat_input(&self, text: &str) -> anyhow::Result<()>;
    async fn load_chat_history(&self, limit: usize) -> anyhow::Result<Vec<String>>;
    async fn put_last_model(&self, name: &str) -> anyhow::Result<()>;
    async fn last_model(&self) -> anyhow::Result<Option<String>>;
}

impl SqliteChatStore {
    pub async fn initialize(database_url: Option<String>) -> anyhow::Result<Self> {
        let url = match database_url {
            Some(u) => u,
            None => resolve_default_db_url()?,
        };
        let options = url.parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let pool = Pool::<Sqlite>::connect_with(options).await?;
        sqlx::query("PRAGMA busy_timeout = 5000;").execute(&pool).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> { &self.pool }
}

fn resolve_default_db_url() -> anyhow::Result<String> {
    let base = std::env::var("XDG_DATA_HOME").ok().map(PathBuf::from).unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".local").join("share")
    });
    let dir = base.join("query_pilot");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("state.db");
    Ok(format!("sqlite://{}", path.to_string_lossy()))
}

#[async_trait]
impl ChatPersistence for SqliteChatStore {
    async fn append_chat_input(&self, text: &str) -> anyhow::Result<()> {
        let now: DateTime<Utc> = Utc::now();
        sqlx::query("INSERT INTO chat_inputs (id, text, created_at) VALUES (?1, ?2, ?3)")
            .bind(Uuid::new_v4().to_string())
            .bind(text)
            .bind(now.to_rfc3339())
            .execute(&self.pool).await?;
        Ok(())
    }

    async fn load_chat_history(&self, limit: usize) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query("SELECT text FROM chat_inputs ORDER BY created_at DESC, rowid DESC LIMIT ?1")
            .bind(limit as i64)
            .fetch_all(&self.pool).await?;
        let mut texts: Vec<String> = rows.into_iter().map(|r| r.get::<String, _>("text")).collect();
        texts.reverse();
        Ok(texts)
    }

    async fn put_last_model(&self, name: &str) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO app_settings (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
            .bind(LAST_MODEL_KEY)
            .bind(name)
            .execute(&self.pool).await?;
        Ok(())
    }

    async fn last_model(&self) -> anyhow::Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM app_settings WHERE key = ?1")
            .bind(LAST_MODEL_KEY)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }
}

/// Used when the state database cannot be opened; nothing is remembered.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPersistence;

#[async_trait]
impl ChatPersistence for NoopPersistence {
    async fn append_chat_input(&self, _text: &str) -> anyhow::Result<()> { Ok(()) }
    async fn load_chat_history(&self, _limit: usize) -> anyhow::Result<Vec<String>> { Ok(Vec::new()) }
    async fn put_last_model(&self, _name: &str) -> anyhow::Result<()> { Ok(()) }
    async fn last_model(&self) -> anyhow::Result<Option<String>> { Ok(None) }
}
