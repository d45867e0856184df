use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePoolOptions, Sqlite, SqlitePool};
use std::path::Path;

use crate::models::{ChatMessage, ModelConfig};

pub const MODEL_CONFIGS_KEY: &str = "modelConfigs";
pub const DEFAULT_MODEL_ID_KEY: &str = "defaultModelId";
pub const CHAT_HISTORY_KEY: &str = "chatHistory";

/// Only the most recent messages are persisted.
pub const HISTORY_LIMIT: usize = 50;

// Application Settings Table (Key-Value)
const MIGRATIONS_SQL: &str = "
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
";

/// Narrow persistence contract used by the chat core.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error>;
    async fn set(&self, key: &str, value: &str) -> Result<(), anyhow::Error>;
}

#[derive(Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the settings database at `db_path` and runs migrations.
    pub async fn open(db_path: &Path) -> Result<Self, anyhow::Error> {
        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await.context("Failed to create database directory")?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.to_string_lossy());
        log::info!("Connecting to database: {}", db_url);

        if !Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            log::info!("Database file not found, creating...");
            Sqlite::create_database(&db_url).await.context("Failed to create database")?;
        }

        let pool = SqlitePoolOptions::new()
            .connect(&db_url)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// A private in-memory database. One connection, kept alive, so every query sees the same data.
    pub async fn in_memory() -> Result<Self, anyhow::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory SQLite database")?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<(), anyhow::Error> {
        log::debug!("Running database migrations...");
        sqlx::query(MIGRATIONS_SQL)
            .execute(pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to read setting '{}'", key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to write setting '{}'", key))?;
        log::debug!("Saved setting '{}' ({} bytes)", key, value.len());
        Ok(())
    }
}

/// Process-local store, used when no database is available and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), anyhow::Error> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Saves the most recent `HISTORY_LIMIT` messages.
pub async fn save_history(store: &dyn KeyValueStore, messages: &[ChatMessage]) -> Result<(), anyhow::Error> {
    let start = messages.len().saturating_sub(HISTORY_LIMIT);
    let json = serde_json::to_string(&messages[start..]).context("Failed to serialize chat history")?;
    store.set(CHAT_HISTORY_KEY, &json).await?;
    log::info!("Saved {} messages of chat history", messages.len() - start);
    Ok(())
}

pub async fn load_history(store: &dyn KeyValueStore) -> Result<Option<Vec<ChatMessage>>, anyhow::Error> {
    let Some(json) = store.get(CHAT_HISTORY_KEY).await? else {
        return Ok(None);
    };
    let messages: Vec<ChatMessage> = serde_json::from_str(&json).context("Failed to parse saved chat history")?;
    log::info!("Loaded {} messages of chat history", messages.len());
    Ok(Some(messages))
}

pub async fn load_model_configs(store: &dyn KeyValueStore) -> Result<Vec<ModelConfig>, anyhow::Error> {
    match store.get(MODEL_CONFIGS_KEY).await? {
        Some(json) => serde_json::from_str(&json).context("Failed to parse saved model configs"),
        None => Ok(Vec::new()),
    }
}

pub async fn save_model_configs(store: &dyn KeyValueStore, configs: &[ModelConfig]) -> Result<(), anyhow::Error> {
    let json = serde_json::to_string(configs).context("Failed to serialize model configs")?;
    store.set(MODEL_CONFIGS_KEY, &json).await
}

// The id is stored JSON-encoded, as the add-in does.
pub async fn load_default_model_id(store: &dyn KeyValueStore) -> Result<Option<String>, anyhow::Error> {
    match store.get(DEFAULT_MODEL_ID_KEY).await? {
        Some(json) => serde_json::from_str(&json).context("Failed to parse default model id"),
        None => Ok(None),
    }
}

pub async fn save_default_model_id(store: &dyn KeyValueStore, id: &str) -> Result<(), anyhow::Error> {
    let json = serde_json::to_string(id).context("Failed to serialize default model id")?;
    store.set(DEFAULT_MODEL_ID_KEY, &json).await
}
