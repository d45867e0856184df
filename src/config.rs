use crate::error::{ChatError, ChatResult};
use crate::models::ModelConfig;
use crate::storage::{self, KeyValueStore};
use anyhow::{Context, Result};
use arc_swap::ArcSwapOption;
use keyring::Entry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_ORIGIN: &str = "https://localhost:3001";

// --- Client Settings ---

/// Runtime knobs for the chat core, read from `OFFICECHAT_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    /// Origin that same-origin proxy paths such as `/api/deepseek/...` are resolved against.
    pub proxy_origin: String,
    /// Origin the add-in is served from; sent as Origin/Referer to providers that check it.
    pub addin_origin: String,
    pub request_timeout: Duration,
    pub pacing_interval: Duration,
    pub retry_backoff: Duration,
    /// How long the streaming index stays set after a send ends, so the UI can paint the last update.
    pub grace_delay: Duration,
    pub max_retries: u32,
    pub database_path: PathBuf,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            proxy_origin: DEFAULT_ORIGIN.to_string(),
            addin_origin: DEFAULT_ORIGIN.to_string(),
            request_timeout: Duration::from_secs(60),
            pacing_interval: Duration::from_millis(20),
            retry_backoff: Duration::from_secs(1),
            grace_delay: Duration::from_millis(500),
            max_retries: 2,
            database_path: default_database_path(),
        }
    }
}

impl ClientSettings {
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();
        if let Ok(origin) = std::env::var("OFFICECHAT_PROXY_ORIGIN") {
            settings.proxy_origin = origin;
        }
        if let Ok(origin) = std::env::var("OFFICECHAT_ADDIN_ORIGIN") {
            settings.addin_origin = origin;
        }
        if let Some(ms) = env_millis("OFFICECHAT_TIMEOUT_MS")? {
            settings.request_timeout = ms;
        }
        if let Some(ms) = env_millis("OFFICECHAT_PACING_MS")? {
            settings.pacing_interval = ms;
        }
        if let Some(ms) = env_millis("OFFICECHAT_RETRY_BACKOFF_MS")? {
            settings.retry_backoff = ms;
        }
        if let Some(ms) = env_millis("OFFICECHAT_GRACE_MS")? {
            settings.grace_delay = ms;
        }
        if let Ok(retries) = std::env::var("OFFICECHAT_MAX_RETRIES") {
            settings.max_retries = retries
                .parse()
                .with_context(|| format!("Invalid OFFICECHAT_MAX_RETRIES value '{}'", retries))?;
        }
        if let Ok(path) = std::env::var("OFFICECHAT_DB") {
            settings.database_path = PathBuf::from(path);
        }
        log::debug!("Client settings: {:?}", settings);
        Ok(settings)
    }
}

fn env_millis(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(raw) => {
            let ms: u64 = raw
                .parse()
                .with_context(|| format!("Invalid {} value '{}'", name, raw))?;
            Ok(Some(Duration::from_millis(ms)))
        }
        Err(_) => Ok(None),
    }
}

fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("officechat")
        .join("officechat.sqlite")
}

// --- API Key Retrieval ---

const KEYRING_SERVICE_PREFIX: &str = "officechat_api_key";

/// Resolves the API key of a model configuration.
/// `env:NAME` reads an environment variable, `keyring` reads the OS keyring,
/// anything else is the key itself.
pub fn resolve_api_key(config: &ModelConfig) -> ChatResult<String> {
    match config.api_key.as_str() {
        key if key.starts_with("env:") => {
            let env_var_name = key.trim_start_matches("env:");
            log::debug!("Retrieving API key from environment variable: {}", env_var_name);
            std::env::var(env_var_name).map_err(|_| {
                ChatError::configuration(format!(
                    "Failed to get API key from environment variable '{}'",
                    env_var_name
                ))
            })
        }
        "keyring" => {
            let service_name = format!("{}-{}", KEYRING_SERVICE_PREFIX, config.id);
            log::debug!("Retrieving API key from keyring for service: {}", service_name);
            Entry::new(&service_name, &config.name)
                .and_then(|entry| entry.get_password())
                .map_err(|e| {
                    ChatError::configuration(format!(
                        "Failed to get API key from keyring for '{}': {}",
                        config.name, e
                    ))
                })
        }
        literal => Ok(literal.to_string()),
    }
}

/// Stores an API key in the OS keyring for the given model configuration.
pub fn set_api_key_in_keyring(config: &ModelConfig, api_key: &str) -> Result<()> {
    let service_name = format!("{}-{}", KEYRING_SERVICE_PREFIX, config.id);
    let entry = Entry::new(&service_name, &config.name)
        .context("Failed to create keyring entry for setting password")?;
    log::info!("Setting API key in keyring for service: {}", service_name);
    entry.set_password(api_key).context(format!(
        "Failed to set API key in keyring for '{}'",
        config.name
    ))
}

// --- Active Model Config ---

/// Holds the active model configuration. Readers take a snapshot; a send keeps
/// its snapshot even if the config is swapped mid-request.
#[derive(Clone, Default)]
pub struct ModelConfigStore {
    active: Arc<ArcSwapOption<ModelConfig>>,
}

impl ModelConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Option<Arc<ModelConfig>> {
        self.active.load_full()
    }

    /// Makes `config` the active configuration, returning the previous one.
    pub fn swap(&self, config: ModelConfig) -> ChatResult<Option<Arc<ModelConfig>>> {
        if config.api_url.trim().is_empty() {
            return Err(ChatError::configuration(format!(
                "model '{}' has no API URL",
                config.name
            )));
        }
        log::info!("Activating model config: {}", config.name);
        Ok(self.active.swap(Some(Arc::new(config))))
    }

    pub fn clear(&self) {
        self.active.store(None);
    }

    /// Loads the default model (or else the first configured one) from settings.
    /// Returns false when nothing is configured.
    pub async fn load_from(&self, store: &dyn KeyValueStore) -> Result<bool> {
        let configs = storage::load_model_configs(store).await?;
        let default_id = storage::load_default_model_id(store).await?;

        let chosen = default_id
            .and_then(|id| configs.iter().find(|c| c.id == id))
            .or_else(|| configs.first());

        match chosen {
            Some(config) => {
                self.swap(config.clone())?;
                Ok(true)
            }
            None => {
                log::info!("No model configuration found");
                Ok(false)
            }
        }
    }
}
