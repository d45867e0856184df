use crate::api::{HttpProvider, LLMApiProvider};
use crate::config::{ClientSettings, ModelConfigStore};
use crate::context::SharedContext;
use crate::session::ChatSession;
use crate::storage::{KeyValueStore, SqliteStore};
use anyhow::Context;
use std::sync::Arc;

// Core application state handed to every command
#[derive(Clone)] // Allow cloning for background tasks
pub struct AppState {
    pub store: Arc<dyn KeyValueStore>,
    pub models: ModelConfigStore,
    pub context: Arc<SharedContext>,
    pub session: ChatSession,
    pub settings: ClientSettings,
}

impl AppState {
    pub fn new(store: Arc<dyn KeyValueStore>, api_provider: Arc<dyn LLMApiProvider>, settings: ClientSettings) -> Self {
        let models = ModelConfigStore::new();
        let context = Arc::new(SharedContext::new());
        let session = ChatSession::new(models.clone(), store.clone(), api_provider, context.clone(), settings.clone());
        Self {
            store,
            models,
            context,
            session,
            settings,
        }
    }

    /// Opens the settings database, loads the active model and the saved history.
    pub async fn initialize(settings: ClientSettings) -> Result<Self, anyhow::Error> {
        let store = SqliteStore::open(&settings.database_path)
            .await
            .context("Failed to open settings store")?;
        let api_provider: Arc<dyn LLMApiProvider> = Arc::new(HttpProvider::new(settings.proxy_origin.clone()));
        let state = Self::new(Arc::new(store), api_provider, settings);

        match state.models.load_from(state.store.as_ref()).await {
            Ok(true) => {}
            Ok(false) => log::warn!("No model configured yet; add one before sending messages"),
            Err(e) => log::error!("Failed to load model configs: {:#}", e),
        }
        if let Err(e) = state.session.load_history().await {
            log::error!("Failed to load chat history: {:#}", e);
        }
        Ok(state)
    }
}
