// Commands exposed to the front end. Errors are flattened to user-facing strings.

use crate::config;
use crate::models::{ChatMessage, ModelConfig};
use crate::session::{ConnectionReport, SendOptions};
use crate::state::AppState;
use crate::storage;
use crate::tasks::Task;
use serde_json::Value;
use uuid::Uuid;

pub async fn get_messages(state: &AppState) -> Vec<ChatMessage> {
    state.session.messages().await
}

// Streams the reply into the transcript; the front end observes the transcript meanwhile.
pub async fn send_message(state: &AppState, content: String, enable_thinking: bool) -> Result<(), String> {
    log::info!("Frontend requested to send a message ({} chars)", content.len());
    let options = SendOptions {
        enable_thinking,
        max_retries: state.settings.max_retries,
    };
    let outcome = state.session.send_streaming(&content, options).await;

    // History is best effort
    if let Err(e) = state.session.save_history().await {
        log::error!("Failed to save chat history: {:#}", e);
    }

    match outcome {
        Ok(_) => Ok(()),
        Err(e) => {
            log::error!("Failed to send message: {}", e);
            Err(e.to_string())
        }
    }
}

pub async fn stop_generation(state: &AppState) -> Result<(), String> {
    if state.session.stop_generation().await {
        Ok(())
    } else {
        Err("No response is being generated.".to_string())
    }
}

pub async fn clear_chat(state: &AppState) -> Result<(), String> {
    state.session.clear_chat().await;
    state
        .session
        .save_history()
        .await
        .map_err(|e| format!("Failed to save chat history: {}", e))
}

pub fn set_context(state: &AppState, context: Option<Value>) {
    log::debug!("Context updated (present: {})", context.is_some());
    state.context.set(context);
}

pub async fn run_task(state: &AppState, task: Task) -> Result<String, String> {
    state
        .session
        .run_task(&task)
        .await
        .map_err(|e| format!("{} task failed: {}", task.name(), e))
}

// --- Model Config Commands ---

pub async fn list_model_configs(state: &AppState) -> Result<Vec<ModelConfig>, String> {
    log::info!("Frontend requested to list model configs");
    storage::load_model_configs(state.store.as_ref())
        .await
        .map_err(|e| format!("Failed to list model configs: {}", e))
}

fn validate(config: &ModelConfig) -> Result<(), String> {
    if config.name.trim().is_empty() || config.api_url.trim().is_empty() {
        return Err("Name and API URL cannot be empty.".to_string());
    }
    Ok(())
}

pub async fn add_model_config(state: &AppState, mut config: ModelConfig) -> Result<ModelConfig, String> {
    log::info!("Frontend requested to add model config: {}", config.name);
    validate(&config)?;
    if config.id.trim().is_empty() {
        config.id = Uuid::new_v4().to_string();
    }

    let mut configs = list_model_configs(state).await?;
    if configs.iter().any(|c| c.id == config.id) {
        return Err(format!("Model config with ID {} already exists", config.id));
    }
    configs.push(config.clone());
    storage::save_model_configs(state.store.as_ref(), &configs)
        .await
        .map_err(|e| format!("Failed to add model config: {}", e))?;

    // The first model becomes active
    if state.models.snapshot().is_none() {
        state.models.swap(config.clone()).map_err(|e| e.to_string())?;
    }
    Ok(config)
}

pub async fn update_model_config(state: &AppState, config: ModelConfig) -> Result<(), String> {
    log::info!("Frontend requested to update model config: {}", config.id);
    validate(&config)?;

    let mut configs = list_model_configs(state).await?;
    let Some(slot) = configs.iter_mut().find(|c| c.id == config.id) else {
        return Err(format!("Model config with ID {} not found", config.id));
    };
    *slot = config.clone();
    storage::save_model_configs(state.store.as_ref(), &configs)
        .await
        .map_err(|e| format!("Failed to update model config: {}", e))?;

    if state.models.snapshot().is_some_and(|active| active.id == config.id) {
        state.models.swap(config).map_err(|e| e.to_string())?;
    }
    Ok(())
}

pub async fn delete_model_config(state: &AppState, config_id: &str) -> Result<(), String> {
    log::warn!("Frontend requested to delete model config ID: {}", config_id);
    let mut configs = list_model_configs(state).await?;
    configs.retain(|c| c.id != config_id);
    storage::save_model_configs(state.store.as_ref(), &configs)
        .await
        .map_err(|e| format!("Failed to delete model config: {}", e))?;

    if state.models.snapshot().is_some_and(|active| active.id == config_id) {
        match configs.first() {
            Some(next) => {
                state.models.swap(next.clone()).map_err(|e| e.to_string())?;
            }
            None => state.models.clear(),
        }
    }
    Ok(())
}

pub async fn set_default_model(state: &AppState, config_id: &str) -> Result<(), String> {
    log::info!("Frontend requested default model: {}", config_id);
    let configs = list_model_configs(state).await?;
    let Some(config) = configs.into_iter().find(|c| c.id == config_id) else {
        return Err(format!("Model config with ID {} not found", config_id));
    };
    storage::save_default_model_id(state.store.as_ref(), config_id)
        .await
        .map_err(|e| format!("Failed to save default model: {}", e))?;
    state.models.swap(config).map_err(|e| e.to_string())?;
    Ok(())
}

// Moves a literal key into the OS keyring and stores only the reference.
pub async fn store_api_key(state: &AppState, config_id: &str, api_key: &str) -> Result<(), String> {
    let configs = list_model_configs(state).await?;
    let Some(mut config) = configs.into_iter().find(|c| c.id == config_id) else {
        return Err(format!("Model config with ID {} not found", config_id));
    };
    config::set_api_key_in_keyring(&config, api_key).map_err(|e| format!("{:#}", e))?;
    config.api_key = "keyring".to_string();
    update_model_config(state, config).await
}

pub async fn test_connection(state: &AppState, config: ModelConfig) -> ConnectionReport {
    log::info!("Frontend requested connection test for: {}", config.name);
    state.session.test_connection(&config).await
}
