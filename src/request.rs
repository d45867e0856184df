//! Maps a model configuration and a message list to a provider-shaped HTTP request.
//!
//! Provider quirks live in [`ProviderKind`], selected once from the configured URL.

use crate::config::DEFAULT_ORIGIN;
use crate::error::{ChatError, ChatResult};
use crate::models::{ModelConfig, Role};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE, ORIGIN, REFERER};
use serde::Serialize;

const OPENAI_DEFAULT_MODEL: &str = "gpt-3.5-turbo";
const DEEPSEEK_PROXY_PREFIX: &str = "/api/deepseek";
const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
const COMPLETIONS_PATH: &str = "/v1/completions";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Azure,
    DeepSeek,
    Generic,
}

impl ProviderKind {
    pub fn detect(api_url: &str) -> Self {
        if api_url.contains("openai.com") {
            ProviderKind::OpenAi
        } else if api_url.contains("azure.com") {
            ProviderKind::Azure
        } else if api_url.contains("deepseek.com") || api_url.contains(DEEPSEEK_PROXY_PREFIX) {
            ProviderKind::DeepSeek
        } else {
            ProviderKind::Generic
        }
    }

    fn auth_headers(self, api_key: &str, origin: &str, headers: &mut HeaderMap) -> ChatResult<()> {
        if api_key.is_empty() {
            return Ok(());
        }
        match self {
            ProviderKind::Azure => {
                headers.insert(HeaderName::from_static("api-key"), header_value(api_key)?);
            }
            ProviderKind::DeepSeek => {
                headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", api_key))?);
                headers.insert(ORIGIN, header_value(origin)?);
                headers.insert(REFERER, header_value(&format!("{}/", origin.trim_end_matches('/')))?);
            }
            ProviderKind::OpenAi | ProviderKind::Generic => {
                headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", api_key))?);
            }
        }
        Ok(())
    }

    fn model_field(self, config: &ModelConfig) -> Option<String> {
        match self {
            ProviderKind::OpenAi => Some(config.model_id().unwrap_or(OPENAI_DEFAULT_MODEL).to_string()),
            _ => config
                .model_id()
                .map(str::to_string)
                .or_else(|| Some(config.name.clone()).filter(|n| !n.is_empty())),
        }
    }
}

fn header_value(value: &str) -> ChatResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| ChatError::configuration("API key or origin contains characters not allowed in a header"))
}

/// Rewrites URLs whose host cannot be called from the add-in page to the
/// same-origin proxy path, keeping only the endpoint suffix.
pub fn proxied_url(api_url: &str) -> Option<String> {
    if !api_url.contains("api.deepseek.com") {
        return None;
    }
    let endpoint = if !api_url.contains(CHAT_COMPLETIONS_PATH) && api_url.contains(COMPLETIONS_PATH) {
        COMPLETIONS_PATH
    } else {
        CHAT_COMPLETIONS_PATH
    };
    Some(format!("{}{}", DEEPSEEK_PROXY_PREFIX, endpoint))
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ApiMessage {
    pub role: Role,
    pub content: String,
}

impl ApiMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RequestBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<ApiMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    pub stream: bool,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl RequestOptions {
    pub fn streaming() -> Self {
        Self { stream: true, ..Self::default() }
    }
}

/// A fully built request. `url` is either absolute or a same-origin proxy path.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub provider: ProviderKind,
    pub url: String,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

#[derive(Debug, Clone)]
pub struct RequestBuilder {
    origin: String,
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_ORIGIN)
    }
}

impl RequestBuilder {
    /// `origin` is the add-in origin sent to providers that check Origin/Referer.
    pub fn new(origin: impl Into<String>) -> Self {
        Self { origin: origin.into() }
    }

    /// Builds the request. `config.api_key` must already be resolved to the literal key.
    pub fn build(&self, config: &ModelConfig, messages: Vec<ApiMessage>, options: &RequestOptions) -> ChatResult<ChatRequest> {
        if config.api_url.trim().is_empty() {
            return Err(ChatError::configuration(format!("model '{}' has no API URL", config.name)));
        }

        let provider = ProviderKind::detect(&config.api_url);

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        provider.auth_headers(&config.api_key, &self.origin, &mut headers)?;

        let url = match proxied_url(&config.api_url) {
            Some(proxied) => {
                log::debug!("Routing {} through proxy path {}", config.api_url, proxied);
                proxied
            }
            None => config.api_url.clone(),
        };

        let body = RequestBody {
            model: provider.model_field(config),
            messages,
            temperature: options.temperature.unwrap_or_else(|| config.effective_temperature()),
            max_tokens: options.max_tokens.unwrap_or_else(|| config.effective_max_tokens()),
            stream: options.stream.then_some(true),
        };

        Ok(ChatRequest { provider, url, headers, body })
    }
}
