use crate::error::{ChatError, ChatResult};
use crate::models::{Completion, Role};
use crate::request::ChatRequest;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde_json::Value;
use std::pin::Pin;

/// Answer used when a non-streaming response matches no known shape.
pub const UNPARSEABLE_RESPONSE: &str = "Unable to parse model response";

// Raw response bytes as they arrive
pub type ByteStream = Pin<Box<dyn Stream<Item = ChatResult<Bytes>> + Send>>;

/// Body of a non-streaming response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(Value),
    Text(String),
}

// Transport boundary for LLM providers
#[async_trait]
pub trait LLMApiProvider: Send + Sync {
    /// Posts a streaming request and returns the response body as a byte stream.
    async fn open_stream(&self, request: &ChatRequest) -> ChatResult<ByteStream>;

    /// Posts a request and returns the whole response body.
    async fn send(&self, request: &ChatRequest) -> ChatResult<ResponseBody>;
}

// --- HTTP Provider Implementation ---

pub struct HttpProvider {
    client: Client,
    proxy_origin: String,
}

impl HttpProvider {
    /// `proxy_origin` is prepended to same-origin proxy paths such as `/api/deepseek/...`.
    pub fn new(proxy_origin: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            proxy_origin: proxy_origin.into(),
        }
    }

    fn resolve_url(&self, url: &str) -> String {
        if url.starts_with('/') {
            format!("{}{}", self.proxy_origin.trim_end_matches('/'), url)
        } else {
            url.to_string()
        }
    }

    async fn post(&self, request: &ChatRequest) -> ChatResult<reqwest::Response> {
        let url = self.resolve_url(&request.url);
        log::info!("Sending request to: {} ({:?})", url, request.provider);

        let response = self
            .client
            .post(&url)
            .headers(request.headers.clone())
            .json(&request.body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<Failed to read error body>".to_string());
            log::error!("API request failed with status {}: {}", status, body);
            return Err(ChatError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl LLMApiProvider for HttpProvider {
    async fn open_stream(&self, request: &ChatRequest) -> ChatResult<ByteStream> {
        let response = self.post(request).await?;
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(ChatError::from));
        Ok(Box::pin(stream))
    }

    async fn send(&self, request: &ChatRequest) -> ChatResult<ResponseBody> {
        let response = self.post(request).await?;
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Err(ChatError::transport("API returned an empty response"));
        }
        Ok(match serde_json::from_str::<Value>(&text) {
            Ok(json) => ResponseBody::Json(json),
            Err(_) => ResponseBody::Text(text),
        })
    }
}

fn parse_role(value: Option<&Value>) -> Role {
    value
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or(Role::Assistant)
}

/// Extracts the answer from the response shapes providers are known to return.
pub fn parse_completion(body: ResponseBody) -> ChatResult<Completion> {
    let json = match body {
        ResponseBody::Text(text) => return Ok(Completion { text, role: Role::Assistant }),
        ResponseBody::Json(Value::Null) => return Err(ChatError::transport("API returned an empty response")),
        ResponseBody::Json(Value::String(text)) => return Ok(Completion { text, role: Role::Assistant }),
        ResponseBody::Json(json) => json,
    };

    // OpenAI style
    if let Some(choice) = json.get("choices").and_then(Value::as_array).and_then(|c| c.first()) {
        let message = choice.get("message");
        let text = message
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .or_else(|| choice.get("text").and_then(Value::as_str))
            .unwrap_or_default()
            .to_string();
        return Ok(Completion {
            text,
            role: parse_role(message.and_then(|m| m.get("role"))),
        });
    }

    // {content, role} style
    if let (Some(content), Some(role)) = (json.get("content").and_then(Value::as_str), json.get("role")) {
        return Ok(Completion {
            text: content.to_string(),
            role: parse_role(Some(role)),
        });
    }

    log::warn!("Unrecognized API response shape: {}", json);
    Ok(Completion {
        text: UNPARSEABLE_RESPONSE.to_string(),
        role: Role::Assistant,
    })
}
