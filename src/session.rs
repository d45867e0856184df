//! Chat session controller: owns the transcript and drives sends through the
//! request builder, transport, decoder and pacing scheduler.

use crate::api::{parse_completion, ByteStream, LLMApiProvider};
use crate::config::{resolve_api_key, ClientSettings, ModelConfigStore};
use crate::context::{context_message, HostContextProvider};
use crate::decoder::{Delta, StreamDecoder, StreamResult};
use crate::error::{ChatError, ChatResult};
use crate::models::{ChatMessage, Completion, ModelConfig, Role};
use crate::pacing::PacingScheduler;
use crate::request::{ApiMessage, RequestBuilder, RequestOptions};
use crate::storage::{self, KeyValueStore};
use crate::tasks::Task;
use crate::transcript::{SendPhase, StreamTicket, Transcript};
use dashmap::DashMap;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

pub const THINKING_INSTRUCTION: &str = "Output your reasoning and your reply in the following format, keeping them clearly separate:

1. First, output your detailed reasoning wrapped in <thinking> tags:

<thinking>
My reasoning:
- First, I understand the question is about...
- Then, I analyzed the following points...
- Finally, taking the context into account, I concluded...
</thinking>

2. Then output your actual reply directly, without any tags:

Hello! Here is my reply...

Always output the complete reasoning first and the reply after it.";

const CONNECTION_PROBE: &str = "Please reply with \"connection test succeeded\"";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    pub enable_thinking: bool,
    pub max_retries: u32,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            enable_thinking: true,
            max_retries: 2,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ConnectionReport {
    pub success: bool,
    pub message: String,
}

// Receiving side of a send's stop request.
struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    fn is_requested(&self) -> bool {
        *self.0.borrow()
    }

    // Resolves once a stop is requested; never if the sender goes away first.
    async fn requested(&mut self) {
        let stopped = self.0.wait_for(|stopped| *stopped).await.is_ok();
        if !stopped {
            futures::future::pending::<()>().await;
        }
    }
}

#[derive(Clone)]
pub struct ChatSession {
    transcript: Arc<Mutex<Transcript>>,
    models: ModelConfigStore,
    store: Arc<dyn KeyValueStore>,
    provider: Arc<dyn LLMApiProvider>,
    context: Arc<dyn HostContextProvider>,
    builder: RequestBuilder,
    settings: ClientSettings,
    stop_signals: Arc<DashMap<Uuid, watch::Sender<bool>>>,
}

impl ChatSession {
    pub fn new(
        models: ModelConfigStore,
        store: Arc<dyn KeyValueStore>,
        provider: Arc<dyn LLMApiProvider>,
        context: Arc<dyn HostContextProvider>,
        settings: ClientSettings,
    ) -> Self {
        Self {
            transcript: Arc::new(Mutex::new(Transcript::with_greeting())),
            models,
            store,
            provider,
            context,
            builder: RequestBuilder::new(settings.addin_origin.clone()),
            settings,
            stop_signals: Arc::new(DashMap::new()),
        }
    }

    /// Shared handle for observers that render the transcript while a send runs.
    pub fn transcript(&self) -> Arc<Mutex<Transcript>> {
        self.transcript.clone()
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.transcript.lock().await.messages().to_vec()
    }

    pub fn models(&self) -> &ModelConfigStore {
        &self.models
    }

    pub async fn init_chat(&self) {
        self.transcript.lock().await.reset();
    }

    pub async fn clear_chat(&self) {
        log::info!("Clearing chat");
        self.init_chat().await;
    }

    pub async fn toggle_thinking(&self, value: Option<bool>) {
        self.transcript.lock().await.toggle_thinking(value);
    }

    pub async fn save_history(&self) -> anyhow::Result<()> {
        let messages = self.messages().await;
        storage::save_history(self.store.as_ref(), &messages).await
    }

    /// Replaces the transcript with the saved history. Returns false when none was saved.
    pub async fn load_history(&self) -> anyhow::Result<bool> {
        match storage::load_history(self.store.as_ref()).await? {
            Some(messages) => {
                self.transcript.lock().await.replace_messages(messages);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stops the current send right away. A stream in progress keeps its partial
    /// answer; a send waiting to retry ends with its last error.
    pub async fn stop_generation(&self) -> bool {
        let transcript = self.transcript.lock().await;
        let Some(message) = transcript.streaming_message() else {
            return false;
        };
        match self.stop_signals.get(&message.id) {
            Some(signal) => {
                log::warn!("Stop requested for message {}", message.id);
                signal.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Snapshot of the active config with its API key resolved.
    async fn resolve_config(&self) -> ChatResult<ModelConfig> {
        let snapshot = match self.models.snapshot() {
            Some(config) => config,
            None => {
                let loaded = self
                    .models
                    .load_from(self.store.as_ref())
                    .await
                    .map_err(|e| ChatError::configuration(format!("failed to load model configs: {:#}", e)))?;
                if !loaded {
                    return Err(ChatError::configuration(
                        "no model configured. Please configure an AI model in settings.",
                    ));
                }
                self.models
                    .snapshot()
                    .ok_or_else(|| ChatError::configuration("model config disappeared while loading"))?
            }
        };

        let mut config = (*snapshot).clone();
        config.api_key = resolve_api_key(&config)?;
        Ok(config)
    }

    fn with_system_prompts(&self, history: Vec<ApiMessage>, enable_thinking: bool) -> Vec<ApiMessage> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        if enable_thinking {
            messages.push(ApiMessage::new(Role::System, THINKING_INSTRUCTION));
        }
        if let Some(context) = self.context.context() {
            messages.push(ApiMessage::new(Role::System, context_message(&context)));
        }
        messages.extend(history);
        messages
    }

    /// Sends `user_text` and streams the reply into a placeholder message.
    ///
    /// Transport failures and timeouts are retried up to `max_retries` times with
    /// the same placeholder. When retries run out the placeholder shows the error
    /// and the error is returned. Blank input is ignored and returns `Ok(None)`.
    pub async fn send_streaming(&self, user_text: &str, options: SendOptions) -> ChatResult<Option<StreamResult>> {
        if user_text.trim().is_empty() {
            return Ok(None);
        }

        let config = self.resolve_config().await?;
        let (ticket, mut stop) = {
            let mut transcript = self.transcript.lock().await;
            let ticket = transcript.begin(user_text, options.enable_thinking);
            let (sender, receiver) = watch::channel(false);
            self.stop_signals.insert(ticket.message_id, sender);
            (ticket, StopSignal(receiver))
        };
        log::info!(
            "Streaming message {} with model '{}' (thinking: {})",
            ticket.message_id,
            config.name,
            options.enable_thinking
        );

        let mut attempt = 0;
        loop {
            match self.stream_attempt(&config, ticket, options.enable_thinking, &mut stop).await {
                Ok(result) => {
                    self.transcript.lock().await.complete(&ticket, &result);
                    log::info!(
                        "Stream complete for {}: {} chars, thinking {}",
                        ticket.message_id,
                        result.answer.len(),
                        result.thinking.as_ref().map_or(0, |t| t.len())
                    );
                    self.end_streaming(ticket).await;
                    return Ok(Some(result));
                }
                Err(ChatError::Cancelled) => {
                    log::warn!("Send for {} was superseded", ticket.message_id);
                    self.stop_signals.remove(&ticket.message_id);
                    return Err(ChatError::Cancelled);
                }
                Err(e) if e.is_retryable() && attempt < options.max_retries && !stop.is_requested() => {
                    attempt += 1;
                    log::warn!(
                        "Stream attempt failed: {}. Retry {} of {} in {:?}",
                        e,
                        attempt,
                        options.max_retries,
                        self.settings.retry_backoff
                    );
                    if !self.transcript.lock().await.set_phase(&ticket, SendPhase::Retrying) {
                        self.stop_signals.remove(&ticket.message_id);
                        return Err(ChatError::Cancelled);
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.retry_backoff) => {}
                        _ = stop.requested() => {
                            log::warn!("Stopped while waiting to retry {}", ticket.message_id);
                            self.transcript.lock().await.fail(&ticket, e.user_message());
                            self.end_streaming(ticket).await;
                            return Err(e);
                        }
                    }
                }
                Err(e) => {
                    log::error!("Stream request for {} failed: {}", ticket.message_id, e);
                    self.transcript.lock().await.fail(&ticket, e.user_message());
                    self.end_streaming(ticket).await;
                    return Err(e);
                }
            }
        }
    }

    // Leaves the index set for a moment so the UI can paint the final update.
    async fn end_streaming(&self, ticket: StreamTicket) {
        tokio::time::sleep(self.settings.grace_delay).await;
        self.stop_signals.remove(&ticket.message_id);
        if self.transcript.lock().await.end_streaming(&ticket) {
            log::debug!("Cleared streaming state for {}", ticket.message_id);
        }
    }

    async fn stream_attempt(
        &self,
        config: &ModelConfig,
        ticket: StreamTicket,
        enable_thinking: bool,
        stop: &mut StopSignal,
    ) -> ChatResult<StreamResult> {
        let history = {
            let mut transcript = self.transcript.lock().await;
            if !transcript.reset_placeholder(&ticket) {
                return Err(ChatError::Cancelled);
            }
            transcript.set_phase(&ticket, SendPhase::Sending);
            transcript.outgoing(&ticket)
        };
        let messages = self.with_system_prompts(history, enable_thinking);
        let request = self.builder.build(config, messages, &RequestOptions::streaming())?;

        // The watchdog covers connecting and each wait for the next chunk, not the whole reply.
        let stream = tokio::select! {
            biased;
            _ = stop.requested() => {
                log::warn!("Stopped before {} connected", ticket.message_id);
                return Ok(StreamResult::default());
            }
            opened = tokio::time::timeout(self.settings.request_timeout, self.provider.open_stream(&request)) => {
                opened.map_err(|_| {
                    log::warn!("Stream request timed out after {:?}", self.settings.request_timeout);
                    ChatError::Timeout
                })??
            }
        };
        self.read_stream(stream, ticket, stop).await
    }

    async fn read_stream(&self, mut stream: ByteStream, ticket: StreamTicket, stop: &mut StopSignal) -> ChatResult<StreamResult> {
        self.transcript.lock().await.set_phase(&ticket, SendPhase::Streaming);

        let mut decoder = StreamDecoder::new();
        let mut pacer = PacingScheduler::new(self.settings.pacing_interval);

        loop {
            let next = tokio::select! {
                biased;
                _ = stop.requested() => {
                    log::warn!("Stop requested for message {}. Stopping stream.", ticket.message_id);
                    break;
                }
                next = tokio::time::timeout(self.settings.request_timeout, stream.next()) => next,
            };
            let Some(chunk) = next.map_err(|_| {
                log::warn!("No data from stream for {:?}", self.settings.request_timeout);
                ChatError::Timeout
            })?
            else {
                break;
            };
            let chunk = chunk?;
            for delta in decoder.feed(&chunk) {
                self.deliver(&mut pacer, ticket, delta).await?;
            }
        }

        let (tail, result) = decoder.finish();
        for delta in tail {
            self.deliver(&mut pacer, ticket, delta).await?;
        }
        Ok(result)
    }

    async fn deliver(&self, pacer: &mut PacingScheduler, ticket: StreamTicket, delta: Delta) -> ChatResult<()> {
        let transcript = self.transcript.clone();
        let applied = pacer
            .schedule(delta, move |delta| async move {
                let applied = transcript.lock().await.apply_delta(&ticket, &delta);
                applied
            })
            .await;
        if applied {
            Ok(())
        } else {
            Err(ChatError::Cancelled)
        }
    }

    /// Non-streaming request with the active model. Never retried.
    pub async fn send_once(&self, messages: Vec<ApiMessage>, options: RequestOptions) -> ChatResult<Completion> {
        let config = self.resolve_config().await?;
        self.complete_with(&config, messages, &options).await
    }

    async fn complete_with(&self, config: &ModelConfig, messages: Vec<ApiMessage>, options: &RequestOptions) -> ChatResult<Completion> {
        let request = self.builder.build(config, messages, &RequestOptions { stream: false, ..options.clone() })?;
        let body = tokio::time::timeout(self.settings.request_timeout, self.provider.send(&request))
            .await
            .map_err(|_| ChatError::Timeout)??;
        parse_completion(body)
    }

    pub async fn run_task(&self, task: &Task) -> ChatResult<String> {
        log::info!("Running task {}", task.name());
        match self.send_once(task.messages(), RequestOptions::default()).await {
            Ok(completion) => Ok(completion.text),
            Err(e) => {
                log::error!("Task {} failed: {}", task.name(), e);
                Err(e)
            }
        }
    }

    /// Sends a short probe with `config` without changing the active model.
    pub async fn test_connection(&self, config: &ModelConfig) -> ConnectionReport {
        if config.api_url.trim().is_empty() {
            return ConnectionReport {
                success: false,
                message: "Invalid configuration: missing API URL".to_string(),
            };
        }

        let mut probe = config.clone();
        let outcome = match resolve_api_key(config) {
            Ok(key) => {
                probe.api_key = key;
                let messages = vec![ApiMessage::new(Role::User, CONNECTION_PROBE)];
                let options = RequestOptions {
                    max_tokens: Some(20),
                    ..RequestOptions::default()
                };
                self.complete_with(&probe, messages, &options).await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(completion) => ConnectionReport {
                success: true,
                message: format!("Connected! API response: {}", completion.text),
            },
            Err(e) => {
                log::error!("Connection test for '{}' failed: {}", config.name, e);
                ConnectionReport {
                    success: false,
                    message: format!("Connection failed: {}", e),
                }
            }
        }
    }
}
