use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use officechat_lib::api::{ByteStream, LLMApiProvider, ResponseBody};
use officechat_lib::config::{ClientSettings, ModelConfigStore};
use officechat_lib::context::SharedContext;
use officechat_lib::error::{ChatError, ChatResult};
use officechat_lib::models::{ChatMessage, ModelConfig, Role};
use officechat_lib::request::{ApiMessage, ChatRequest, RequestOptions};
use officechat_lib::session::{ChatSession, SendOptions, THINKING_INSTRUCTION};
use officechat_lib::storage::MemoryStore;
use officechat_lib::tasks::Task;
use officechat_lib::transcript::SendPhase;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

enum Script {
    Fail(u16),
    Chunks(Vec<&'static str>),
    // Each chunk arrives after the given delay
    Slow(Vec<&'static str>, Duration),
    Hang,
}

struct ScriptedProvider {
    streams: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ChatRequest>>,
    completion: Value,
}

impl ScriptedProvider {
    fn new(streams: Vec<Script>) -> Arc<Self> {
        Self::with_completion(streams, json!({"choices": [{"message": {"content": "=SUM(A1:A3)"}}]}))
    }

    fn with_completion(streams: Vec<Script>, completion: Value) -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(streams.into()),
            requests: Mutex::new(Vec::new()),
            completion,
        })
    }

    fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LLMApiProvider for ScriptedProvider {
    async fn open_stream(&self, request: &ChatRequest) -> ChatResult<ByteStream> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self.streams.lock().unwrap().pop_front().unwrap_or(Script::Hang);
        match script {
            Script::Fail(status) => Err(ChatError::Status {
                status,
                body: "upstream failure".to_string(),
            }),
            Script::Chunks(chunks) => Ok(Box::pin(futures::stream::iter(
                chunks.into_iter().map(|c| Ok(Bytes::from_static(c.as_bytes()))),
            ))),
            Script::Slow(chunks, delay) => Ok(Box::pin(futures::stream::iter(chunks).then(move |c| async move {
                tokio::time::sleep(delay).await;
                Ok(Bytes::from_static(c.as_bytes()))
            }))),
            Script::Hang => Ok(Box::pin(futures::stream::pending::<ChatResult<Bytes>>())),
        }
    }

    async fn send(&self, request: &ChatRequest) -> ChatResult<ResponseBody> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(ResponseBody::Json(self.completion.clone()))
    }
}

fn model() -> ModelConfig {
    ModelConfig {
        id: "test-model".to_string(),
        name: "Test Model".to_string(),
        api_url: "https://llm.example.test/v1/chat/completions".to_string(),
        api_key: "sk-test".to_string(),
        model: Some("test-1".to_string()),
        temperature: None,
        max_tokens: None,
    }
}

fn session_with(provider: Arc<ScriptedProvider>, models: ModelConfigStore) -> (ChatSession, Arc<SharedContext>) {
    let context = Arc::new(SharedContext::new());
    let session = ChatSession::new(
        models,
        Arc::new(MemoryStore::new()),
        provider,
        context.clone(),
        ClientSettings::default(),
    );
    (session, context)
}

fn session(provider: Arc<ScriptedProvider>) -> (ChatSession, Arc<SharedContext>) {
    let models = ModelConfigStore::new();
    models.swap(model()).unwrap();
    session_with(provider, models)
}

const HELLO: &[&str] = &[
    "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\ndata: [DONE]\n",
];

fn count_role(messages: &[ChatMessage], role: Role) -> usize {
    messages.iter().filter(|m| m.role == role).count()
}

#[tokio::test(start_paused = true)]
async fn streams_answer_into_placeholder() {
    let provider = ScriptedProvider::new(vec![Script::Chunks(HELLO.to_vec())]);
    let (session, _) = session(provider.clone());

    let result = session
        .send_streaming("hi", SendOptions { enable_thinking: false, ..SendOptions::default() })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.answer, "Hello");
    assert!(result.ended);
    assert_eq!(result.thinking, None);

    let transcript = session.transcript();
    let transcript = transcript.lock().await;
    assert_eq!(transcript.messages().len(), 3);
    assert_eq!(transcript.messages()[1].content, "hi");
    let reply = transcript.last_message().unwrap();
    assert_eq!(reply.role, Role::Assistant);
    assert_eq!(reply.content, "Hello");
    assert_eq!(reply.thinking, None);
    assert_eq!(transcript.streaming_index(), None);
    assert_eq!(transcript.phase(), SendPhase::Completed);
    assert!(!transcript.is_loading());

    let requests = provider.requests();
    let body = &requests[0].body;
    assert_eq!(body.stream, Some(true));
    assert_eq!(body.model.as_deref(), Some("test-1"));
}

#[tokio::test(start_paused = true)]
async fn thinking_goes_to_its_own_field() {
    let provider = ScriptedProvider::new(vec![Script::Chunks(vec![
        "data: {\"choices\":[{\"delta\":{\"content\":\"<think\"}}]}\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"ing>plan</thin\"}}]}\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"king>Answer\"}}]}\n",
        "data: [DONE]\n",
    ])]);
    let (session, _) = session(provider);

    let result = session.send_streaming("hi", SendOptions::default()).await.unwrap().unwrap();
    assert_eq!(result.answer, "Answer");
    assert_eq!(result.thinking.as_deref(), Some("plan"));

    let transcript = session.transcript();
    let transcript = transcript.lock().await;
    let reply = transcript.last_message().unwrap();
    assert_eq!(reply.content, "Answer");
    assert_eq!(reply.thinking.as_deref(), Some("plan"));
    assert!(transcript.show_thinking());
}

#[tokio::test(start_paused = true)]
async fn system_prompts_precede_history() {
    let provider = ScriptedProvider::new(vec![Script::Chunks(HELLO.to_vec()), Script::Chunks(HELLO.to_vec())]);
    let (session, context) = session(provider.clone());
    context.set(Some(json!({"address": "Sheet1!A1:B2"})));

    session.send_streaming("first", SendOptions::default()).await.unwrap();
    context.set(None);
    session
        .send_streaming("second", SendOptions { enable_thinking: false, ..SendOptions::default() })
        .await
        .unwrap();

    let requests = provider.requests();
    let first = &requests[0].body.messages;
    assert_eq!(first[0], ApiMessage::new(Role::System, THINKING_INSTRUCTION));
    assert_eq!(first[1].role, Role::System);
    assert!(first[1].content.starts_with("Current context: "));
    assert!(first[1].content.contains("Sheet1!A1:B2"));
    assert_eq!(first.last(), Some(&ApiMessage::new(Role::User, "first")));
    // Greeting plus the user message; the placeholder is never sent
    assert_eq!(first.len(), 4);

    let second = &requests[1].body.messages;
    assert!(second.iter().all(|m| m.role != Role::System));
    assert_eq!(
        second.iter().map(|m| m.content.as_str()).collect::<Vec<_>>()[1..],
        ["first", "Hello", "second"]
    );
}

#[tokio::test(start_paused = true)]
async fn retries_then_reports_one_error() {
    let provider = ScriptedProvider::new(vec![Script::Fail(500), Script::Fail(502), Script::Fail(503)]);
    let (session, _) = session(provider.clone());

    let err = session.send_streaming("hi", SendOptions::default()).await.unwrap_err();
    assert!(matches!(err, ChatError::Status { status: 503, .. }));
    assert_eq!(provider.requests().len(), 3);

    let transcript = session.transcript();
    let transcript = transcript.lock().await;
    assert_eq!(count_role(transcript.messages(), Role::Assistant), 2);
    let reply = transcript.last_message().unwrap();
    assert_eq!(reply.content, err.user_message());
    assert_eq!(transcript.error(), Some(err.user_message().as_str()));
    assert_eq!(transcript.streaming_index(), None);
    assert_eq!(transcript.phase(), SendPhase::Failed);
}

#[tokio::test(start_paused = true)]
async fn retry_reuses_the_placeholder() {
    let provider = ScriptedProvider::new(vec![Script::Fail(503), Script::Chunks(HELLO.to_vec())]);
    let (session, _) = session(provider.clone());

    let result = session.send_streaming("hi", SendOptions::default()).await.unwrap().unwrap();
    assert_eq!(result.answer, "Hello");
    assert_eq!(provider.requests().len(), 2);

    let messages = session.messages().await;
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[2].content, "Hello");
}

#[tokio::test(start_paused = true)]
async fn zero_retries_fails_on_first_error() {
    let provider = ScriptedProvider::new(vec![Script::Fail(500), Script::Chunks(HELLO.to_vec())]);
    let (session, _) = session(provider.clone());

    let options = SendOptions { max_retries: 0, ..SendOptions::default() };
    assert!(session.send_streaming("hi", options).await.is_err());
    assert_eq!(provider.requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn timeout_is_reported_distinctly() {
    let provider = ScriptedProvider::new(vec![Script::Hang, Script::Hang, Script::Hang]);
    let (session, _) = session(provider.clone());

    let err = session.send_streaming("hi", SendOptions::default()).await.unwrap_err();
    assert!(matches!(err, ChatError::Timeout));
    assert_eq!(provider.requests().len(), 3);
    let messages = session.messages().await;
    assert_eq!(messages.last().unwrap().content, ChatError::Timeout.user_message());
}

#[tokio::test(start_paused = true)]
async fn second_send_supersedes_the_first() {
    let provider = ScriptedProvider::new(vec![Script::Hang, Script::Chunks(HELLO.to_vec())]);
    let (session, _) = session(provider);

    let first = {
        let session = session.clone();
        tokio::spawn(async move { session.send_streaming("first", SendOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    {
        let transcript = session.transcript();
        assert!(transcript.lock().await.streaming_index().is_some());
    }

    session.send_streaming("second", SendOptions::default()).await.unwrap();
    {
        let transcript = session.transcript();
        let transcript = transcript.lock().await;
        // The empty placeholder of the first send was dropped
        assert_eq!(count_role(transcript.messages(), Role::Assistant), 2);
        assert_eq!(count_role(transcript.messages(), Role::User), 2);
        assert_eq!(transcript.last_message().unwrap().content, "Hello");
        assert_eq!(transcript.streaming_index(), None);
    }

    // The stalled send times out and finds its placeholder gone
    let outcome = first.await.unwrap();
    assert!(matches!(outcome, Err(ChatError::Cancelled)));
    let messages = session.messages().await;
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[3].content, "Hello");
}

#[tokio::test(start_paused = true)]
async fn stop_keeps_the_partial_answer() {
    let provider = ScriptedProvider::new(vec![Script::Slow(HELLO.to_vec(), Duration::from_millis(100))]);
    let (session, _) = session(provider);

    let send = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .send_streaming("hi", SendOptions { enable_thinking: false, ..SendOptions::default() })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(session.stop_generation().await);

    let result = send.await.unwrap().unwrap().unwrap();
    assert_eq!(result.answer, "Hel");
    assert!(!result.ended);
    let messages = session.messages().await;
    assert_eq!(messages.last().unwrap().content, "Hel");
    assert!(!session.stop_generation().await);
}

#[tokio::test(start_paused = true)]
async fn missing_model_leaves_transcript_untouched() {
    let provider = ScriptedProvider::new(vec![Script::Chunks(HELLO.to_vec())]);
    let (session, _) = session_with(provider.clone(), ModelConfigStore::new());

    let err = session.send_streaming("hi", SendOptions::default()).await.unwrap_err();
    assert!(matches!(err, ChatError::Configuration(_)));
    assert_eq!(session.messages().await.len(), 1);
    assert!(provider.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn blank_input_is_ignored() {
    let provider = ScriptedProvider::new(vec![]);
    let (session, _) = session(provider.clone());

    assert!(session.send_streaming("   ", SendOptions::default()).await.unwrap().is_none());
    assert_eq!(session.messages().await.len(), 1);
    assert!(provider.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn history_survives_a_round_trip() {
    let provider = ScriptedProvider::new(vec![Script::Chunks(HELLO.to_vec())]);
    let (session, _) = session(provider);

    session.send_streaming("hi", SendOptions::default()).await.unwrap();
    session.save_history().await.unwrap();
    session.clear_chat().await;
    assert_eq!(session.messages().await.len(), 1);

    assert!(session.load_history().await.unwrap());
    let messages = session.messages().await;
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[2].content, "Hello");
}

#[tokio::test]
async fn send_once_does_not_stream() {
    let provider = ScriptedProvider::new(vec![]);
    let (session, _) = session(provider.clone());

    let options = RequestOptions { temperature: Some(0.1), ..RequestOptions::default() };
    let completion = session
        .send_once(vec![ApiMessage::new(Role::User, "sum")], options)
        .await
        .unwrap();
    assert_eq!(completion.text, "=SUM(A1:A3)");
    assert_eq!(completion.role, Role::Assistant);

    let requests = provider.requests();
    let body = &requests[0].body;
    assert_eq!(body.stream, None);
    assert_eq!(body.temperature, 0.1);
    assert_eq!(body.max_tokens, 2000);
}

#[tokio::test]
async fn run_task_sends_task_prompts() {
    let provider = ScriptedProvider::new(vec![]);
    let (session, _) = session(provider.clone());

    let task = Task::GenerateFormula {
        requirement: "add up the first three rows".to_string(),
    };
    assert_eq!(session.run_task(&task).await.unwrap(), "=SUM(A1:A3)");
    assert_eq!(provider.requests()[0].body.messages, task.messages());
    // Tasks do not touch the chat
    assert_eq!(session.messages().await.len(), 1);
}

#[tokio::test]
async fn connection_test_reports_the_reply() {
    let provider = ScriptedProvider::with_completion(vec![], json!({"content": "connection test succeeded", "role": "assistant"}));
    let (session, _) = session_with(provider.clone(), ModelConfigStore::new());

    let report = session.test_connection(&model()).await;
    assert!(report.success);
    assert_eq!(report.message, "Connected! API response: connection test succeeded");
    assert_eq!(provider.requests()[0].body.max_tokens, 20);
    // The probed config does not become active
    assert!(session.models().snapshot().is_none());

    let mut broken = model();
    broken.api_url = String::new();
    let report = session.test_connection(&broken).await;
    assert!(!report.success);
    assert_eq!(provider.requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn long_steady_stream_is_not_cut_off() {
    let mut chunks = vec!["data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n"; 70];
    chunks.push("data: [DONE]\n");
    // 71 seconds in total, one chunk per second
    let provider = ScriptedProvider::new(vec![Script::Slow(chunks, Duration::from_secs(1))]);
    let (session, _) = session(provider.clone());

    let result = session
        .send_streaming("write a lot", SendOptions { enable_thinking: false, ..SendOptions::default() })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.answer, "x".repeat(70));
    assert!(result.ended);
    assert_eq!(provider.requests().len(), 1);
    assert_eq!(session.messages().await.last().unwrap().content, "x".repeat(70));
}

#[tokio::test(start_paused = true)]
async fn stop_during_a_stall_ends_at_once() {
    let provider = ScriptedProvider::new(vec![Script::Hang]);
    let (session, _) = session(provider.clone());

    let started = Instant::now();
    let send = {
        let session = session.clone();
        tokio::spawn(async move { session.send_streaming("hi", SendOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(session.stop_generation().await);

    let result = send.await.unwrap().unwrap().unwrap();
    assert_eq!(result.answer, "");
    // Only the grace delay passes after the stop
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(provider.requests().len(), 1);

    let transcript = session.transcript();
    let transcript = transcript.lock().await;
    assert_eq!(transcript.phase(), SendPhase::Completed);
    assert_eq!(transcript.streaming_index(), None);
    assert_eq!(transcript.error(), None);
}

#[tokio::test(start_paused = true)]
async fn stop_during_retry_backoff_sends_nothing_more() {
    let provider = ScriptedProvider::new(vec![Script::Fail(503), Script::Chunks(HELLO.to_vec())]);
    let (session, _) = session(provider.clone());

    let started = Instant::now();
    let send = {
        let session = session.clone();
        tokio::spawn(async move { session.send_streaming("hi", SendOptions::default()).await })
    };
    // The backoff is one second
    tokio::time::sleep(Duration::from_millis(300)).await;
    {
        let transcript = session.transcript();
        assert_eq!(transcript.lock().await.phase(), SendPhase::Retrying);
    }
    assert!(session.stop_generation().await);

    let err = send.await.unwrap().unwrap_err();
    assert!(matches!(err, ChatError::Status { status: 503, .. }));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(provider.requests().len(), 1);

    let messages = session.messages().await;
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[2].content, err.user_message());
}

#[tokio::test(start_paused = true)]
async fn stalled_stream_times_out_per_chunk() {
    let provider = ScriptedProvider::new(vec![
        Script::Slow(vec![HELLO[0], HELLO[1]], Duration::from_secs(61)),
        Script::Chunks(HELLO.to_vec()),
    ]);
    let (session, _) = session(provider.clone());

    let result = session.send_streaming("hi", SendOptions::default()).await.unwrap().unwrap();
    assert_eq!(result.answer, "Hello");
    assert_eq!(provider.requests().len(), 2);
}
