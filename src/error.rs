use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Debug, Error)]
pub enum ChatError {
    /// No usable model configuration. Never retried.
    #[error("model is not configured: {0}")]
    Configuration(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP error! status: {status}")]
    Status { status: u16, body: String },

    #[error("request timed out")]
    Timeout,

    /// A newer send took over the streaming placeholder.
    #[error("request superseded by a newer message")]
    Cancelled,

    #[error("malformed stream event: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ChatError {
    pub fn configuration(message: impl Into<String>) -> Self {
        let message = message.into();
        log::warn!("Configuration error: {}", message);
        ChatError::Configuration(message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        ChatError::Transport(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::Transport(_) | ChatError::Status { .. } | ChatError::Timeout
        )
    }

    /// Text written into the transcript when retries are exhausted.
    pub fn user_message(&self) -> String {
        match self {
            ChatError::Timeout => "Sorry, an error occurred: the request timed out".to_string(),
            other => format!("Sorry, an error occurred: {}", other),
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ChatError::Timeout
        } else {
            ChatError::Transport(err.to_string())
        }
    }
}
