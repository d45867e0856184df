// Declare the modules
pub mod api;
pub mod commands;
pub mod config;
pub mod context;
pub mod decoder;
pub mod error;
pub mod models;
pub mod pacing;
pub mod request;
pub mod session;
pub mod state;
pub mod storage;
pub mod tasks;
pub mod transcript;

use anyhow::Context;
use config::ClientSettings;
use models::ChatMessage;
use state::AppState;
use std::io::Write;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

const HELP: &str = "Commands: /clear, /think on|off, /save, /quit. Ctrl-C stops a reply.";

/// Terminal front end: reads prompts from stdin and streams replies to stdout.
pub fn run() -> Result<(), anyhow::Error> {
    // Initialize logging
    env_logger::init();

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(async {
        let settings = ClientSettings::from_env()?;
        let state = AppState::initialize(settings).await?;
        repl(state).await
    })
}

async fn repl(state: AppState) -> Result<(), anyhow::Error> {
    println!("{}", HELP);
    let mut enable_thinking = true;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        match line.trim() {
            "" => continue,
            "/quit" => break,
            "/clear" => {
                if let Err(e) = commands::clear_chat(&state).await {
                    eprintln!("{}", e);
                }
            }
            "/save" => match state.session.save_history().await {
                Ok(()) => println!("History saved."),
                Err(e) => eprintln!("Failed to save history: {:#}", e),
            },
            "/think on" => enable_thinking = true,
            "/think off" => enable_thinking = false,
            text => stream_reply(&state, text.to_string(), enable_thinking).await?,
        }
    }
    Ok(())
}

// Prints the streaming placeholder as it grows.
async fn stream_reply(state: &AppState, text: String, enable_thinking: bool) -> Result<(), anyhow::Error> {
    let worker = state.clone();
    let mut send = tokio::spawn(async move { commands::send_message(&worker, text, enable_thinking).await });

    let transcript = state.session.transcript();
    let mut echo = Echo::default();
    let mut stdout = std::io::stdout();
    let outcome = loop {
        tokio::select! {
            outcome = &mut send => break outcome.context("Send task panicked")?,
            _ = tokio::signal::ctrl_c() => {
                let _ = commands::stop_generation(state).await;
            }
            _ = tokio::time::sleep(Duration::from_millis(50)) => {
                let guard = transcript.lock().await;
                if let Some(message) = guard.streaming_message() {
                    echo.update(message, &mut stdout)?;
                }
            }
        }
    };

    if let Some(message) = state.session.messages().await.last() {
        echo.update(message, &mut stdout)?;
    }
    println!();
    if let Err(e) = outcome {
        log::debug!("Send finished with error: {}", e);
    }
    Ok(())
}

/// Tracks what has been written for one message so only new text is printed.
#[derive(Debug, Default)]
struct Echo {
    message_id: Option<Uuid>,
    printed: String,
}

impl Echo {
    fn update(&mut self, message: &ChatMessage, out: &mut impl Write) -> std::io::Result<()> {
        let same_message = self.message_id == Some(message.id);
        if !same_message || !message.content.starts_with(&self.printed) {
            // A retry or an error message replaced the text
            if !self.printed.is_empty() {
                writeln!(out)?;
            }
            self.printed.clear();
            self.message_id = Some(message.id);
        }
        let new = &message.content[self.printed.len()..];
        if !new.is_empty() {
            write!(out, "{}", new)?;
            out.flush()?;
            self.printed.push_str(new);
        }
        Ok(())
    }
}
