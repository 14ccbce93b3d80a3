//! Keyboard-Interactive Authentication (2FA) Support
//!
//! The server sends rounds of prompts; a [`PromptResponder`] supplied by the
//! host application answers them. Two responders ship with the engine:
//!
//! - [`PasswordResponder`] answers every hidden prompt with a fixed password
//! - [`ChannelResponder`] forwards each round as a [`KbiPromptEvent`] to a UI
//!   task and waits (60s max) for its answers
//!
//! ```text
//! Auth engine                        Host application
//!    │                                     │
//!    │──── KbiPromptEvent ────────────────▶│ InfoRequest from server
//!    │                                     │
//!    │◀─── event.respond(answers) ─────────│ User responses
//! ```

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;
use zeroize::Zeroizing;

/// How long a UI responder may take for one round of prompts.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Keyboard-Interactive prompt from server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KbiPrompt {
    /// The prompt text to display
    pub prompt: String,
    /// true = show input (echo), false = mask input (password-style)
    pub echo: bool,
}

/// One round of prompts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KbiRequest {
    /// Display name from server (may be empty)
    pub name: String,
    /// Instructions from server (may be empty)
    pub instructions: String,
    pub prompts: Vec<KbiPrompt>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KbiError {
    #[error("Authentication cancelled by user")]
    Cancelled,

    #[error("Authentication timeout ({}s)", RESPONSE_TIMEOUT.as_secs())]
    Timeout,

    #[error("Expected {expected} responses, got {got}")]
    ResponseCount { expected: usize, got: usize },

    #[error("Channel error: {0}")]
    ChannelError(String),
}

/// Answers keyboard-interactive prompts.
///
/// Responses must be in prompt order, one per prompt.
#[async_trait]
pub trait PromptResponder: Send + Sync {
    async fn respond(&self, request: &KbiRequest) -> Result<Vec<String>, KbiError>;
}

/// Answers hidden prompts with a password and echoed prompts with "".
pub struct PasswordResponder {
    password: Zeroizing<String>,
}

impl PasswordResponder {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: Zeroizing::new(password.into()),
        }
    }
}

#[async_trait]
impl PromptResponder for PasswordResponder {
    async fn respond(&self, request: &KbiRequest) -> Result<Vec<String>, KbiError> {
        Ok(request
            .prompts
            .iter()
            .map(|p| {
                if p.echo {
                    String::new()
                } else {
                    self.password.to_string()
                }
            })
            .collect())
    }
}

/// A round of prompts waiting for the host application.
#[derive(Debug)]
pub struct KbiPromptEvent {
    /// Unique ID for this authentication flow
    pub auth_flow_id: String,
    pub request: KbiRequest,
    reply: oneshot::Sender<Result<Vec<String>, KbiError>>,
}

impl KbiPromptEvent {
    pub fn respond(self, responses: Vec<String>) {
        // receiver gone means the flow already timed out
        let _ = self.reply.send(Ok(responses));
    }

    pub fn cancel(self) {
        let _ = self.reply.send(Err(KbiError::Cancelled));
    }
}

/// Forwards prompt rounds to a host-side receiver.
pub struct ChannelResponder {
    auth_flow_id: String,
    events: mpsc::Sender<KbiPromptEvent>,
    timeout: Duration,
}

impl ChannelResponder {
    pub fn new() -> (Self, mpsc::Receiver<KbiPromptEvent>) {
        let (events, rx) = mpsc::channel(4);
        (
            Self {
                auth_flow_id: Uuid::new_v4().to_string(),
                events,
                timeout: RESPONSE_TIMEOUT,
            },
            rx,
        )
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn auth_flow_id(&self) -> &str {
        &self.auth_flow_id
    }
}

#[async_trait]
impl PromptResponder for ChannelResponder {
    async fn respond(&self, request: &KbiRequest) -> Result<Vec<String>, KbiError> {
        let (reply, reply_rx) = oneshot::channel();
        self.events
            .send(KbiPromptEvent {
                auth_flow_id: self.auth_flow_id.clone(),
                request: request.clone(),
                reply,
            })
            .await
            .map_err(|_| KbiError::ChannelError("prompt receiver dropped".to_string()))?;

        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(KbiError::Cancelled),
            Err(_) => Err(KbiError::Timeout),
        }
    }
}

/// Check a responder's answers against the prompts they answer.
pub fn check_responses(request: &KbiRequest, responses: &[String]) -> Result<(), KbiError> {
    if request.prompts.len() != responses.len() {
        return Err(KbiError::ResponseCount {
            expected: request.prompts.len(),
            got: responses.len(),
        });
    }
    Ok(())
}
