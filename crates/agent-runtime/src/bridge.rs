//! Bridge adapter: wraps a non-streaming `CompletionProvider` into a
//! `ModelBackend`.
//!
//! Useful for providers that only offer a plain chat-completion call. The
//! whole reply comes back as a single text fragment, so the round sees one
//! progressive update and never any tool calls. Providers that stream or
//! support tool use should implement `ModelBackend` directly.

use async_trait::async_trait;
use futures::stream;

use crate::message::{Message, MessageKind};
use crate::provider::{BackendError, EventStream, ModelBackend, ModelRequest};
use crate::stream::{StopReason, StreamEvent};

/// A simple chat message for non-streaming providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct CompletionError(pub String);

/// Minimal non-streaming provider.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Send a chat completion request and return the assistant's response text.
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, CompletionError>;
}

pub struct CompletionBridge {
    inner: Box<dyn CompletionProvider>,
    name: String,
}

impl CompletionBridge {
    pub fn new(inner: Box<dyn CompletionProvider>, name: impl Into<String>) -> Self {
        Self {
            inner,
            name: name.into(),
        }
    }
}

/// Map one history entry onto a chat turn. Choice prompts and answers are UI
/// traffic and are left out.
fn to_chat(message: &Message) -> Option<ChatMessage> {
    let (role, content) = match &message.kind {
        MessageKind::User | MessageKind::UserInput => (ChatRole::User, message.content.clone()),
        MessageKind::Agent => (ChatRole::Assistant, message.content.clone()),
        MessageKind::System | MessageKind::Prompt | MessageKind::Summary(_) => {
            (ChatRole::System, message.content.clone())
        }
        MessageKind::Tool(meta) => (
            ChatRole::User,
            format!("[Tool Result ({}): {}]", meta.tool_name, message.content),
        ),
        MessageKind::Error(_) => (ChatRole::User, format!("[Error: {}]", message.content)),
        MessageKind::FileOperation(meta) => (
            ChatRole::User,
            format!("[File {} {}: {}]", meta.operation, meta.path, message.content),
        ),
        MessageKind::Choice(_) | MessageKind::UserChoice(_) => return None,
    };
    Some(ChatMessage { role, content })
}

#[async_trait]
impl ModelBackend for CompletionBridge {
    async fn stream(&self, request: ModelRequest) -> Result<EventStream, BackendError> {
        let mut messages = Vec::with_capacity(request.history.len() + 1);
        if !request.prompt.is_empty() {
            messages.push(ChatMessage {
                role: ChatRole::System,
                content: request.prompt,
            });
        }
        messages.extend(request.history.iter().filter_map(to_chat));

        let response = self
            .inner
            .complete(messages, request.temperature, request.max_tokens)
            .await
            .map_err(|e| BackendError::Other(anyhow::anyhow!("{}", e.0)))?;

        let events = vec![
            Ok(StreamEvent::TextDelta { text: response }),
            Ok(StreamEvent::MessageEnd {
                stop_reason: StopReason::EndTurn,
            }),
        ];
        Ok(Box::pin(stream::iter(events)))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
