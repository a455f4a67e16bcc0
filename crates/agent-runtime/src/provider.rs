use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::message::Message;
use crate::stream::StreamEvent;
use crate::tool::ToolDefinition;

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, BackendError>> + Send>>;

/// Everything a backend needs for one streamed response.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    /// Iteration-framed system prompt
    pub prompt: String,
    pub history: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Trait for model backends that support tool use and streaming.
///
/// Defined by the consumer (the round executor), not the provider; concrete
/// network adapters live outside this crate.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn stream(&self, request: ModelRequest) -> Result<EventStream, BackendError>;

    /// Backend name for logging/debugging (e.g., "claude", "openai", "ollama")
    fn name(&self) -> &str;
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Network error: {0}")]
    Network(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("Authentication failed")]
    Auth,
    #[error("Stream error: {0}")]
    Stream(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Scripted backend for testing rounds without real API calls.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use crate::stream::StopReason;
    use futures::stream;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// One scripted reply.
    pub enum MockResponse {
        Events(Vec<Result<StreamEvent, BackendError>>),
        /// `stream` itself fails before any event.
        ConnectError(String),
    }

    /// Replays queued responses in FIFO order and records every request.
    /// With the queue empty it answers with an empty response.
    #[derive(Default)]
    pub struct MockBackend {
        responses: Mutex<VecDeque<MockResponse>>,
        requests: Mutex<Vec<ModelRequest>>,
    }

    impl MockBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn queue_events(&self, events: Vec<StreamEvent>) {
            self.queue(MockResponse::Events(events.into_iter().map(Ok).collect()));
        }

        /// Queue a response that fails mid-stream after `events`.
        pub fn queue_failure_after(&self, events: Vec<StreamEvent>, error: &str) {
            let mut items: Vec<_> = events.into_iter().map(Ok).collect();
            items.push(Err(BackendError::Stream(error.to_string())));
            self.queue(MockResponse::Events(items));
        }

        pub fn queue_connect_error(&self, error: &str) {
            self.queue(MockResponse::ConnectError(error.to_string()));
        }

        /// Queue a simple text response split into `fragments`.
        pub fn queue_text(&self, fragments: &[&str]) {
            let mut events: Vec<StreamEvent> =
                fragments.iter().map(|f| StreamEvent::text(*f)).collect();
            events.push(StreamEvent::MessageEnd {
                stop_reason: StopReason::EndTurn,
            });
            self.queue_events(events);
        }

        /// Queue an empty response: no text, no tool calls.
        pub fn queue_empty(&self) {
            self.queue_events(vec![StreamEvent::MessageEnd {
                stop_reason: StopReason::EndTurn,
            }]);
        }

        pub fn requests(&self) -> Vec<ModelRequest> {
            self.requests.lock().unwrap().clone()
        }

        fn queue(&self, response: MockResponse) {
            self.responses.lock().unwrap().push_back(response);
        }
    }

    #[async_trait]
    impl ModelBackend for MockBackend {
        async fn stream(&self, request: ModelRequest) -> Result<EventStream, BackendError> {
            self.requests.lock().unwrap().push(request);
            let response = self.responses.lock().unwrap().pop_front();
            match response {
                Some(MockResponse::Events(items)) => Ok(Box::pin(stream::iter(items))),
                Some(MockResponse::ConnectError(message)) => Err(BackendError::Network(message)),
                None => Ok(Box::pin(stream::iter(vec![Ok(StreamEvent::MessageEnd {
                    stop_reason: StopReason::EndTurn,
                })]))),
            }
        }

        fn name(&self) -> &str {
            "mock"
        }
    }
}
