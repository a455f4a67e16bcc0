use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::message::{Message, Transcript};

/// Where a caller keeps a conversation's history between runs.
///
/// Writes are upserts by message id, never plain appends.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn upsert(&self, message: Message);

    /// Upsert every message in order.
    async fn upsert_all(&self, messages: Vec<Message>) {
        for message in messages {
            self.upsert(message).await;
        }
    }

    /// Drop the current history and install `messages`, e.g. a summary.
    async fn replace(&self, messages: Vec<Message>);

    async fn history(&self) -> Vec<Message>;
}

/// In-process message store backed by a [`Transcript`].
#[derive(Default)]
pub struct MemoryMessageStore {
    transcript: RwLock<Transcript>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.transcript.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.transcript.read().await.is_empty()
    }

    /// Approximate token count using character count / 4 heuristic.
    pub async fn approximate_tokens(&self) -> usize {
        let chars: usize = self
            .transcript
            .read()
            .await
            .messages()
            .iter()
            .map(|m| m.content.len())
            .sum();
        chars / 4
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn upsert(&self, message: Message) {
        self.transcript.write().await.upsert(message);
    }

    async fn replace(&self, messages: Vec<Message>) {
        *self.transcript.write().await = messages.into_iter().collect();
    }

    async fn history(&self) -> Vec<Message> {
        self.transcript.read().await.messages().to_vec()
    }
}
