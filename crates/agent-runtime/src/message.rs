//! The tagged message model that flows through every suspension point.
//!
//! Message ids are not unique over time: a later message with the same id is a
//! progressive update of the earlier one (a growing streamed reply, for
//! example). Anything that stores or aggregates messages goes through
//! [`Transcript::upsert`] so the newer content wins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Labels offered by a permission prompt, in display order.
pub const PERMISSION_OPTIONS: [&str; 4] = ["Allow", "Always Allow", "Deny", "Always Deny"];

/// A single immutable entry in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub content: String,
    #[serde(flatten)]
    pub kind: MessageKind,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
}

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Agent,
    System,
    Tool,
}

/// Closed set of message types. Each variant owns its metadata shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "metadata")]
pub enum MessageKind {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "system")]
    System,
    #[serde(rename = "agent")]
    Agent,
    #[serde(rename = "tool")]
    Tool(ToolMetadata),
    #[serde(rename = "error")]
    Error(ErrorMetadata),
    #[serde(rename = "prompt")]
    Prompt,
    #[serde(rename = "choice")]
    Choice(ChoiceMetadata),
    #[serde(rename = "user-choice")]
    UserChoice(UserChoiceMetadata),
    #[serde(rename = "user-input")]
    UserInput,
    #[serde(rename = "file_operation")]
    FileOperation(FileOperationMetadata),
    #[serde(rename = "summary")]
    Summary(SummaryMetadata),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolMetadata {
    pub tool_name: String,
    pub call_id: String,
    #[serde(default)]
    pub is_error: bool,
}

/// Where an `error` message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSource {
    /// The model backend failed mid-round.
    Backend,
    /// A tool ran and reported a failure.
    Tool,
    /// The model asked for a tool the catalog does not know.
    UnknownTool,
    /// Tool-call arguments could not be parsed.
    MalformedToolCall,
    /// A human or the persisted deny-list refused the invocation.
    PermissionDenied,
    /// The permission prompt was answered with something that is not an option.
    InvalidChoice,
    /// The runtime itself failed (a crashed nested computation).
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMetadata {
    pub source: ErrorSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChoiceMetadata {
    pub options: Vec<String>,
    pub tool_name: String,
    pub call_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserChoiceMetadata {
    pub selected: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOperationMetadata {
    pub path: String,
    pub operation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryMetadata {
    /// How many history entries the summary stands in for.
    pub summarized_count: usize,
}

impl Message {
    /// Build a message with a fresh id.
    pub fn new(kind: MessageKind, sender: Sender, content: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), kind, sender, content)
    }

    /// Build a message under an existing id (a progressive update).
    pub fn with_id(
        id: impl Into<String>,
        kind: MessageKind,
        sender: Sender,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            kind,
            sender,
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageKind::User, Sender::User, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageKind::System, Sender::System, content)
    }

    /// Agent text under a caller-held id, so streamed fragments collapse.
    pub fn agent(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::with_id(id, MessageKind::Agent, Sender::Agent, content)
    }

    pub fn tool_result(
        tool_name: impl Into<String>,
        call_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::new(
            MessageKind::Tool(ToolMetadata {
                tool_name: tool_name.into(),
                call_id: call_id.into(),
                is_error,
            }),
            Sender::Tool,
            content,
        )
    }

    pub fn error(source: ErrorSource, content: impl Into<String>) -> Self {
        Self::new(
            MessageKind::Error(ErrorMetadata {
                source,
                tool_name: None,
            }),
            Sender::System,
            content,
        )
    }

    pub fn tool_error(
        source: ErrorSource,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(
            MessageKind::Error(ErrorMetadata {
                source,
                tool_name: Some(tool_name.into()),
            }),
            Sender::System,
            content,
        )
    }

    /// A permission prompt offering the four standard options.
    pub fn permission_choice(
        description: impl Into<String>,
        tool_name: impl Into<String>,
        call_id: impl Into<String>,
    ) -> Self {
        Self::new(
            MessageKind::Choice(ChoiceMetadata {
                options: PERMISSION_OPTIONS.iter().map(|o| o.to_string()).collect(),
                tool_name: tool_name.into(),
                call_id: call_id.into(),
            }),
            Sender::System,
            description,
        )
    }

    /// A human's answer to a `choice` message.
    pub fn user_choice(selected: impl Into<String>) -> Self {
        let selected = selected.into();
        Self::new(
            MessageKind::UserChoice(UserChoiceMetadata {
                selected: selected.clone(),
            }),
            Sender::User,
            selected,
        )
    }

    pub fn summary(content: impl Into<String>, summarized_count: usize) -> Self {
        Self::new(
            MessageKind::Summary(SummaryMetadata { summarized_count }),
            Sender::System,
            content,
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, MessageKind::Error(_))
    }

    pub fn is_choice(&self) -> bool {
        matches!(self.kind, MessageKind::Choice(_))
    }

    pub fn error_source(&self) -> Option<ErrorSource> {
        match &self.kind {
            MessageKind::Error(meta) => Some(meta.source),
            _ => None,
        }
    }

    /// The wire name of this message's type.
    pub fn type_name(&self) -> &'static str {
        match self.kind {
            MessageKind::User => "user",
            MessageKind::System => "system",
            MessageKind::Agent => "agent",
            MessageKind::Tool(_) => "tool",
            MessageKind::Error(_) => "error",
            MessageKind::Prompt => "prompt",
            MessageKind::Choice(_) => "choice",
            MessageKind::UserChoice(_) => "user-choice",
            MessageKind::UserInput => "user-input",
            MessageKind::FileOperation(_) => "file_operation",
            MessageKind::Summary(_) => "summary",
        }
    }
}

/// Ordered message collection with upsert-by-id semantics.
///
/// A message whose id is already present replaces the stored one in place,
/// keeping the position of the first occurrence.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    messages: Vec<Message>,
    index: HashMap<String, usize>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, message: Message) {
        match self.index.get(&message.id) {
            Some(&pos) => self.messages[pos] = message,
            None => {
                self.index.insert(message.id.clone(), self.messages.len());
                self.messages.push(message);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.index.get(id).map(|&pos| &self.messages[pos])
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.index.clear();
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

impl Extend<Message> for Transcript {
    fn extend<I: IntoIterator<Item = Message>>(&mut self, iter: I) {
        for message in iter {
            self.upsert(message);
        }
    }
}

impl FromIterator<Message> for Transcript {
    fn from_iter<I: IntoIterator<Item = Message>>(iter: I) -> Self {
        let mut transcript = Self::new();
        transcript.extend(iter);
        transcript
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_replaces_same_id() {
        let mut transcript = Transcript::new();
        transcript.upsert(Message::agent("m1", "Hel"));
        transcript.upsert(Message::user("question"));
        transcript.upsert(Message::agent("m1", "Hello"));

        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript.messages()[0].content, "Hello");
        assert_eq!(transcript.get("m1").unwrap().content, "Hello");
    }

    #[test]
    fn test_collect_collapses_progressive_updates() {
        let transcript: Transcript = vec![
            Message::agent("a", "1"),
            Message::agent("a", "12"),
            Message::agent("a", "123"),
        ]
        .into_iter()
        .collect();
        let messages = transcript.into_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "123");
    }

    #[test]
    fn test_permission_choice_has_four_options() {
        let msg = Message::permission_choice("run it?", "bash", "call_1");
        match &msg.kind {
            MessageKind::Choice(meta) => {
                assert_eq!(meta.options, PERMISSION_OPTIONS.to_vec());
                assert_eq!(meta.tool_name, "bash");
            }
            other => panic!("expected choice, got {other:?}"),
        }
        assert!(msg.is_choice());
        assert_eq!(msg.type_name(), "choice");
    }

    #[test]
    fn test_error_source() {
        let msg = Message::tool_error(ErrorSource::PermissionDenied, "rm", "denied");
        assert!(msg.is_error());
        assert_eq!(msg.error_source(), Some(ErrorSource::PermissionDenied));
        assert_eq!(Message::user("hi").error_source(), None);
    }

    #[test]
    fn test_type_tag_serialization() {
        let msg = Message::with_id(
            "x",
            MessageKind::FileOperation(FileOperationMetadata {
                path: "a.txt".to_string(),
                operation: "write".to_string(),
            }),
            Sender::Tool,
            "wrote a.txt",
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "file_operation");
        assert_eq!(json["metadata"]["path"], "a.txt");
        assert_eq!(json["sender"], "tool");
    }
}
