//! Values that cross a suspension boundary.
//!
//! A [`ControlSignal`] goes *into* a suspended computation to resume it; an
//! [`ExecutionResult`] comes *out* once it is finished.

use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

use crate::message::{Message, Transcript};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    #[default]
    Continue,
    Abort,
}

/// Sent into a suspended round to resume it.
///
/// `replacement_history` wholly replaces the working history and takes
/// precedence over `queued_messages` when both are set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlSignal {
    pub kind: ControlKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_messages: Option<Vec<Message>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement_history: Option<Vec<Message>>,
}

impl ControlSignal {
    /// Plain `continue` with no payload.
    pub fn proceed() -> Self {
        Self::default()
    }

    pub fn abort() -> Self {
        Self {
            kind: ControlKind::Abort,
            ..Self::default()
        }
    }

    /// `continue` carrying a human response (e.g. a permission selection).
    pub fn respond(message: Message) -> Self {
        Self::proceed().with_response(message)
    }

    pub fn with_response(mut self, message: Message) -> Self {
        self.response_message = Some(message);
        self
    }

    pub fn with_queued(mut self, messages: Vec<Message>) -> Self {
        self.queued_messages = Some(messages);
        self
    }

    pub fn with_replacement(mut self, messages: Vec<Message>) -> Self {
        self.replacement_history = Some(messages);
        self
    }

    pub fn is_abort(&self) -> bool {
        self.kind == ControlKind::Abort
    }

    /// Response content, if the response carries any non-blank text.
    pub fn response_payload(&self) -> Option<&str> {
        self.response_message
            .as_ref()
            .map(|m| m.content.as_str())
            .filter(|c| !c.trim().is_empty())
    }

    /// Fold a finished round into `history`: queued messages first, then the
    /// round's own output. A replacement discards both and becomes the whole
    /// history. Returns `true` if the history was replaced.
    pub fn apply_history(&self, history: &mut Vec<Message>, round_output: Vec<Message>) -> bool {
        if let Some(replacement) = &self.replacement_history {
            *history = replacement.clone();
            return true;
        }
        if let Some(queued) = &self.queued_messages {
            history.extend(queued.iter().cloned());
        }
        history.extend(round_output);
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    Completed,
    Aborted,
}

/// Token and tool accounting for a round or a whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Tool invocations that actually executed.
    pub tools_used: u32,
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        self.tools_used += rhs.tools_used;
    }
}

/// Terminal value of a round or of a multi-round run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub messages: Vec<Message>,
    pub completion_reason: CompletionReason,
    pub usage: Usage,
}

impl ExecutionResult {
    pub fn completed(messages: Vec<Message>, usage: Usage) -> Self {
        Self {
            messages,
            completion_reason: CompletionReason::Completed,
            usage,
        }
    }

    pub fn aborted(messages: Vec<Message>, usage: Usage) -> Self {
        Self {
            messages,
            completion_reason: CompletionReason::Aborted,
            usage,
        }
    }

    /// Build a result from a transcript, collapsing same-id updates.
    pub fn from_transcript(transcript: Transcript, reason: CompletionReason, usage: Usage) -> Self {
        Self {
            messages: transcript.into_messages(),
            completion_reason: reason,
            usage,
        }
    }

    /// Result of a run that completed normally. Permission prompts were only
    /// exchanged with the human and are left out, so they never reach
    /// working history. Aborted results keep them.
    pub fn finished(transcript: Transcript, usage: Usage) -> Self {
        let messages = transcript
            .into_messages()
            .into_iter()
            .filter(|m| !m.is_choice())
            .collect();
        Self::completed(messages, usage)
    }

    pub fn is_aborted(&self) -> bool {
        self.completion_reason == CompletionReason::Aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replacement_wins_over_queued() {
        let mut history = vec![Message::user("old")];
        let signal = ControlSignal::proceed()
            .with_queued(vec![Message::user("queued")])
            .with_replacement(vec![Message::summary("summary", 1)]);

        assert!(signal.apply_history(&mut history, vec![Message::agent("a1", "reply")]));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "summary");
    }

    #[test]
    fn test_queued_precede_round_output() {
        let mut history = vec![Message::user("old")];
        let signal = ControlSignal::proceed().with_queued(vec![Message::user("new")]);

        assert!(!signal.apply_history(&mut history, vec![Message::agent("a1", "reply")]));
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["old", "new", "reply"]);
    }

    #[test]
    fn test_response_payload_ignores_blank() {
        assert_eq!(ControlSignal::respond(Message::user("  ")).response_payload(), None);
        assert_eq!(
            ControlSignal::respond(Message::user("yes")).response_payload(),
            Some("yes")
        );
        assert_eq!(ControlSignal::proceed().response_payload(), None);
    }

    #[test]
    fn test_usage_add_assign() {
        let mut total = Usage::default();
        total += Usage {
            input_tokens: 10,
            output_tokens: 5,
            tools_used: 1,
        };
        total += Usage {
            input_tokens: 3,
            output_tokens: 2,
            tools_used: 0,
        };
        assert_eq!(
            total,
            Usage {
                input_tokens: 13,
                output_tokens: 7,
                tools_used: 1
            }
        );
    }

    #[test]
    fn test_finished_drops_permission_prompts() {
        let transcript: Transcript = vec![
            Message::agent("a1", "checking"),
            Message::permission_choice("run echo?", "echo", "c1"),
            Message::tool_result("echo", "c1", "done", false),
        ]
        .into_iter()
        .collect();

        let result = ExecutionResult::finished(transcript.clone(), Usage::default());
        assert_eq!(result.completion_reason, CompletionReason::Completed);
        let types: Vec<_> = result.messages.iter().map(|m| m.type_name()).collect();
        assert_eq!(types, vec!["agent", "tool"]);

        let aborted =
            ExecutionResult::from_transcript(transcript, CompletionReason::Aborted, Usage::default());
        assert_eq!(aborted.messages.len(), 3);
    }

    #[test]
    fn test_abort_signal() {
        assert!(ControlSignal::abort().is_abort());
        assert!(!ControlSignal::proceed().is_abort());
    }
}
