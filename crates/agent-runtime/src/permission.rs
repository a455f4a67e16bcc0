//! Tool permission gate.
//!
//! Tools with [`TrustLevel::None`] run straight away. Everything else is
//! checked against the persisted allow/deny lists and, when neither list
//! mentions the tool, the gate suspends with a `choice` message and waits for
//! the human's selection in the next control signal's `response_message`.

use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::control::{CompletionReason, ControlSignal, ExecutionResult, Usage};
use crate::coroutine::Yielder;
use crate::message::{ErrorSource, Message, MessageKind, Transcript, PERMISSION_OPTIONS};
use crate::settings::SettingsStore;
use crate::tool::{Tool, ToolCall, ToolContext, ToolError, TrustLevel};

/// Outcome of the non-interactive part of a permission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    Approved,
    Denied(String),
    NeedsConfirmation,
}

/// A human's answer to a permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionChoice {
    Allow,
    AlwaysAllow,
    Deny,
    AlwaysDeny,
}

impl PermissionChoice {
    const ALL: [PermissionChoice; 4] = [
        PermissionChoice::Allow,
        PermissionChoice::AlwaysAllow,
        PermissionChoice::Deny,
        PermissionChoice::AlwaysDeny,
    ];

    pub fn label(self) -> &'static str {
        PERMISSION_OPTIONS[self as usize]
    }

    /// Parse a selection: an option label (case-insensitive) or its 0-based
    /// index in the offered options.
    pub fn parse(selection: &str) -> Option<Self> {
        let selection = selection.trim();
        if let Some(choice) = Self::ALL
            .iter()
            .copied()
            .find(|c| c.label().eq_ignore_ascii_case(selection))
        {
            return Some(choice);
        }
        selection
            .parse::<usize>()
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    /// Read the selection out of a resume signal's response message.
    pub fn from_response(response: Option<&Message>) -> Option<Self> {
        let message = response?;
        let selection = match &message.kind {
            MessageKind::UserChoice(meta) => meta.selected.as_str(),
            _ => message.content.as_str(),
        };
        Self::parse(selection)
    }

    pub fn executes(self) -> bool {
        matches!(self, PermissionChoice::Allow | PermissionChoice::AlwaysAllow)
    }
}

/// Decides, per invocation, whether a tool runs.
#[derive(Clone)]
pub struct PermissionGate {
    settings: Arc<dyn SettingsStore>,
}

impl PermissionGate {
    pub fn new(settings: Arc<dyn SettingsStore>) -> Self {
        Self { settings }
    }

    /// Decide without asking anyone. Settings-store failures degrade to a
    /// prompt rather than a silent allow or deny.
    pub async fn check(&self, tool_name: &str, trust_level: TrustLevel) -> PermissionDecision {
        if !trust_level.requires_permission() {
            return PermissionDecision::Approved;
        }

        match self.settings.is_denied(tool_name).await {
            Ok(true) => {
                return PermissionDecision::Denied(format!(
                    "Permission denied: tool '{}' is on the deny list",
                    tool_name
                ))
            }
            Ok(false) => {}
            Err(e) => warn!(tool = tool_name, error = %e, "deny-list lookup failed"),
        }

        match self.settings.is_allowed(tool_name).await {
            Ok(true) => PermissionDecision::Approved,
            Ok(false) => PermissionDecision::NeedsConfirmation,
            Err(e) => {
                warn!(tool = tool_name, error = %e, "allow-list lookup failed");
                PermissionDecision::NeedsConfirmation
            }
        }
    }

    /// Gate and, if permitted, run one tool call.
    ///
    /// Every path yields at least one message through `co` and ends in a
    /// well-formed result; `usage.tools_used` is 1 only when the tool ran.
    pub async fn dispatch(
        &self,
        tool: &dyn Tool,
        call: &ToolCall,
        working_directory: &Path,
        co: &mut Yielder,
    ) -> ExecutionResult {
        let def = tool.definition();
        let mut produced = Transcript::new();

        match self.check(&def.name, def.trust_level).await {
            PermissionDecision::Approved => {}
            PermissionDecision::Denied(reason) => {
                debug!(tool = %def.name, "denied by persisted record");
                let denial = Message::tool_error(ErrorSource::PermissionDenied, &def.name, reason);
                return emit_final(denial, co, produced, Usage::default()).await;
            }
            PermissionDecision::NeedsConfirmation => {
                let prompt =
                    Message::permission_choice(tool.describe(&call.parameters), &def.name, &call.id);
                produced.upsert(prompt.clone());
                let control = co.suspend(prompt).await;
                if control.is_abort() {
                    return ExecutionResult::from_transcript(
                        produced,
                        CompletionReason::Aborted,
                        Usage::default(),
                    );
                }

                if let Some(denial) = self.apply_choice(&def.name, &control).await {
                    return emit_final(denial, co, produced, Usage::default()).await;
                }
            }
        }

        self.execute(tool, &def.name, call, working_directory, co, produced)
            .await
    }

    /// Act on the human's selection. Returns the denial message when the tool
    /// must not run.
    async fn apply_choice(&self, tool_name: &str, control: &ControlSignal) -> Option<Message> {
        let Some(choice) = PermissionChoice::from_response(control.response_message.as_ref())
        else {
            warn!(tool = tool_name, "unrecognised permission selection, treating as deny");
            return Some(Message::tool_error(
                ErrorSource::InvalidChoice,
                tool_name,
                format!(
                    "Unrecognised permission selection for tool '{}'; expected one of {}. The tool was not run.",
                    tool_name,
                    PERMISSION_OPTIONS.join(", ")
                ),
            ));
        };

        info!(tool = tool_name, choice = choice.label(), "permission decision");
        match choice {
            PermissionChoice::AlwaysAllow => {
                if let Err(e) = self.settings.add_allowed(tool_name).await {
                    warn!(tool = tool_name, error = %e, "failed to persist allow decision");
                }
            }
            PermissionChoice::AlwaysDeny => {
                if let Err(e) = self.settings.add_denied(tool_name).await {
                    warn!(tool = tool_name, error = %e, "failed to persist deny decision");
                }
            }
            PermissionChoice::Allow | PermissionChoice::Deny => {}
        }

        if choice.executes() {
            None
        } else {
            Some(Message::tool_error(
                ErrorSource::PermissionDenied,
                tool_name,
                format!("Permission denied: the user declined to run tool '{}'", tool_name),
            ))
        }
    }

    async fn execute(
        &self,
        tool: &dyn Tool,
        tool_name: &str,
        call: &ToolCall,
        working_directory: &Path,
        co: &mut Yielder,
        mut produced: Transcript,
    ) -> ExecutionResult {
        let usage = Usage {
            tools_used: 1,
            ..Usage::default()
        };

        let mut ctx = ToolContext::new(working_directory, co);
        let outcome = tool.execute(call.parameters.clone(), &mut ctx).await;
        produced.extend(ctx.take_emitted());

        let message = match outcome {
            Ok(result) => Message::tool_result(tool_name, &call.id, result.content, result.is_error),
            Err(ToolError::Aborted) => {
                debug!(tool = tool_name, "tool aborted by caller");
                return ExecutionResult::from_transcript(produced, CompletionReason::Aborted, usage);
            }
            Err(e) => {
                warn!(tool = tool_name, error = %e, "tool execution failed");
                Message::tool_error(ErrorSource::Tool, tool_name, format!("Tool error: {}", e))
            }
        };

        emit_final(message, co, produced, usage).await
    }
}

/// Yield the closing message of a dispatch and build its result.
async fn emit_final(
    message: Message,
    co: &mut Yielder,
    mut produced: Transcript,
    usage: Usage,
) -> ExecutionResult {
    produced.upsert(message.clone());
    if co.suspend(message).await.is_abort() {
        ExecutionResult::from_transcript(produced, CompletionReason::Aborted, usage)
    } else {
        ExecutionResult::finished(produced, usage)
    }
}

/// Arguments rendered for prompts, truncated so huge payloads stay readable.
pub(crate) fn preview_arguments(parameters: &Value) -> String {
    const LIMIT: usize = 200;
    let rendered = parameters.to_string();
    if rendered.chars().count() <= LIMIT {
        return rendered;
    }
    let mut truncated: String = rendered.chars().take(LIMIT).collect();
    truncated.push('…');
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MemorySettingsStore;

    #[test]
    fn test_parse_labels_case_insensitive() {
        assert_eq!(PermissionChoice::parse("allow"), Some(PermissionChoice::Allow));
        assert_eq!(
            PermissionChoice::parse(" Always Allow "),
            Some(PermissionChoice::AlwaysAllow)
        );
        assert_eq!(PermissionChoice::parse("DENY"), Some(PermissionChoice::Deny));
        assert_eq!(
            PermissionChoice::parse("always deny"),
            Some(PermissionChoice::AlwaysDeny)
        );
    }

    #[test]
    fn test_parse_index_and_out_of_range() {
        assert_eq!(PermissionChoice::parse("0"), Some(PermissionChoice::Allow));
        assert_eq!(PermissionChoice::parse("3"), Some(PermissionChoice::AlwaysDeny));
        assert_eq!(PermissionChoice::parse("4"), None);
        assert_eq!(PermissionChoice::parse("maybe"), None);
        assert_eq!(PermissionChoice::parse(""), None);
    }

    #[test]
    fn test_from_response_prefers_user_choice_metadata() {
        let mut msg = Message::user_choice("Always Allow");
        msg.content = "something else".to_string();
        assert_eq!(
            PermissionChoice::from_response(Some(&msg)),
            Some(PermissionChoice::AlwaysAllow)
        );
        assert_eq!(
            PermissionChoice::from_response(Some(&Message::user("Deny"))),
            Some(PermissionChoice::Deny)
        );
        assert_eq!(PermissionChoice::from_response(None), None);
    }

    #[test]
    fn test_labels_match_offered_options() {
        let labels: Vec<_> = PermissionChoice::ALL.iter().map(|c| c.label()).collect();
        assert_eq!(labels, PERMISSION_OPTIONS.to_vec());
    }

    #[tokio::test]
    async fn test_check_trust_none_skips_lookup() {
        let store = Arc::new(MemorySettingsStore::new());
        store.add_denied("echo").await.unwrap();
        let gate = PermissionGate::new(store);
        assert_eq!(
            gate.check("echo", TrustLevel::None).await,
            PermissionDecision::Approved
        );
    }

    #[tokio::test]
    async fn test_check_consults_lists() {
        let store = Arc::new(MemorySettingsStore::new());
        store.add_denied("rm").await.unwrap();
        store.add_allowed("ls").await.unwrap();
        let gate = PermissionGate::new(store);

        assert!(matches!(
            gate.check("rm", TrustLevel::Strict).await,
            PermissionDecision::Denied(_)
        ));
        assert_eq!(
            gate.check("ls", TrustLevel::Loose).await,
            PermissionDecision::Approved
        );
        assert_eq!(
            gate.check("cat", TrustLevel::Loose).await,
            PermissionDecision::NeedsConfirmation
        );
    }

    #[test]
    fn test_preview_arguments_truncates() {
        let long = serde_json::json!({"text": "x".repeat(500)});
        let preview = preview_arguments(&long);
        assert!(preview.ends_with('…'));
        assert_eq!(preview.chars().count(), 201);
    }
}
