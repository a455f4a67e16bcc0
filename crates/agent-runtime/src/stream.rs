use serde::{Deserialize, Serialize};

/// Events emitted by a model backend while streaming one response.
/// Provider-agnostic; adapters translate their wire format into these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamEvent {
    /// A chunk of assistant text
    TextDelta { text: String },
    /// A fragment of a tool call. Fragments sharing an `index` belong to the
    /// same call; `id` and `name` usually arrive on the first one only.
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments_delta: String,
    },
    /// Token accounting increment; several per response are summed
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
    /// The entire message is complete
    MessageEnd { stop_reason: StopReason },
    /// The backend reported a failure in-band
    Error { message: String },
}

impl StreamEvent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::TextDelta { text: text.into() }
    }

    /// A complete tool call in a single fragment.
    pub fn tool_call(
        index: usize,
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self::ToolCallDelta {
            index,
            id: Some(id.into()),
            name: Some(name.into()),
            arguments_delta: arguments.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum StopReason {
    /// Normal end of response
    EndTurn,
    /// Model wants to use tools
    ToolUse,
    /// Hit max tokens limit
    MaxTokens,
    /// Stopped by stop sequence
    StopSequence,
}
