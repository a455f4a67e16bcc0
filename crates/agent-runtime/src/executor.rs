use futures::StreamExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::control::{CompletionReason, ExecutionResult, Usage};
use crate::coroutine::{Coroutine, Yielder};
use crate::message::{ErrorSource, Message};
use crate::permission::PermissionGate;
use crate::provider::{BackendError, ModelBackend, ModelRequest};
use crate::registry::ToolRegistry;
use crate::stream::StreamEvent;
use crate::tool::{resolve_working_directory, ToolCall};

/// Input to a single round.
#[derive(Debug, Clone, Default)]
pub struct RoundParams {
    pub prompt: String,
    /// Prior conversation, oldest first
    pub messages: Vec<Message>,
}

impl RoundParams {
    pub fn new(prompt: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            prompt: prompt.into(),
            messages,
        }
    }
}

/// Drives one exchange with the model backend and resolves every tool call
/// it asks for.
///
/// Flow: stream text (yielding the growing agent message) → collect tool-call
/// fragments → parse → gate and run each call in order.
#[derive(Clone)]
pub struct RoundExecutor {
    backend: Arc<dyn ModelBackend>,
    registry: Arc<ToolRegistry>,
    gate: PermissionGate,
    working_directory: PathBuf,
    temperature: f32,
    max_tokens: u32,
    surface_malformed_tool_calls: bool,
}

/// How the streaming phase ended.
enum StreamOutcome {
    /// End of stream; tool-call fragments collected by index
    Finished(BTreeMap<usize, PendingToolCall>),
    /// Backend failed and the error message was delivered
    Failed,
    Aborted,
}

#[derive(Debug, Default)]
struct PendingToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

impl PendingToolCall {
    /// Some backends repeat the full name on every fragment, others split it.
    fn merge_name(&mut self, fragment: &str) {
        if self.name.is_empty() || fragment.starts_with(self.name.as_str()) {
            self.name = fragment.to_string();
        } else {
            self.name.push_str(fragment);
        }
    }

    /// Parse the accumulated fragments. Empty arguments read as `{}`;
    /// anything that is not a JSON object is malformed.
    fn parse(self) -> Result<ToolCall, String> {
        if self.name.trim().is_empty() {
            return Err("tool call has no name".to_string());
        }
        let parameters = if self.arguments.trim().is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str::<Value>(&self.arguments)
                .map_err(|e| format!("invalid arguments for '{}': {}", self.name, e))?
        };
        if !parameters.is_object() {
            return Err(format!("arguments for '{}' are not a JSON object", self.name));
        }
        let id = self
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple()));
        Ok(ToolCall {
            id,
            name: self.name,
            parameters,
        })
    }
}

impl RoundExecutor {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        registry: Arc<ToolRegistry>,
        gate: PermissionGate,
    ) -> Self {
        let defaults = RuntimeConfig::default();
        Self {
            backend,
            registry,
            gate,
            working_directory: resolve_working_directory(None),
            temperature: defaults.temperature,
            max_tokens: defaults.max_tokens,
            surface_malformed_tool_calls: defaults.surface_malformed_tool_calls,
        }
    }

    /// Build an executor whose gate uses the settings store `config` names.
    pub fn from_config(
        backend: Arc<dyn ModelBackend>,
        registry: Arc<ToolRegistry>,
        config: &RuntimeConfig,
    ) -> Self {
        Self::new(backend, registry, PermissionGate::new(config.settings_store())).with_config(config)
    }

    /// Apply the round-level settings from `config`.
    pub fn with_config(mut self, config: &RuntimeConfig) -> Self {
        self.temperature = config.temperature;
        self.max_tokens = config.max_tokens;
        self.surface_malformed_tool_calls = config.surface_malformed_tool_calls;
        self.working_directory = resolve_working_directory(config.working_directory.as_deref());
        self
    }

    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.temperature = temp;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = max;
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = dir.into();
        self
    }

    pub fn with_surface_malformed_tool_calls(mut self, surface: bool) -> Self {
        self.surface_malformed_tool_calls = surface;
        self
    }

    /// Start a round. Nothing happens until the first
    /// [`resume`](Coroutine::resume).
    pub fn run_single_round(&self, params: RoundParams) -> Coroutine {
        let executor = self.clone();
        Coroutine::spawn("round", move |mut co| async move {
            executor.drive(params, &mut co).await
        })
    }

    async fn drive(&self, params: RoundParams, co: &mut Yielder) -> ExecutionResult {
        let agent_id = Uuid::new_v4().to_string();
        let mut usage = Usage::default();

        let request = ModelRequest {
            prompt: params.prompt,
            history: params.messages,
            tools: self.registry.list(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        debug!(
            backend = self.backend.name(),
            history = request.history.len(),
            tools = request.tools.len(),
            "Starting round"
        );

        let pending = match self.stream_response(request, &agent_id, &mut usage, co).await {
            StreamOutcome::Finished(pending) => pending,
            StreamOutcome::Failed => return ExecutionResult::finished(co.take_produced(), usage),
            StreamOutcome::Aborted => return aborted(co, usage),
        };

        let Some(calls) = self.resolve_tool_calls(pending, co).await else {
            return aborted(co, usage);
        };

        if !calls.is_empty() {
            info!(count = calls.len(), "Executing tool calls");
        }
        for call in calls {
            let Some(tool) = self.registry.get(&call.name) else {
                warn!(tool = %call.name, "model requested unknown tool");
                let message = Message::tool_error(
                    ErrorSource::UnknownTool,
                    &call.name,
                    format!("Unknown tool: {}", call.name),
                );
                if co.suspend(message).await.is_abort() {
                    return aborted(co, usage);
                }
                continue;
            };

            let outcome = self
                .gate
                .dispatch(tool.as_ref(), &call, &self.working_directory, co)
                .await;
            usage += Usage {
                tools_used: outcome.usage.tools_used,
                ..Usage::default()
            };
            if outcome.is_aborted() {
                return aborted(co, usage);
            }
        }

        debug!(
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            tools_used = usage.tools_used,
            "Round complete"
        );
        ExecutionResult::finished(co.take_produced(), usage)
    }

    async fn stream_response(
        &self,
        request: ModelRequest,
        agent_id: &str,
        usage: &mut Usage,
        co: &mut Yielder,
    ) -> StreamOutcome {
        let mut stream = match self.backend.stream(request).await {
            Ok(stream) => stream,
            Err(e) => return self.fail(e, co).await,
        };

        let mut text = String::new();
        let mut pending: BTreeMap<usize, PendingToolCall> = BTreeMap::new();

        while let Some(event) = stream.next().await {
            match event {
                Ok(StreamEvent::TextDelta { text: fragment }) => {
                    if fragment.is_empty() {
                        continue;
                    }
                    text.push_str(&fragment);
                    let control = co.suspend(Message::agent(agent_id, text.clone())).await;
                    if control.is_abort() {
                        return StreamOutcome::Aborted;
                    }
                }
                Ok(StreamEvent::ToolCallDelta {
                    index,
                    id,
                    name,
                    arguments_delta,
                }) => {
                    let entry = pending.entry(index).or_default();
                    if let Some(id) = id {
                        entry.id = Some(id);
                    }
                    if let Some(name) = name {
                        entry.merge_name(&name);
                    }
                    entry.arguments.push_str(&arguments_delta);
                }
                Ok(StreamEvent::Usage {
                    input_tokens,
                    output_tokens,
                }) => {
                    usage.input_tokens += input_tokens;
                    usage.output_tokens += output_tokens;
                }
                Ok(StreamEvent::MessageEnd { stop_reason }) => {
                    debug!(?stop_reason, "Model response complete");
                }
                Ok(StreamEvent::Error { message }) => {
                    return self.fail(BackendError::Stream(message), co).await;
                }
                Err(e) => return self.fail(e, co).await,
            }
        }

        StreamOutcome::Finished(pending)
    }

    /// Turn a backend failure into a single `error` message.
    async fn fail(&self, error: BackendError, co: &mut Yielder) -> StreamOutcome {
        warn!(backend = self.backend.name(), error = %error, "Model backend failed");
        let message = Message::error(ErrorSource::Backend, format!("Model backend error: {}", error));
        if co.suspend(message).await.is_abort() {
            StreamOutcome::Aborted
        } else {
            StreamOutcome::Failed
        }
    }

    /// Parse collected fragments in index order. Malformed calls are dropped,
    /// or reported when configured to. `None` means the caller aborted while a
    /// report was pending.
    async fn resolve_tool_calls(
        &self,
        pending: BTreeMap<usize, PendingToolCall>,
        co: &mut Yielder,
    ) -> Option<Vec<ToolCall>> {
        let mut calls = Vec::with_capacity(pending.len());
        for (index, fragment) in pending {
            match fragment.parse() {
                Ok(call) => calls.push(call),
                Err(reason) => {
                    warn!(index, reason = %reason, "Dropping malformed tool call");
                    if self.surface_malformed_tool_calls {
                        let message = Message::error(
                            ErrorSource::MalformedToolCall,
                            format!("Malformed tool call dropped: {}", reason),
                        );
                        if co.suspend(message).await.is_abort() {
                            return None;
                        }
                    }
                }
            }
        }
        Some(calls)
    }
}

fn aborted(co: &mut Yielder, usage: Usage) -> ExecutionResult {
    debug!("Round aborted by caller");
    ExecutionResult::from_transcript(co.take_produced(), CompletionReason::Aborted, usage)
}
