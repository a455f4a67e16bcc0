pub mod message;
pub mod control;
pub mod coroutine;
pub mod tool;
pub mod registry;
pub mod settings;
pub mod permission;
pub mod stream;
pub mod provider;
pub mod bridge;
pub mod executor;
pub mod orchestrator;
pub mod store;
pub mod config;

pub use message::{ErrorSource, Message, MessageKind, Sender, Transcript, PERMISSION_OPTIONS};
pub use control::{CompletionReason, ControlKind, ControlSignal, ExecutionResult, Usage};
pub use coroutine::{Coroutine, ProtocolError, Step, Yielder};
pub use tool::{EchoTool, Tool, ToolCall, ToolContext, ToolDefinition, ToolError, ToolResult, TrustLevel};
pub use registry::{RegistryError, ToolRegistry};
pub use settings::{FileSettingsStore, MemorySettingsStore, PermissionRecord, SettingsError, SettingsStore};
pub use permission::{PermissionChoice, PermissionDecision, PermissionGate};
pub use stream::{StopReason, StreamEvent};
pub use provider::{BackendError, EventStream, ModelBackend, ModelRequest};
pub use bridge::{ChatMessage, ChatRole, CompletionBridge, CompletionError, CompletionProvider};
pub use executor::{RoundExecutor, RoundParams};
pub use orchestrator::{frame_prompt, IterationOrchestrator};
pub use store::{MemoryMessageStore, MessageStore};
pub use config::{ConfigError, RuntimeConfig, DEFAULT_MAX_ITERATIONS};

#[cfg(any(test, feature = "test-utils"))]
pub use provider::mock;
