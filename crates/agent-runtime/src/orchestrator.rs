//! Multi-round driver.
//!
//! Each round is a nested [`Coroutine`] from the [`RoundExecutor`]. The
//! orchestrator re-yields every message it produces unchanged and forwards its
//! own caller's control signals back down, so a permission prompt deep inside a
//! round reaches the human exactly as it would from a single round.

use tracing::{debug, error, info};

use crate::config::RuntimeConfig;
use crate::control::{CompletionReason, ControlSignal, ExecutionResult, Usage};
use crate::coroutine::{Coroutine, ProtocolError, Step, Yielder};
use crate::executor::{RoundExecutor, RoundParams};
use crate::message::{ErrorSource, Message};

/// Runs rounds until the agent goes quiet or the iteration budget runs out.
#[derive(Clone)]
pub struct IterationOrchestrator {
    executor: RoundExecutor,
}

impl IterationOrchestrator {
    pub fn new(executor: RoundExecutor) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &RoundExecutor {
        &self.executor
    }

    /// Run with the configured iteration budget.
    pub fn run(&self, params: RoundParams, config: &RuntimeConfig) -> Coroutine {
        self.run_iterations(params, config.max_iterations)
    }

    /// Start a multi-round run of at most `max_iterations` rounds (a budget of
    /// zero still runs one round). Nothing happens until the first resume.
    pub fn run_iterations(&self, params: RoundParams, max_iterations: usize) -> Coroutine {
        let executor = self.executor.clone();
        let max_iterations = max_iterations.max(1);
        Coroutine::spawn("iterations", move |mut co| async move {
            drive_iterations(executor, params, max_iterations, &mut co).await
        })
    }
}

async fn drive_iterations(
    executor: RoundExecutor,
    params: RoundParams,
    max_iterations: usize,
    co: &mut Yielder,
) -> ExecutionResult {
    let RoundParams {
        prompt: base_prompt,
        messages: mut history,
    } = params;
    let mut usage = Usage::default();
    let mut pending = co.last_control().clone();
    let mut reason = CompletionReason::Completed;

    for iteration in 1..=max_iterations {
        info!(iteration, max_iterations, history = history.len(), "Starting iteration");

        let prompt = frame_prompt(&base_prompt, iteration, max_iterations);
        let mut round = executor.run_single_round(RoundParams::new(prompt, history.clone()));

        let outcome = match drive_round(&mut round, &mut pending, co).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(iteration, error = %e, "Round failed");
                let message = Message::error(
                    ErrorSource::Internal,
                    format!("Iteration {} failed: {}", iteration, e),
                );
                if co.suspend(message).await.is_abort() {
                    reason = CompletionReason::Aborted;
                }
                break;
            }
        };

        usage += outcome.usage;
        if outcome.is_aborted() {
            info!(iteration, "Run aborted");
            reason = CompletionReason::Aborted;
            break;
        }

        let quiet = outcome.messages.is_empty() && outcome.usage.tools_used == 0;

        if pending.apply_history(&mut history, outcome.messages) {
            debug!(iteration, len = history.len(), "History replaced");
        }
        if let Some(payload) = pending.response_payload() {
            history.push(Message::user(payload));
        }
        pending = ControlSignal::proceed();

        if quiet {
            info!(iteration, "No output and no tool use, stopping");
            break;
        }
    }

    debug!(
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        tools_used = usage.tools_used,
        "Run complete"
    );
    let produced = co.take_produced();
    match reason {
        CompletionReason::Completed => ExecutionResult::finished(produced, usage),
        CompletionReason::Aborted => ExecutionResult::from_transcript(produced, reason, usage),
    }
}

/// Resume `round` until it finishes, relaying each yield to our own caller.
/// `pending` always holds the caller's most recent signal.
async fn drive_round(
    round: &mut Coroutine,
    pending: &mut ControlSignal,
    co: &mut Yielder,
) -> Result<ExecutionResult, ProtocolError> {
    loop {
        match round.resume(pending.clone()).await? {
            Step::Yielded(message) => *pending = co.suspend(message).await,
            Step::Finished(result) => return Ok(result),
        }
    }
}

/// Prompt for round `iteration` of `max_iterations` (1-indexed).
pub fn frame_prompt(base: &str, iteration: usize, max_iterations: usize) -> String {
    let mut prompt = format!(
        "{base}\n\nYou are working in iteration {iteration} of at most {max_iterations}. \
         Use tools when they help. When the task is done, reply without any text \
         or tool calls to finish."
    );
    if iteration >= max_iterations {
        prompt.push_str(
            "\n\nThis is your last chance: no further iterations will follow. \
             Give your final answer now.",
        );
    }
    prompt
}
