//! Resumable computations driven by [`ControlSignal`]s.
//!
//! A [`Coroutine`] is the caller's handle: each [`Coroutine::resume`] hands a
//! control signal in and returns the next [`Step`], either a yielded
//! [`Message`] or the terminal [`ExecutionResult`]. Inside, the computation
//! holds a [`Yielder`] and calls [`Yielder::suspend`] at every suspension
//! point. The two sides talk over a pair of capacity-one channels, so at most
//! one step is ever in flight.
//!
//! The body does not start until the first resume. If that first signal is an
//! abort, the body never runs and the result is an empty aborted one.

use std::future::Future;

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::control::{ControlSignal, ExecutionResult, Usage};
use crate::message::{Message, Transcript};

/// What a resumption produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// The computation emitted a message and is suspended again.
    Yielded(Message),
    /// The computation is done. Further resumes are protocol errors.
    Finished(ExecutionResult),
}

/// Caller-side misuse of a coroutine handle, or a crashed body.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("resume called while a previous resume is still in flight")]
    ResumeInFlight,
    #[error("resume called on a finished computation")]
    Finished,
    #[error("computation terminated without producing a result")]
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Suspended,
    Running,
    Finished,
}

/// Caller handle to a running computation.
pub struct Coroutine {
    label: &'static str,
    control_tx: mpsc::Sender<ControlSignal>,
    step_rx: mpsc::Receiver<Step>,
    state: State,
}

impl Coroutine {
    /// Host `body` on the async runtime. Must be called from within a Tokio
    /// runtime.
    pub fn spawn<F, Fut>(label: &'static str, body: F) -> Self
    where
        F: FnOnce(Yielder) -> Fut + Send + 'static,
        Fut: Future<Output = ExecutionResult> + Send + 'static,
    {
        let (control_tx, mut control_rx) = mpsc::channel::<ControlSignal>(1);
        let (step_tx, step_rx) = mpsc::channel::<Step>(1);
        let finish_tx = step_tx.clone();

        tokio::spawn(async move {
            let Some(initial) = control_rx.recv().await else {
                debug!(label, "coroutine dropped before first resume");
                return;
            };

            let result = if initial.is_abort() {
                debug!(label, "aborted before start");
                ExecutionResult::aborted(Vec::new(), Usage::default())
            } else {
                let co = Yielder {
                    control_rx,
                    step_tx,
                    produced: Transcript::new(),
                    last_control: initial,
                };
                body(co).await
            };

            // The handle may already be gone; nobody is left to tell.
            let _ = finish_tx.send(Step::Finished(result)).await;
        });

        Self {
            label,
            control_tx,
            step_rx,
            state: State::Suspended,
        }
    }

    /// Resume with `control` and wait for the next step.
    ///
    /// The first call starts the computation. If a previous resume future was
    /// dropped before it returned, the handle refuses further resumes.
    pub async fn resume(&mut self, control: ControlSignal) -> Result<Step, ProtocolError> {
        match self.state {
            State::Running => return Err(ProtocolError::ResumeInFlight),
            State::Finished => return Err(ProtocolError::Finished),
            State::Suspended => {}
        }
        self.state = State::Running;

        if self.control_tx.send(control).await.is_err() {
            self.state = State::Finished;
            error!(label = self.label, "computation exited while suspended");
            return Err(ProtocolError::Terminated);
        }

        match self.step_rx.recv().await {
            Some(step) => {
                self.state = match step {
                    Step::Finished(_) => State::Finished,
                    Step::Yielded(_) => State::Suspended,
                };
                Ok(step)
            }
            None => {
                self.state = State::Finished;
                error!(label = self.label, "computation terminated without a result");
                Err(ProtocolError::Terminated)
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    /// Drive to completion, answering every yielded message with the signal
    /// `on_message` returns.
    pub async fn run_with<F>(mut self, mut on_message: F) -> Result<ExecutionResult, ProtocolError>
    where
        F: FnMut(&Message) -> ControlSignal,
    {
        let mut control = ControlSignal::proceed();
        loop {
            match self.resume(control).await? {
                Step::Yielded(message) => control = on_message(&message),
                Step::Finished(result) => return Ok(result),
            }
        }
    }

    /// Drive to completion answering every yield with `continue`.
    pub async fn run_to_completion(self) -> Result<ExecutionResult, ProtocolError> {
        self.run_with(|_| ControlSignal::proceed()).await
    }
}

/// The computation's side of the channel.
///
/// Every message passed to [`suspend`](Self::suspend) is also recorded
/// (upsert-by-id) so an aborting body can report what it produced so far.
pub struct Yielder {
    control_rx: mpsc::Receiver<ControlSignal>,
    step_tx: mpsc::Sender<Step>,
    produced: Transcript,
    last_control: ControlSignal,
}

impl Yielder {
    /// Yield `message` and wait for the caller's next signal.
    ///
    /// A dropped caller handle reads as an abort.
    pub async fn suspend(&mut self, message: Message) -> ControlSignal {
        self.produced.upsert(message.clone());

        if self.step_tx.send(Step::Yielded(message)).await.is_err() {
            self.last_control = ControlSignal::abort();
            return ControlSignal::abort();
        }

        let control = self
            .control_rx
            .recv()
            .await
            .unwrap_or_else(ControlSignal::abort);
        self.last_control = control.clone();
        control
    }

    /// The signal delivered by the most recent resumption.
    pub fn last_control(&self) -> &ControlSignal {
        &self.last_control
    }

    /// Everything yielded so far, collapsed by id.
    pub fn produced(&self) -> &Transcript {
        &self.produced
    }

    pub fn take_produced(&mut self) -> Transcript {
        std::mem::take(&mut self.produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::CompletionReason;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn counting_body(count: usize) -> Coroutine {
        Coroutine::spawn("test", move |mut co| async move {
            for i in 0..count {
                let signal = co.suspend(Message::agent("m", format!("{i}"))).await;
                if signal.is_abort() {
                    let produced = co.take_produced();
                    return ExecutionResult::from_transcript(
                        produced,
                        CompletionReason::Aborted,
                        Usage::default(),
                    );
                }
            }
            ExecutionResult::from_transcript(
                co.take_produced(),
                CompletionReason::Completed,
                Usage::default(),
            )
        })
    }

    #[tokio::test]
    async fn test_yields_then_finishes() {
        let mut co = counting_body(2);
        assert!(matches!(
            co.resume(ControlSignal::proceed()).await.unwrap(),
            Step::Yielded(m) if m.content == "0"
        ));
        assert!(matches!(
            co.resume(ControlSignal::proceed()).await.unwrap(),
            Step::Yielded(m) if m.content == "1"
        ));
        match co.resume(ControlSignal::proceed()).await.unwrap() {
            Step::Finished(result) => {
                assert_eq!(result.completion_reason, CompletionReason::Completed);
                // Same id, collapsed to the last update.
                assert_eq!(result.messages.len(), 1);
                assert_eq!(result.messages[0].content, "1");
            }
            other => panic!("expected finish, got {other:?}"),
        }
        assert!(co.is_finished());
    }

    #[tokio::test]
    async fn test_resume_after_finish_is_rejected() {
        let mut co = counting_body(0);
        assert!(matches!(
            co.resume(ControlSignal::proceed()).await.unwrap(),
            Step::Finished(_)
        ));
        assert_eq!(
            co.resume(ControlSignal::proceed()).await.unwrap_err(),
            ProtocolError::Finished
        );
    }

    #[tokio::test]
    async fn test_abort_before_start_skips_body() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let mut co = Coroutine::spawn("never", move |_co| async move {
            flag.store(true, Ordering::SeqCst);
            ExecutionResult::completed(Vec::new(), Usage::default())
        });
        match co.resume(ControlSignal::abort()).await.unwrap() {
            Step::Finished(result) => {
                assert!(result.is_aborted());
                assert!(result.messages.is_empty());
            }
            other => panic!("expected finish, got {other:?}"),
        }
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_abort_mid_run() {
        let mut co = counting_body(5);
        co.resume(ControlSignal::proceed()).await.unwrap();
        match co.resume(ControlSignal::abort()).await.unwrap() {
            Step::Finished(result) => {
                assert!(result.is_aborted());
                assert_eq!(result.messages.len(), 1);
                assert_eq!(result.messages[0].content, "0");
            }
            other => panic!("expected finish, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dropped_resume_blocks_further_resumes() {
        let mut co = Coroutine::spawn("slow", |mut co| async move {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            co.suspend(Message::user("late")).await;
            ExecutionResult::completed(Vec::new(), Usage::default())
        });

        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            co.resume(ControlSignal::proceed()),
        )
        .await;
        assert!(pending.is_err());
        assert_eq!(
            co.resume(ControlSignal::proceed()).await.unwrap_err(),
            ProtocolError::ResumeInFlight
        );
    }

    #[tokio::test]
    async fn test_panicking_body_terminates() {
        let mut co = Coroutine::spawn("boom", |_co| async move {
            if true {
                panic!("boom");
            }
            ExecutionResult::completed(Vec::new(), Usage::default())
        });
        assert_eq!(
            co.resume(ControlSignal::proceed()).await.unwrap_err(),
            ProtocolError::Terminated
        );
        assert!(co.is_finished());
    }

    #[tokio::test]
    async fn test_run_with_answers_each_yield() {
        let mut seen = Vec::new();
        let result = counting_body(3)
            .run_with(|m| {
                seen.push(m.content.clone());
                ControlSignal::proceed()
            })
            .await
            .unwrap();
        assert_eq!(seen, vec!["0", "1", "2"]);
        assert_eq!(result.completion_reason, CompletionReason::Completed);
    }
}
