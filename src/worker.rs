use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::TriggerPolicy;
use crate::sandbox::{ExecutionRequest, RunOutcome, Sandbox, Stage};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SubmitError {
    #[error("another run is still in progress")]
    Busy,
    #[error("run worker has stopped")]
    WorkerStopped,
}

struct RunMessage {
    request: ExecutionRequest,
    cancel: CancellationToken,
    responder: oneshot::Sender<RunOutcome>,
}

struct Shared {
    policy: TriggerPolicy,
    /// Tokens of submitted runs not yet answered, in run order; the front
    /// one is executing or about to. Locked across each send so the order
    /// matches the channel.
    runs: Mutex<VecDeque<CancellationToken>>,
    shutdown: CancellationToken,
}

/// Caller-side handle to the run worker, cheap to clone
#[derive(Clone)]
pub struct RunHandle {
    tx: mpsc::UnboundedSender<RunMessage>,
    shared: Arc<Shared>,
}

impl RunHandle {
    /// Hands a request to the worker and returns where its outcome will arrive
    pub fn submit(
        &self,
        request: ExecutionRequest,
    ) -> Result<oneshot::Receiver<RunOutcome>, SubmitError> {
        let mut runs = self.shared.runs.lock();
        if self.shared.policy == TriggerPolicy::Reject && !runs.is_empty() {
            return Err(SubmitError::Busy);
        }

        let (responder, rx) = oneshot::channel();
        let cancel = self.shared.shutdown.child_token();
        let message = RunMessage {
            request,
            cancel: cancel.clone(),
            responder,
        };
        if self.tx.send(message).is_err() {
            return Err(SubmitError::WorkerStopped);
        }
        runs.push_back(cancel);
        Ok(rx)
    }

    /// Submits a request and waits for its outcome
    pub async fn run(&self, request: ExecutionRequest) -> Result<RunOutcome, SubmitError> {
        let rx = self.submit(request)?;
        rx.await.map_err(|_| SubmitError::WorkerStopped)
    }

    /// Kills the in-flight run, or the next one if the worker has not picked
    /// it up yet; returns whether there was one
    pub fn abort(&self) -> bool {
        match self.shared.runs.lock().front() {
            Some(token) => {
                log::info!("Abort requested for the current run");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_busy(&self) -> bool {
        !self.shared.runs.lock().is_empty()
    }
}

/// Starts the worker task that executes runs one after another
///
/// Runs never overlap. Cancelling `shutdown` aborts the in-flight run and
/// stops the worker; queued requests are then answered by a closed channel.
pub fn spawn_worker(
    sandbox: Sandbox,
    policy: TriggerPolicy,
    shutdown: CancellationToken,
) -> (RunHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        policy,
        runs: Mutex::new(VecDeque::new()),
        shutdown,
    });

    let handle = tokio::spawn(worker(Arc::new(sandbox), rx, shared.clone()));
    (RunHandle { tx, shared }, handle)
}

async fn worker(
    sandbox: Arc<Sandbox>,
    mut rx: mpsc::UnboundedReceiver<RunMessage>,
    shared: Arc<Shared>,
) {
    log::info!("Run worker initialized ({:?} policy)", shared.policy);

    loop {
        let message = tokio::select! {
            _ = shared.shutdown.cancelled() => {
                log::info!("Run worker received shutdown signal, stopping");
                break;
            }
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let RunMessage {
            request,
            cancel,
            responder,
        } = message;

        if cancel.is_cancelled() {
            log::info!("Run aborted before it started");
            finish(&shared, responder, RunOutcome::Aborted { stage: Stage::Compile });
            continue;
        }

        // Spawn the run so a panic inside it stays at this task boundary
        let sandbox_ref = Arc::clone(&sandbox);
        let run_handle = tokio::spawn(async move { sandbox_ref.run(&request, &cancel).await });

        let outcome = match run_handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Run task failed: {e}");
                RunOutcome::LaunchFailure {
                    reason: "internal sandbox error".to_string(),
                }
            }
        };
        log::info!("Run finished: {}", outcome.label());
        finish(&shared, responder, outcome);
    }

    // Senders see a closed channel from here on, so nothing is pushed after
    // the queue is cleared
    drop(rx);
    shared.runs.lock().clear();
    log::info!("Run worker has shut down gracefully");
}

fn finish(shared: &Shared, responder: oneshot::Sender<RunOutcome>, outcome: RunOutcome) {
    shared.runs.lock().pop_front();
    if responder.send(outcome).is_err() {
        log::warn!("Run outcome dropped, caller went away");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;

    #[tokio::test]
    async fn test_empty_source_round_trip() {
        let shutdown = CancellationToken::new();
        let (handle, _join) = spawn_worker(
            Sandbox::new(SandboxConfig::default()),
            TriggerPolicy::Reject,
            shutdown.clone(),
        );

        let outcome = handle.run(ExecutionRequest::new("", "")).await.unwrap();

        assert_eq!(outcome, RunOutcome::EmptySource);
        assert!(!handle.is_busy());
        assert!(!handle.abort());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let shutdown = CancellationToken::new();
        let (handle, join) = spawn_worker(
            Sandbox::new(SandboxConfig::default()),
            TriggerPolicy::Queue,
            shutdown.clone(),
        );

        shutdown.cancel();
        join.await.unwrap();

        assert_eq!(
            handle.run(ExecutionRequest::new("int main(){}", "")).await,
            Err(SubmitError::WorkerStopped)
        );
        assert!(!handle.is_busy());
    }

    #[tokio::test]
    async fn test_abort_right_after_submit() {
        let shutdown = CancellationToken::new();
        let (handle, _join) = spawn_worker(
            Sandbox::new(SandboxConfig::default()),
            TriggerPolicy::Reject,
            shutdown.clone(),
        );

        let pending = handle
            .submit(ExecutionRequest::new("int main(){}", ""))
            .unwrap();
        assert!(handle.abort());

        let outcome = pending.await.unwrap();
        assert!(matches!(outcome, RunOutcome::Aborted { .. }), "{outcome:?}");
        assert!(!handle.is_busy());
        shutdown.cancel();
    }
}
