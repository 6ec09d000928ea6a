//! Handles to running operations
//!
//! Each download or export runs in its own tokio task. The caller gets an
//! [`OperationHandle`] to observe state transitions, cancel, and finally
//! await the outcome. Dropping the handle detaches the task; it keeps
//! running to completion and its log and output persist.

use crate::error::{Error, Result};
use crate::types::{AcquisitionState, ExportState, Operation, OperationKind, SessionId, Status};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// State machine value that maps onto the shared [`Status`]
pub trait OperationState: Copy + PartialEq + Send + Sync + std::fmt::Debug + 'static {
    /// Initial state before any work
    const IDLE: Self;

    /// Coarse status for this state
    fn status(&self) -> Status;
}

impl OperationState for AcquisitionState {
    const IDLE: Self = AcquisitionState::Idle;

    fn status(&self) -> Status {
        AcquisitionState::status(self)
    }
}

impl OperationState for ExportState {
    const IDLE: Self = ExportState::Idle;

    fn status(&self) -> Status {
        ExportState::status(self)
    }
}

/// Terminal result of an operation that did not fail
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome<T> {
    /// Work finished and its result was published
    Completed(T),
    /// Stopped at the user's request; nothing was published
    Cancelled,
}

impl<T> Outcome<T> {
    /// Whether the operation was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    /// The completed value, if any
    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            Outcome::Cancelled => None,
        }
    }
}

/// Task-side state publisher
pub(crate) struct StateTracker<S> {
    tx: watch::Sender<S>,
    history: Arc<Mutex<Vec<S>>>,
}

impl<S: OperationState> StateTracker<S> {
    fn new() -> (Self, watch::Receiver<S>, Arc<Mutex<Vec<S>>>) {
        let (tx, rx) = watch::channel(S::IDLE);
        let history = Arc::new(Mutex::new(vec![S::IDLE]));
        (
            Self {
                tx,
                history: history.clone(),
            },
            rx,
            history,
        )
    }

    pub(crate) fn set(&self, state: S) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(state);
        self.tx.send_replace(state);
    }

    pub(crate) fn get(&self) -> S {
        *self.tx.borrow()
    }
}

/// Identity and bookkeeping shared by the handle and the task
#[derive(Clone, Debug)]
pub(crate) struct OperationMeta {
    pub(crate) id: SessionId,
    pub(crate) kind: OperationKind,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) log_path: PathBuf,
}

/// Caller-side handle to one running operation
pub struct OperationHandle<S, T> {
    meta: OperationMeta,
    cancel: CancellationToken,
    state: watch::Receiver<S>,
    history: Arc<Mutex<Vec<S>>>,
    task: JoinHandle<Result<Outcome<T>>>,
}

impl<S: OperationState, T: Send + 'static> OperationHandle<S, T> {
    /// Spawn `work` on the runtime and return its handle
    pub(crate) fn spawn<F, Fut>(meta: OperationMeta, cancel: CancellationToken, work: F) -> Self
    where
        F: FnOnce(StateTracker<S>) -> Fut,
        Fut: std::future::Future<Output = Result<Outcome<T>>> + Send + 'static,
    {
        let (tracker, state, history) = StateTracker::new();
        let task = tokio::spawn(work(tracker));
        Self {
            meta,
            cancel,
            state,
            history,
            task,
        }
    }

    /// Session id
    pub fn id(&self) -> &SessionId {
        &self.meta.id
    }

    /// Operation kind
    pub fn kind(&self) -> OperationKind {
        self.meta.kind
    }

    /// Session log path
    pub fn log_path(&self) -> &Path {
        &self.meta.log_path
    }

    /// Request cancellation; the outcome becomes [`Outcome::Cancelled`]
    /// unless the work already finished
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Current state
    pub fn state(&self) -> S {
        *self.state.borrow()
    }

    /// Every state the operation has been in, starting with idle
    pub fn history(&self) -> Vec<S> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait for the next state change; `None` once the task has finished
    pub async fn changed(&mut self) -> Option<S> {
        match self.state.changed().await {
            Ok(()) => Some(*self.state.borrow_and_update()),
            Err(_) => None,
        }
    }

    /// Snapshot for the UI collaborator
    pub fn operation(&self) -> Operation {
        Operation {
            id: self.meta.id.clone(),
            kind: self.meta.kind,
            started_at: self.meta.started_at,
            status: self.state().status(),
            log_path: self.meta.log_path.clone(),
        }
    }

    /// Whether the task has finished
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Await the terminal outcome, consuming the handle
    pub async fn wait(self) -> Result<Outcome<T>> {
        self.task
            .await
            .map_err(|e| Error::Other(format!("operation {} task failed: {e}", self.meta.id)))?
    }
}

impl<S: std::fmt::Debug, T> std::fmt::Debug for OperationHandle<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationHandle")
            .field("id", &self.meta.id)
            .field("kind", &self.meta.kind)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> OperationMeta {
        OperationMeta {
            id: SessionId::generate(chrono::Local::now()),
            kind: OperationKind::ExportAudio,
            started_at: Utc::now(),
            log_path: PathBuf::from("logs/x.log"),
        }
    }

    #[tokio::test]
    async fn handle_tracks_states_and_returns_outcome() {
        let handle: OperationHandle<ExportState, u32> =
            OperationHandle::spawn(meta(), CancellationToken::new(), |tracker| async move {
                tracker.set(ExportState::Preparing);
                tracker.set(ExportState::Transcoding);
                tracker.set(ExportState::Succeeded);
                Ok(Outcome::Completed(7))
            });

        let history_handle = handle.history.clone();
        let outcome = handle.wait().await.unwrap();

        assert_eq!(outcome, Outcome::Completed(7));
        assert_eq!(
            *history_handle.lock().unwrap(),
            vec![
                ExportState::Idle,
                ExportState::Preparing,
                ExportState::Transcoding,
                ExportState::Succeeded
            ]
        );
    }

    #[tokio::test]
    async fn cancel_is_visible_to_the_task() {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let handle: OperationHandle<ExportState, ()> =
            OperationHandle::spawn(meta(), token, |tracker| async move {
                task_token.cancelled().await;
                tracker.set(ExportState::Cancelled);
                Ok(Outcome::Cancelled)
            });

        assert_eq!(handle.operation().status, Status::Pending);
        handle.cancel();
        assert!(handle.wait().await.unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn changed_reports_transitions_then_none() {
        let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();
        let mut handle: OperationHandle<AcquisitionState, ()> =
            OperationHandle::spawn(meta(), CancellationToken::new(), |tracker| async move {
                let _ = go_rx.await;
                tracker.set(AcquisitionState::Validating);
                Ok(Outcome::Completed(()))
            });

        go_tx.send(()).unwrap();
        assert_eq!(handle.changed().await, Some(AcquisitionState::Validating));
        assert_eq!(handle.changed().await, None);
    }
}
