//! Entry point for execution requests.
//!
//! Each submitted request becomes a tokio task registered in a process-wide
//! execution table under its session. The entry is removed when the task
//! settles, whichever way that happens, so `cancel_session` only ever sees
//! live executions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core_types::{ExecutionId, ExecutionNotice, ExecutionRequest, ExecutionResult, SessionId};
use crate::orchestrator::Orchestrator;

type ExecutionTable = HashMap<SessionId, HashMap<ExecutionId, CancellationToken>>;

#[derive(Clone)]
pub struct Dispatcher {
    orchestrator: Arc<Orchestrator>,
    executions: Arc<Mutex<ExecutionTable>>,
}

impl Dispatcher {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            executions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Start an execution in the background. Exactly one notice is sent on
    /// `notifier` once it settles.
    pub fn submit(
        &self,
        request: ExecutionRequest,
        notifier: mpsc::UnboundedSender<ExecutionNotice>,
    ) -> ExecutionId {
        let execution_id = Uuid::new_v4();
        let registration = self.register(&request.session_id, execution_id);
        let orchestrator = self.orchestrator.clone();

        log::debug!("Submitted execution {} for session {}", execution_id, request.session_id);

        tokio::spawn(async move {
            let result = orchestrator
                .execute_with_cancel(&request, &registration.token)
                .await;
            drop(registration);

            let notice = ExecutionNotice {
                session_id: request.session_id,
                execution_id,
                result,
            };
            if notifier.send(notice).is_err() {
                log::debug!("Notifier for execution {} closed, dropping result", execution_id);
            }
        });

        execution_id
    }

    /// Run an execution on the caller's task, still cancellable through `cancel_session`.
    pub async fn run(&self, request: &ExecutionRequest) -> ExecutionResult {
        let registration = self.register(&request.session_id, Uuid::new_v4());
        self.orchestrator
            .execute_with_cancel(request, &registration.token)
            .await
    }

    /// Cancel every in-flight execution of `session_id`. Returns how many were signalled.
    pub fn cancel_session(&self, session_id: &SessionId) -> usize {
        let tokens: Vec<CancellationToken> = self
            .lock()
            .get(session_id)
            .map(|executions| executions.values().cloned().collect())
            .unwrap_or_default();

        for token in &tokens {
            token.cancel();
        }
        if !tokens.is_empty() {
            log::info!("Cancelled {} execution(s) for session {}", tokens.len(), session_id);
        }
        tokens.len()
    }

    pub fn in_flight(&self, session_id: &SessionId) -> usize {
        self.lock().get(session_id).map_or(0, HashMap::len)
    }

    pub fn total_in_flight(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }

    fn register(&self, session_id: &SessionId, execution_id: ExecutionId) -> Registration {
        let token = CancellationToken::new();
        self.lock()
            .entry(session_id.clone())
            .or_default()
            .insert(execution_id, token.clone());
        Registration {
            executions: self.executions.clone(),
            session_id: session_id.clone(),
            execution_id,
            token,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ExecutionTable> {
        lock_table(&self.executions)
    }
}

// A panic while holding the lock cannot leave the table half-updated.
fn lock_table(table: &Mutex<ExecutionTable>) -> MutexGuard<'_, ExecutionTable> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes its execution from the table when dropped.
struct Registration {
    executions: Arc<Mutex<ExecutionTable>>,
    session_id: SessionId,
    execution_id: ExecutionId,
    token: CancellationToken,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut table = lock_table(&self.executions);
        if let Some(executions) = table.get_mut(&self.session_id) {
            executions.remove(&self.execution_id);
            if executions.is_empty() {
                table.remove(&self.session_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::ExecutionOutcome;
    use crate::orchestrator::ExecutionLimits;
    use crate::pipeline::{PipelineRegistry, Stage};
    use crate::test_utils::{outcome, Scripted, ScriptedRunner};
    use crate::workspace::WorkspaceAllocator;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    fn dispatcher(runner: ScriptedRunner) -> (Dispatcher, TempDir) {
        let root = tempdir().unwrap();
        let orchestrator = Orchestrator::new(
            Arc::new(PipelineRegistry::builtin()),
            WorkspaceAllocator::new(root.path()),
            Arc::new(runner),
            ExecutionLimits::default(),
        );
        (Dispatcher::new(Arc::new(orchestrator)), root)
    }

    async fn wait_until_in_flight(dispatcher: &Dispatcher, session: &SessionId, expected: usize) {
        for _ in 0..100 {
            if dispatcher.in_flight(session) == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} in-flight executions", expected);
    }

    #[tokio::test]
    async fn test_submit_delivers_exactly_one_notice() {
        let (dispatcher, _root) =
            dispatcher(ScriptedRunner::new().on(Stage::Run, Scripted::Outcome(outcome("hi\n", "", 0))));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let id = dispatcher.submit(ExecutionRequest::new("s1", "python", "print('hi')"), tx);

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.execution_id, id);
        assert_eq!(notice.session_id, SessionId::from("s1"));
        assert_eq!(notice.result.combined_output, "hi\n");
        // The sender moved into the task is gone once the notice is delivered.
        assert!(rx.recv().await.is_none());
        assert_eq!(dispatcher.total_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancel_session_stops_only_that_session() {
        let (dispatcher, root) = dispatcher(ScriptedRunner::new().on(Stage::Run, Scripted::Hang));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let alice = SessionId::from("alice");
        let bob = SessionId::from("bob");

        dispatcher.submit(ExecutionRequest::new(alice.clone(), "python", "input()"), tx.clone());
        dispatcher.submit(ExecutionRequest::new(alice.clone(), "bash", "read x"), tx.clone());
        dispatcher.submit(ExecutionRequest::new(bob.clone(), "python", "input()"), tx);
        wait_until_in_flight(&dispatcher, &alice, 2).await;
        wait_until_in_flight(&dispatcher, &bob, 1).await;

        assert_eq!(dispatcher.cancel_session(&alice), 2);

        for _ in 0..2 {
            let notice = rx.recv().await.unwrap();
            assert_eq!(notice.session_id, alice);
            assert_eq!(notice.result.outcome, ExecutionOutcome::Cancelled);
            assert_eq!(notice.result.combined_output, "Execution cancelled");
        }
        assert_eq!(dispatcher.in_flight(&alice), 0);
        assert_eq!(dispatcher.in_flight(&bob), 1);

        assert_eq!(dispatcher.cancel_session(&bob), 1);
        assert_eq!(rx.recv().await.unwrap().session_id, bob);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_session_is_noop() {
        let (dispatcher, _root) = dispatcher(ScriptedRunner::new());
        assert_eq!(dispatcher.cancel_session(&SessionId::from("nobody")), 0);
    }

    #[tokio::test]
    async fn test_closed_notifier_does_not_leak_registration() {
        let (dispatcher, _root) = dispatcher(ScriptedRunner::new());
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        dispatcher.submit(ExecutionRequest::new("gone", "python", "pass"), tx);

        wait_until_in_flight(&dispatcher, &SessionId::from("gone"), 0).await;
        assert_eq!(dispatcher.total_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_run_is_registered_while_in_progress() {
        let (dispatcher, _root) = dispatcher(ScriptedRunner::new().on(Stage::Run, Scripted::Hang));
        let session = SessionId::from("inline");
        let request = ExecutionRequest::new(session.clone(), "python", "input()");

        let canceller = dispatcher.clone();
        let watched = session.clone();
        tokio::spawn(async move {
            wait_until_in_flight(&canceller, &watched, 1).await;
            canceller.cancel_session(&watched);
        });

        let result = dispatcher.run(&request).await;
        assert_eq!(result.outcome, ExecutionOutcome::Cancelled);
        assert_eq!(dispatcher.in_flight(&session), 0);
    }
}
