use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::{AgentRuntime, RunHandle};
use crate::event_bridge::{EventBridge, LifecycleEvent, ObserverEvent};
use crate::gateway::ActionGateway;

const RUN_EVENT_BUFFER: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    QueueFull,
    Closed,
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull => write!(f, "task queue full"),
            Self::Closed => write!(f, "session closed"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// One observer connection's share of the service.
///
/// Runs for the session execute strictly one after another on a single
/// worker that owns the session's [`EventBridge`]. Dropping the session
/// aborts the worker together with any run still in flight.
pub struct ObserverSession {
    tasks: mpsc::Sender<String>,
    worker: JoinHandle<()>,
}

impl ObserverSession {
    pub fn spawn(
        runtime: Arc<dyn AgentRuntime>,
        gateway: Arc<ActionGateway>,
        outbound: mpsc::Sender<ObserverEvent>,
        max_pending_tasks: usize,
    ) -> Self {
        let (tasks, queue) = mpsc::channel(max_pending_tasks.max(1));
        let worker = tokio::spawn(worker_loop(queue, runtime, gateway, outbound));
        Self { tasks, worker }
    }

    pub fn submit(&self, task: String) -> Result<(), SubmitError> {
        self.tasks.try_send(task).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SubmitError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
        })
    }
}

impl Drop for ObserverSession {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn worker_loop(
    mut queue: mpsc::Receiver<String>,
    runtime: Arc<dyn AgentRuntime>,
    gateway: Arc<ActionGateway>,
    outbound: mpsc::Sender<ObserverEvent>,
) {
    let mut bridge = EventBridge::new();
    while let Some(task) = queue.recv().await {
        let delivered = run_task(
            task,
            &mut bridge,
            Arc::clone(&runtime),
            Arc::clone(&gateway),
            &outbound,
        )
        .await;
        if !delivered {
            debug!("observer outbound closed, stopping session worker");
            break;
        }
    }
}

/// Drives one run to its terminal event. Returns `false` once the observer
/// can no longer receive frames.
async fn run_task(
    task: String,
    bridge: &mut EventBridge,
    runtime: Arc<dyn AgentRuntime>,
    gateway: Arc<ActionGateway>,
    outbound: &mpsc::Sender<ObserverEvent>,
) -> bool {
    let (events, mut lifecycle) = mpsc::channel(RUN_EVENT_BUFFER);
    let mut producer = AbortOnDrop(tokio::spawn(async move {
        let handle = RunHandle::new(gateway, events.clone());
        let _ = events
            .send(LifecycleEvent::RunStarted { task: task.clone() })
            .await;
        let terminal = match runtime.run(&task, &handle).await {
            Ok(output) => {
                info!("run finished");
                LifecycleEvent::RunFinished { output }
            }
            Err(err) => {
                warn!("run failed: {err:#}");
                LifecycleEvent::Fault {
                    message: format!("{err:#}"),
                }
            }
        };
        let _ = events.send(terminal).await;
    }));

    while let Some(event) = lifecycle.recv().await {
        if let Some(observed) = bridge.handle(event) {
            if outbound.send(observed).await.is_err() {
                return false;
            }
        }
    }

    if let Err(err) = (&mut producer.0).await {
        if err.is_panic() {
            warn!("agent run panicked");
            if let Some(observed) = bridge.handle(LifecycleEvent::Fault {
                message: "agent run failed unexpectedly".to_owned(),
            }) {
                return outbound.send(observed).await.is_ok();
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use tokio::sync::{mpsc, Notify};

    use crate::agent::{AgentRuntime, RunHandle};
    use crate::event_bridge::{ObserverEvent, ResponseType};
    use crate::file_actions::FileActions;
    use crate::gateway::ActionGateway;
    use crate::process_executor::ProcessExecutor;
    use crate::security::{CommandPolicy, PathGuard};

    use super::{ObserverSession, SubmitError};

    struct ListingRuntime;

    #[async_trait]
    impl AgentRuntime for ListingRuntime {
        async fn run(&self, task: &str, run: &RunHandle) -> Result<String> {
            if task == "hi" {
                run.token("hello").await;
                return Ok("hello".to_owned());
            }
            let listing = run.invoke("List Files", "").await;
            run.token("hidden").await;
            Ok(format!("found: {listing}"))
        }
    }

    struct FailingRuntime;

    #[async_trait]
    impl AgentRuntime for FailingRuntime {
        async fn run(&self, _task: &str, _run: &RunHandle) -> Result<String> {
            bail!("model unreachable")
        }
    }

    struct PanickingRuntime;

    #[async_trait]
    impl AgentRuntime for PanickingRuntime {
        async fn run(&self, _task: &str, _run: &RunHandle) -> Result<String> {
            panic!("boom")
        }
    }

    struct BlockingRuntime {
        release: Arc<Notify>,
    }

    #[async_trait]
    impl AgentRuntime for BlockingRuntime {
        async fn run(&self, _task: &str, _run: &RunHandle) -> Result<String> {
            self.release.notified().await;
            Ok("released".to_owned())
        }
    }

    fn temp_path(tag: &str) -> PathBuf {
        let mut root = std::env::temp_dir();
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        root.push(format!("action-gateway-session-{tag}-{stamp}"));
        root
    }

    fn gateway(tag: &str) -> Arc<ActionGateway> {
        let root = temp_path(tag);
        std::fs::create_dir_all(&root).expect("create root");
        std::fs::write(root.join("index.html"), "<html></html>").expect("seed");
        let guard = PathGuard::new(&root).expect("guard");
        let executor = ProcessExecutor::new(guard.clone(), CommandPolicy::default(), 5, 10, 4_000);
        Arc::new(ActionGateway::new(FileActions::new(guard), executor, None))
    }

    async fn next(rx: &mut mpsc::Receiver<ObserverEvent>) -> ObserverEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    async fn until_terminal(rx: &mut mpsc::Receiver<ObserverEvent>) -> Vec<ObserverEvent> {
        let mut events = Vec::new();
        loop {
            let event = next(rx).await;
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                return events;
            }
        }
    }

    #[tokio::test]
    async fn tool_run_emits_steps_then_tool_based_final() {
        let (tx, mut rx) = mpsc::channel(32);
        let session = ObserverSession::spawn(Arc::new(ListingRuntime), gateway("tool"), tx, 4);
        session.submit("list the files".to_owned()).expect("submit");

        let events = until_terminal(&mut rx).await;
        assert_eq!(events.len(), 4, "{events:?}");
        assert!(events[..3]
            .iter()
            .all(|event| matches!(event, ObserverEvent::Step(_))));
        match &events[2] {
            ObserverEvent::Step(step) => assert_eq!(step.observation, "index.html"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            events[3],
            ObserverEvent::Final {
                output: "found: index.html".to_owned(),
                response_type: ResponseType::ToolBased,
            }
        );
    }

    #[tokio::test]
    async fn runs_are_sequential_and_classified_independently() {
        let (tx, mut rx) = mpsc::channel(32);
        let session = ObserverSession::spawn(Arc::new(ListingRuntime), gateway("seq"), tx, 4);
        session.submit("list".to_owned()).expect("first");
        session.submit("hi".to_owned()).expect("second");

        let first = until_terminal(&mut rx).await;
        let second = until_terminal(&mut rx).await;
        assert!(matches!(
            first.last(),
            Some(ObserverEvent::Final {
                response_type: ResponseType::ToolBased,
                ..
            })
        ));
        assert_eq!(
            second,
            vec![
                second[0].clone(),
                ObserverEvent::Token {
                    token: "hello".to_owned()
                },
                ObserverEvent::Final {
                    output: "hello".to_owned(),
                    response_type: ResponseType::Direct,
                },
            ]
        );
    }

    #[tokio::test]
    async fn runtime_failure_becomes_one_error_event() {
        let (tx, mut rx) = mpsc::channel(32);
        let session = ObserverSession::spawn(Arc::new(FailingRuntime), gateway("fail"), tx, 4);
        session.submit("anything".to_owned()).expect("submit");
        let events = until_terminal(&mut rx).await;
        assert_eq!(
            events.last(),
            Some(&ObserverEvent::error("model unreachable"))
        );
    }

    #[tokio::test]
    async fn panicking_runtime_still_reports_an_error() {
        let (tx, mut rx) = mpsc::channel(32);
        let session = ObserverSession::spawn(Arc::new(PanickingRuntime), gateway("panic"), tx, 4);
        session.submit("anything".to_owned()).expect("submit");
        let events = until_terminal(&mut rx).await;
        assert!(matches!(events.last(), Some(ObserverEvent::Error { .. })));
    }

    #[tokio::test]
    async fn full_queue_rejects_new_tasks() {
        let release = Arc::new(Notify::new());
        let runtime = BlockingRuntime {
            release: Arc::clone(&release),
        };
        let (tx, mut rx) = mpsc::channel(32);
        let session = ObserverSession::spawn(Arc::new(runtime), gateway("full"), tx, 1);

        session.submit("first".to_owned()).expect("first");
        // The run-start step proves the worker took the first task off the queue.
        assert!(matches!(next(&mut rx).await, ObserverEvent::Step(_)));
        session.submit("second".to_owned()).expect("second waits");
        assert_eq!(
            session.submit("third".to_owned()),
            Err(SubmitError::QueueFull)
        );
        release.notify_one();
        let events = until_terminal(&mut rx).await;
        assert!(matches!(events.last(), Some(ObserverEvent::Final { .. })));
    }
}
