//! End-to-end orchestration tests over in-memory stores and a scripted fake
//! runtime. No Docker daemon or database is involved; the fake runtime
//! honors the same contract as the Docker implementation (deterministic
//! names, NotFound on missing sandboxes, streams that end on removal).

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use engine::environment::sandbox_name;
use engine::error::EngineError;
use engine::orchestrator::{OrchestratorOptions, StopOutcome, StrategyOrchestrator};
use engine::runtime::{
    ContainerRuntime, LogChannel, LogChunk, LogStream, RuntimeError, SandboxSpec,
};
use engine::store::{
    CredentialError, CredentialStore, NewRunRecord, RunOutcome, RunRecord, RunStore,
    StrategyRecord, StrategyStore,
};
use shared::models::{BrokerKind, CredentialBundle, RunStatus, StrategyStatus};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

fn chunk(text: &str) -> LogChunk {
    LogChunk {
        timestamp: Utc::now(),
        channel: LogChannel::Stdout,
        text: text.to_string(),
    }
}

fn not_found(name: &str) -> RuntimeError {
    RuntimeError::NotFound {
        name: name.to_string(),
    }
}

struct FakeSandbox {
    runtime_id: String,
    running: bool,
    paused: bool,
    log_tx: Option<mpsc::UnboundedSender<LogChunk>>,
    log_rx: Option<mpsc::UnboundedReceiver<LogChunk>>,
    exit_tx: watch::Sender<Option<i64>>,
    exit_rx: watch::Receiver<Option<i64>>,
}

impl FakeSandbox {
    fn new() -> Self {
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        Self {
            runtime_id: Uuid::new_v4().to_string(),
            running: false,
            paused: false,
            log_tx: Some(log_tx),
            log_rx: Some(log_rx),
            exit_tx,
            exit_rx,
        }
    }
}

#[derive(Default)]
struct FakeRuntime {
    sandboxes: StdMutex<HashMap<String, FakeSandbox>>,
    created: StdMutex<Vec<String>>,
    removed: StdMutex<Vec<String>>,
    create_delay: StdMutex<Option<Duration>>,
    /// Applied on start(): chunks to emit immediately, then an optional exit.
    script: StdMutex<Option<(Vec<String>, Option<i64>)>>,
}

impl FakeRuntime {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn live_count(&self) -> usize {
        self.sandboxes.lock().unwrap().len()
    }

    fn created_names(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    fn removed_names(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    fn is_paused(&self, name: &str) -> bool {
        self.sandboxes
            .lock()
            .unwrap()
            .get(name)
            .map(|s| s.paused)
            .unwrap_or(false)
    }

    fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = Some(delay);
    }

    fn set_script(&self, chunks: &[&str], exit: Option<i64>) {
        *self.script.lock().unwrap() = Some((
            chunks.iter().map(|s| s.to_string()).collect(),
            exit,
        ));
    }

    /// Plant an orphaned sandbox, as a prior crash would leave behind.
    fn seed_stale(&self, name: &str) {
        self.sandboxes
            .lock()
            .unwrap()
            .insert(name.to_string(), FakeSandbox::new());
    }

    fn emit(&self, name: &str, text: &str) {
        let sandboxes = self.sandboxes.lock().unwrap();
        if let Some(sandbox) = sandboxes.get(name) {
            if let Some(tx) = &sandbox.log_tx {
                let _ = tx.send(chunk(text));
            }
        }
    }

    /// Let the sandbox exit naturally with the given code.
    fn finish(&self, name: &str, code: i64) {
        let mut sandboxes = self.sandboxes.lock().unwrap();
        if let Some(sandbox) = sandboxes.get_mut(name) {
            sandbox.running = false;
            sandbox.log_tx = None; // closes the attached stream
            let _ = sandbox.exit_tx.send(Some(code));
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &SandboxSpec) -> Result<String, RuntimeError> {
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut sandboxes = self.sandboxes.lock().unwrap();
        if sandboxes.contains_key(&spec.name) {
            return Err(RuntimeError::Api {
                reason: format!("name {} already in use", spec.name),
            });
        }
        let sandbox = FakeSandbox::new();
        let runtime_id = sandbox.runtime_id.clone();
        sandboxes.insert(spec.name.clone(), sandbox);
        self.created.lock().unwrap().push(spec.name.clone());
        Ok(runtime_id)
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        let script = self.script.lock().unwrap().clone();
        let mut sandboxes = self.sandboxes.lock().unwrap();
        let sandbox = sandboxes.get_mut(name).ok_or_else(|| not_found(name))?;
        sandbox.running = true;

        if let Some((chunks, exit)) = script {
            if let Some(tx) = &sandbox.log_tx {
                for text in &chunks {
                    let _ = tx.send(chunk(text));
                }
            }
            if let Some(code) = exit {
                sandbox.running = false;
                sandbox.log_tx = None;
                let _ = sandbox.exit_tx.send(Some(code));
            }
        }
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        let mut sandboxes = self.sandboxes.lock().unwrap();
        let sandbox = sandboxes.get_mut(name).ok_or_else(|| not_found(name))?;
        sandbox.running = false;
        Ok(())
    }

    async fn pause(&self, name: &str) -> Result<(), RuntimeError> {
        let mut sandboxes = self.sandboxes.lock().unwrap();
        let sandbox = sandboxes.get_mut(name).ok_or_else(|| not_found(name))?;
        sandbox.paused = true;
        Ok(())
    }

    async fn unpause(&self, name: &str) -> Result<(), RuntimeError> {
        let mut sandboxes = self.sandboxes.lock().unwrap();
        let sandbox = sandboxes.get_mut(name).ok_or_else(|| not_found(name))?;
        sandbox.paused = false;
        Ok(())
    }

    async fn remove(&self, name: &str, _force: bool) -> Result<(), RuntimeError> {
        let mut sandboxes = self.sandboxes.lock().unwrap();
        match sandboxes.remove(name) {
            // Dropping the sandbox drops its channels: the attached stream
            // ends and pending wait() calls see the sender go away.
            Some(_) => {
                self.removed.lock().unwrap().push(name.to_string());
                Ok(())
            }
            None => Err(not_found(name)),
        }
    }

    async fn wait(&self, name: &str) -> Result<i64, RuntimeError> {
        let mut exit_rx = {
            let sandboxes = self.sandboxes.lock().unwrap();
            match sandboxes.get(name) {
                Some(sandbox) => sandbox.exit_rx.clone(),
                None => return Err(not_found(name)),
            }
        };
        loop {
            if let Some(code) = *exit_rx.borrow() {
                return Ok(code);
            }
            if exit_rx.changed().await.is_err() {
                return Err(not_found(name));
            }
        }
    }

    async fn attach(&self, name: &str) -> Result<LogStream, RuntimeError> {
        let log_rx = {
            let mut sandboxes = self.sandboxes.lock().unwrap();
            let sandbox = sandboxes.get_mut(name).ok_or_else(|| not_found(name))?;
            sandbox.log_rx.take().ok_or_else(|| RuntimeError::Api {
                reason: format!("{} already attached", name),
            })?
        };
        let stream = futures_util::stream::unfold(log_rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        });
        Ok(Box::pin(stream))
    }
}

#[derive(Default)]
struct MemStrategyStore {
    rows: StdMutex<HashMap<Uuid, StrategyRecord>>,
}

impl MemStrategyStore {
    fn insert(&self, record: StrategyRecord) {
        self.rows.lock().unwrap().insert(record.id, record);
    }

    fn get(&self, strategy_id: Uuid) -> StrategyRecord {
        self.rows
            .lock()
            .unwrap()
            .get(&strategy_id)
            .cloned()
            .expect("strategy seeded")
    }
}

#[async_trait]
impl StrategyStore for MemStrategyStore {
    async fn fetch(
        &self,
        user_id: Uuid,
        strategy_id: Uuid,
    ) -> anyhow::Result<Option<StrategyRecord>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .get(&strategy_id)
            .filter(|r| r.user_id == user_id)
            .cloned())
    }

    async fn update_execution_state(
        &self,
        strategy_id: Uuid,
        status: StrategyStatus,
        sandbox_id: Option<String>,
    ) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .get_mut(&strategy_id)
            .ok_or_else(|| anyhow::anyhow!("no such strategy"))?;
        row.status = status;
        row.sandbox_id = sandbox_id;
        Ok(())
    }
}

#[derive(Default)]
struct MemCredentialStore {
    bundles: StdMutex<HashMap<(Uuid, BrokerKind), CredentialBundle>>,
}

impl MemCredentialStore {
    fn put(&self, user_id: Uuid, bundle: CredentialBundle) {
        self.bundles
            .lock()
            .unwrap()
            .insert((user_id, bundle.broker), bundle);
    }
}

#[async_trait]
impl CredentialStore for MemCredentialStore {
    async fn resolve(
        &self,
        user_id: Uuid,
        broker: BrokerKind,
    ) -> Result<CredentialBundle, CredentialError> {
        self.bundles
            .lock()
            .unwrap()
            .get(&(user_id, broker))
            .cloned()
            .ok_or(CredentialError::NotFound)
    }
}

#[derive(Default)]
struct MemRunStore {
    rows: StdMutex<Vec<RunRecord>>,
}

impl MemRunStore {
    fn all(&self) -> Vec<RunRecord> {
        self.rows.lock().unwrap().clone()
    }
}

#[async_trait]
impl RunStore for MemRunStore {
    async fn create(&self, record: NewRunRecord) -> anyhow::Result<Uuid> {
        let run_id = Uuid::new_v4();
        self.rows.lock().unwrap().push(RunRecord {
            id: run_id,
            user_id: record.user_id,
            strategy_id: record.strategy_id,
            strategy_name: record.strategy_name,
            broker: record.broker,
            terminal_output: String::new(),
            status: RunStatus::Running,
            execution_ms: None,
            error_message: None,
            started_at: Utc::now(),
            stopped_at: None,
        });
        Ok(run_id)
    }

    async fn finalize(&self, run_id: Uuid, outcome: RunOutcome) -> anyhow::Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        let Some(row) = rows.iter_mut().find(|r| r.id == run_id) else {
            return Ok(false);
        };
        if row.status != RunStatus::Running {
            return Ok(false);
        }
        row.status = outcome.status;
        row.terminal_output = outcome.output;
        row.error_message = outcome.error_message;
        row.execution_ms = Some((outcome.stopped_at - row.started_at).num_milliseconds());
        row.stopped_at = Some(outcome.stopped_at);
        Ok(true)
    }

    async fn finalize_open(&self, strategy_id: Uuid, outcome: RunOutcome) -> anyhow::Result<bool> {
        let open_id = {
            let rows = self.rows.lock().unwrap();
            rows.iter()
                .rev()
                .find(|r| r.strategy_id == Some(strategy_id) && r.status == RunStatus::Running)
                .map(|r| r.id)
        };
        match open_id {
            Some(run_id) => self.finalize(run_id, outcome).await,
            None => Ok(false),
        }
    }

    async fn list_for_strategy(
        &self,
        strategy_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> anyhow::Result<Vec<RunRecord>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .rev()
            .filter(|r| r.strategy_id == Some(strategy_id))
            .skip((page * per_page) as usize)
            .take(per_page as usize)
            .cloned()
            .collect())
    }

    async fn list_for_owner(
        &self,
        user_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> anyhow::Result<Vec<RunRecord>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .rev()
            .filter(|r| r.user_id == user_id)
            .skip((page * per_page) as usize)
            .take(per_page as usize)
            .cloned()
            .collect())
    }
}

struct Harness {
    orchestrator: StrategyOrchestrator,
    runtime: Arc<FakeRuntime>,
    strategies: Arc<MemStrategyStore>,
    credentials: Arc<MemCredentialStore>,
    runs: Arc<MemRunStore>,
    owner: Uuid,
}

fn harness() -> Harness {
    harness_with_timeout(Duration::from_secs(5))
}

fn harness_with_timeout(run_once_timeout: Duration) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let runtime = FakeRuntime::new();
    let strategies = Arc::new(MemStrategyStore::default());
    let credentials = Arc::new(MemCredentialStore::default());
    let runs = Arc::new(MemRunStore::default());
    let owner = Uuid::new_v4();

    credentials.put(
        owner,
        CredentialBundle {
            client_id: "CLIENT-1".into(),
            access_token: "TOKEN-1".into(),
            broker: BrokerKind::Dhan,
        },
    );

    let orchestrator = StrategyOrchestrator::new(
        runtime.clone(),
        strategies.clone(),
        credentials.clone(),
        runs.clone(),
        OrchestratorOptions {
            runner_image: "algorun-runner".into(),
            run_once_timeout,
            log_channel_capacity: 64,
        },
    );

    Harness {
        orchestrator,
        runtime,
        strategies,
        credentials,
        runs,
        owner,
    }
}

impl Harness {
    fn seed_strategy(&self) -> Uuid {
        self.seed_strategy_with_broker(BrokerKind::Dhan)
    }

    fn seed_strategy_with_broker(&self, broker: BrokerKind) -> Uuid {
        let id = Uuid::new_v4();
        self.strategies.insert(StrategyRecord {
            id,
            user_id: self.owner,
            name: "momentum-breakout".into(),
            code: "print('tick')".into(),
            broker,
            status: StrategyStatus::Stopped,
            sandbox_id: None,
        });
        id
    }
}

/// Poll until the background capture task has done its part.
async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

#[tokio::test]
async fn start_transitions_to_running_and_opens_a_run_record() {
    let h = harness();
    let id = h.seed_strategy();

    h.orchestrator.start(h.owner, id).await.unwrap();

    let row = h.strategies.get(id);
    assert_eq!(row.status, StrategyStatus::Running);
    assert_eq!(row.sandbox_id.as_deref(), Some(sandbox_name(id).as_str()));
    assert_eq!(h.runtime.live_count(), 1);

    let runs = h.runs.all();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Running);
    assert_eq!(runs[0].strategy_id, Some(id));
}

#[tokio::test]
async fn start_on_a_running_strategy_is_rejected_without_side_effects() {
    let h = harness();
    let id = h.seed_strategy();
    h.orchestrator.start(h.owner, id).await.unwrap();
    let created_before = h.runtime.created_names().len();

    let err = h.orchestrator.start(h.owner, id).await.unwrap_err();

    assert!(matches!(
        err,
        EngineError::InvalidStateTransition {
            state: StrategyStatus::Running,
            action: "start"
        }
    ));
    assert_eq!(h.runtime.created_names().len(), created_before);
    assert_eq!(h.runtime.live_count(), 1);
}

#[tokio::test]
async fn start_without_credentials_leaves_strategy_stopped() {
    let h = harness();
    // No credentials stored for Zerodha.
    let id = h.seed_strategy_with_broker(BrokerKind::Zerodha);

    let err = h.orchestrator.start(h.owner, id).await.unwrap_err();

    assert!(matches!(err, EngineError::CredentialsMissing));
    assert_eq!(h.strategies.get(id).status, StrategyStatus::Stopped);
    assert_eq!(h.runtime.live_count(), 0);
    assert!(h.runs.all().is_empty());
}

#[tokio::test]
async fn start_with_empty_credentials_is_rejected() {
    let h = harness();
    h.credentials.put(
        h.owner,
        CredentialBundle {
            client_id: "".into(),
            access_token: "TOKEN".into(),
            broker: BrokerKind::Upstox,
        },
    );
    let id = h.seed_strategy_with_broker(BrokerKind::Upstox);

    let err = h.orchestrator.start(h.owner, id).await.unwrap_err();

    assert!(matches!(err, EngineError::CredentialsInvalid { .. }));
    assert_eq!(h.strategies.get(id).status, StrategyStatus::Stopped);
    assert_eq!(h.runtime.live_count(), 0);
}

#[tokio::test]
async fn unknown_owner_cannot_touch_a_strategy() {
    let h = harness();
    let id = h.seed_strategy();

    let err = h.orchestrator.start(Uuid::new_v4(), id).await.unwrap_err();

    assert!(matches!(err, EngineError::StrategyNotFound));
    assert_eq!(h.runtime.live_count(), 0);
}

#[tokio::test]
async fn pause_then_resume_keeps_the_same_sandbox() {
    let h = harness();
    let id = h.seed_strategy();
    h.orchestrator.start(h.owner, id).await.unwrap();
    let sandbox = h.strategies.get(id).sandbox_id;

    h.orchestrator.pause(h.owner, id).await.unwrap();
    assert_eq!(h.strategies.get(id).status, StrategyStatus::Paused);
    assert_eq!(h.strategies.get(id).sandbox_id, sandbox);
    assert!(h.runtime.is_paused(&sandbox_name(id)));

    h.orchestrator.resume(h.owner, id).await.unwrap();
    assert_eq!(h.strategies.get(id).status, StrategyStatus::Running);
    assert_eq!(h.strategies.get(id).sandbox_id, sandbox);
    assert!(!h.runtime.is_paused(&sandbox_name(id)));

    // No second sandbox was ever created.
    assert_eq!(h.runtime.created_names().len(), 1);
    assert_eq!(h.runtime.live_count(), 1);
}

#[tokio::test]
async fn pause_while_stopped_is_rejected() {
    let h = harness();
    let id = h.seed_strategy();

    let err = h.orchestrator.pause(h.owner, id).await.unwrap_err();

    assert!(matches!(
        err,
        EngineError::InvalidStateTransition {
            state: StrategyStatus::Stopped,
            action: "pause"
        }
    ));
    assert_eq!(h.strategies.get(id).status, StrategyStatus::Stopped);
}

#[tokio::test]
async fn resume_while_running_is_rejected() {
    let h = harness();
    let id = h.seed_strategy();
    h.orchestrator.start(h.owner, id).await.unwrap();

    let err = h.orchestrator.resume(h.owner, id).await.unwrap_err();

    assert!(matches!(
        err,
        EngineError::InvalidStateTransition {
            state: StrategyStatus::Running,
            action: "resume"
        }
    ));
}

#[tokio::test]
async fn stop_is_idempotent() {
    let h = harness();
    let id = h.seed_strategy();
    h.orchestrator.start(h.owner, id).await.unwrap();

    let first = h.orchestrator.stop(h.owner, id).await.unwrap();
    assert_eq!(first, StopOutcome::Stopped);
    let row = h.strategies.get(id);
    assert_eq!(row.status, StrategyStatus::Stopped);
    assert_eq!(row.sandbox_id, None);
    assert_eq!(h.runtime.live_count(), 0);

    let second = h.orchestrator.stop(h.owner, id).await.unwrap();
    assert_eq!(second, StopOutcome::AlreadyStopped);
}

#[tokio::test]
async fn stale_sandbox_is_replaced_before_start() {
    let h = harness();
    let id = h.seed_strategy();
    h.runtime.seed_stale(&sandbox_name(id));

    h.orchestrator.start(h.owner, id).await.unwrap();

    assert!(h.runtime.removed_names().contains(&sandbox_name(id)));
    assert_eq!(h.runtime.live_count(), 1);
    assert_eq!(h.strategies.get(id).status, StrategyStatus::Running);
}

#[tokio::test]
async fn live_subscriber_sees_chunks_in_order() {
    let h = harness();
    let id = h.seed_strategy();
    h.orchestrator.start(h.owner, id).await.unwrap();

    let mut rx = h.orchestrator.subscribe(id).await;
    for text in ["A", "B", "C"] {
        h.runtime.emit(&sandbox_name(id), text);
    }

    assert_eq!(rx.recv().await.unwrap().text, "A");
    assert_eq!(rx.recv().await.unwrap().text, "B");
    assert_eq!(rx.recv().await.unwrap().text, "C");
}

#[tokio::test]
async fn natural_exit_finalizes_the_run_but_not_the_strategy() {
    let h = harness();
    let id = h.seed_strategy();
    h.orchestrator.start(h.owner, id).await.unwrap();

    h.runtime.emit(&sandbox_name(id), "all done\n");
    h.runtime.finish(&sandbox_name(id), 0);

    let runs = h.runs.clone();
    wait_for(move || runs.all()[0].status == RunStatus::Success).await;

    let finalized = h.runs.all();
    assert!(finalized[0].terminal_output.contains("all done"));
    assert!(finalized[0].error_message.is_none());
    assert!(finalized[0].execution_ms.is_some());

    // The strategy is only stopped by an explicit stop().
    let row = h.strategies.get(id);
    assert_eq!(row.status, StrategyStatus::Running);
    assert!(row.sandbox_id.is_some());
    assert_eq!(h.runtime.live_count(), 1);
}

#[tokio::test]
async fn nonzero_exit_is_recorded_as_an_error() {
    let h = harness();
    let id = h.seed_strategy();
    h.orchestrator.start(h.owner, id).await.unwrap();

    h.runtime.finish(&sandbox_name(id), 3);

    let runs = h.runs.clone();
    wait_for(move || runs.all()[0].status == RunStatus::Error).await;

    let finalized = h.runs.all();
    assert!(finalized[0]
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("3"));
}

#[tokio::test]
async fn explicit_stop_finalizes_the_open_run_as_stopped() {
    let h = harness();
    let id = h.seed_strategy();
    h.orchestrator.start(h.owner, id).await.unwrap();

    h.runtime.emit(&sandbox_name(id), "partial work\n");
    // Let the capture task buffer the chunk before stopping.
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.orchestrator.stop(h.owner, id).await.unwrap();

    let runs = h.runs.clone();
    wait_for(move || runs.all()[0].status == RunStatus::Stopped).await;
    assert!(h.runs.all()[0].terminal_output.contains("partial work"));
}

#[tokio::test]
async fn concurrent_start_loses_with_conflict() {
    let h = harness();
    let id = h.seed_strategy();
    h.runtime.set_create_delay(Duration::from_millis(300));

    let owner = h.owner;
    let orchestrator = Arc::new(h.orchestrator);
    let first = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.start(owner, id).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = orchestrator.start(owner, id).await;
    assert!(matches!(second, Err(EngineError::Conflict)));

    first.await.unwrap().unwrap();
    assert_eq!(h.runtime.live_count(), 1);
    assert_eq!(h.strategies.get(id).status, StrategyStatus::Running);
}

#[tokio::test]
async fn stop_issued_during_start_waits_and_then_stops() {
    let h = harness();
    let id = h.seed_strategy();
    h.runtime.set_create_delay(Duration::from_millis(200));

    let owner = h.owner;
    let orchestrator = Arc::new(h.orchestrator);
    let starter = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.start(owner, id).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Waits for the in-flight start, re-reads state, then acts.
    let outcome = orchestrator.stop(owner, id).await.unwrap();
    assert_eq!(outcome, StopOutcome::Stopped);

    starter.await.unwrap().unwrap();
    assert_eq!(h.strategies.get(id).status, StrategyStatus::Stopped);
    assert_eq!(h.runtime.live_count(), 0);
}

#[tokio::test]
async fn run_once_returns_captured_output_and_records_history() {
    let h = harness();
    h.runtime.set_script(&["hello from sandbox\n"], Some(0));

    let output = h
        .orchestrator
        .run_once(h.owner, "print('hello')", BrokerKind::Dhan)
        .await
        .unwrap();

    assert!(output.contains("hello from sandbox"));
    assert_eq!(h.runtime.live_count(), 0); // one-shot sandboxes are removed

    let runs = h.runs.all();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].strategy_id, None);
    assert_eq!(runs[0].status, RunStatus::Success);
    assert!(runs[0].terminal_output.contains("hello from sandbox"));
}

#[tokio::test]
async fn run_once_nonzero_exit_still_returns_output() {
    let h = harness();
    h.runtime.set_script(&["traceback\n"], Some(2));

    let output = h
        .orchestrator
        .run_once(h.owner, "raise SystemExit(2)", BrokerKind::Dhan)
        .await
        .unwrap();

    assert!(output.contains("traceback"));
    let runs = h.runs.all();
    assert_eq!(runs[0].status, RunStatus::Error);
    assert!(runs[0]
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("2"));
}

#[tokio::test]
async fn run_once_deadline_returns_partial_output() {
    let h = harness_with_timeout(Duration::from_millis(200));
    // Emits one line and then hangs forever.
    h.runtime.set_script(&["partial line\n"], None);

    let err = h
        .orchestrator
        .run_once(h.owner, "while True: pass", BrokerKind::Dhan)
        .await
        .unwrap_err();

    match err {
        EngineError::Timeout { output, .. } => assert!(output.contains("partial line")),
        other => panic!("expected Timeout, got {:?}", other),
    }
    assert_eq!(h.runtime.live_count(), 0); // force-removed on deadline

    let runs = h.runs.all();
    assert_eq!(runs[0].status, RunStatus::Error);
    assert!(runs[0].terminal_output.contains("partial line"));
}

#[tokio::test]
async fn run_history_lists_newest_first() {
    let h = harness();
    h.runtime.set_script(&["ok\n"], Some(0));

    h.orchestrator
        .run_once(h.owner, "print(1)", BrokerKind::Dhan)
        .await
        .unwrap();
    h.orchestrator
        .run_once(h.owner, "print(2)", BrokerKind::Dhan)
        .await
        .unwrap();

    let listed = h.runs.list_for_owner(h.owner, 0, 10).await.unwrap();
    assert_eq!(listed.len(), 2);
    let newest_id = h.runs.all().last().map(|r| r.id);
    assert_eq!(Some(listed[0].id), newest_id);

    let page_two = h.runs.list_for_owner(h.owner, 1, 1).await.unwrap();
    assert_eq!(page_two.len(), 1);
    assert_ne!(Some(page_two[0].id), newest_id);
}
