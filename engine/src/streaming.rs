//! Output capture and live streaming.
//!
//! Each running sandbox gets one capture task that consumes its demultiplexed
//! output, appends every chunk to the run's buffer, and fans it out on a
//! per-strategy broadcast channel. Delivery to live subscribers is
//! at-most-once and not retroactive; the finalized run record holds the full
//! transcript. When the stream ends the task resolves the exit status and
//! finalizes the pending run record.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt;
use shared::models::RunStatus;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::environment::SandboxHandle;
use crate::runtime::{ContainerRuntime, LogChunk, LogStream, RuntimeError};
use crate::store::{RunOutcome, RunStore};

/// In-memory transcript of one live run.
pub type RunBuffer = Arc<Mutex<String>>;

pub struct OutputHub {
    capacity: usize,
    channels: RwLock<HashMap<Uuid, broadcast::Sender<LogChunk>>>,
    buffers: RwLock<HashMap<Uuid, RunBuffer>>,
}

impl OutputHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            channels: RwLock::new(HashMap::new()),
            buffers: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to a strategy's live output. The channel is created lazily;
    /// a late subscriber only sees chunks emitted after this call.
    pub async fn subscribe(&self, strategy_id: Uuid) -> broadcast::Receiver<LogChunk> {
        let mut channels = self.channels.write().await;
        match channels.get(&strategy_id) {
            Some(sender) => sender.subscribe(),
            None => {
                let (sender, receiver) = broadcast::channel(self.capacity);
                channels.insert(strategy_id, sender);
                receiver
            }
        }
    }

    /// Prune the channel once the last receiver is gone. Future subscribers
    /// start with a fresh channel.
    pub async fn unsubscribe(&self, strategy_id: Uuid) {
        let mut channels = self.channels.write().await;
        if let Some(sender) = channels.get(&strategy_id) {
            if sender.receiver_count() == 0 {
                channels.remove(&strategy_id);
                info!(
                    "Removed log channel for strategy {} - no more subscribers",
                    strategy_id
                );
            }
        }
    }

    pub async fn subscriber_count(&self, strategy_id: Uuid) -> usize {
        let channels = self.channels.read().await;
        channels
            .get(&strategy_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    async fn publish(&self, strategy_id: Uuid, chunk: LogChunk) {
        let channels = self.channels.read().await;
        if let Some(sender) = channels.get(&strategy_id) {
            // A send error just means nobody is listening right now.
            let _ = sender.send(chunk);
        }
    }

    /// Open a fresh transcript buffer for a run that is about to start.
    pub async fn open_run(&self, strategy_id: Uuid) -> RunBuffer {
        let buffer: RunBuffer = Arc::new(Mutex::new(String::new()));
        self.buffers
            .write()
            .await
            .insert(strategy_id, buffer.clone());
        buffer
    }

    /// Remove the live buffer and return its contents, if a run is open.
    pub async fn take_buffer(&self, strategy_id: Uuid) -> Option<String> {
        let buffer = self.buffers.write().await.remove(&strategy_id)?;
        let contents = buffer.lock().await.clone();
        Some(contents)
    }

    /// Drop the buffer entry, but only if it still belongs to this run — a
    /// newer run for the same strategy may have replaced it.
    async fn close_run(&self, strategy_id: Uuid, buffer: &RunBuffer) {
        let mut buffers = self.buffers.write().await;
        if let Some(current) = buffers.get(&strategy_id) {
            if Arc::ptr_eq(current, buffer) {
                buffers.remove(&strategy_id);
            }
        }
    }

    /// Spawn the capture task for a freshly started sandbox. The task owns
    /// the stream for the sandbox's entire lifetime; it only writes to the
    /// run store and the broadcast channel, and never propagates its own
    /// failures into request handlers.
    pub fn spawn_capture(
        self: &Arc<Self>,
        runtime: Arc<dyn ContainerRuntime>,
        runs: Arc<dyn RunStore>,
        mut stream: LogStream,
        sandbox: SandboxHandle,
        run_id: Uuid,
        buffer: RunBuffer,
    ) {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(chunk) = stream.next().await {
                buffer.lock().await.push_str(&chunk.text);
                hub.publish(sandbox.strategy_id, chunk).await;
            }

            // Stream end: the sandbox exited on its own or was removed
            // underneath us by an explicit stop.
            let (status, error_message) = match runtime.wait(&sandbox.name).await {
                Ok(0) => (RunStatus::Success, None),
                Ok(code) => (
                    RunStatus::Error,
                    Some(format!("sandbox exited with code {}", code)),
                ),
                Err(RuntimeError::NotFound { .. }) => (RunStatus::Stopped, None),
                Err(err) => {
                    warn!(
                        "Could not determine exit of sandbox {}: {}",
                        sandbox.name, err
                    );
                    (RunStatus::Error, Some(err.to_string()))
                }
            };

            let output = buffer.lock().await.clone();
            let outcome = RunOutcome {
                status,
                output,
                error_message,
                stopped_at: Utc::now(),
            };
            match runs.finalize(run_id, outcome).await {
                Ok(true) => info!("Run {} finalized as {}", run_id, status),
                Ok(false) => {} // an explicit stop got there first
                Err(err) => error!("Failed to finalize run {}: {}", run_id, err),
            }

            hub.close_run(sandbox.strategy_id, &buffer).await;
        });
    }
}
