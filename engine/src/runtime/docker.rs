//! Docker-backed implementation of the container runtime seam.

use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::Docker;
use chrono::Utc;
use futures_util::StreamExt;

use super::{ContainerRuntime, LogChannel, LogChunk, LogStream, RuntimeError, SandboxSpec};

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon.
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| RuntimeError::Api {
            reason: format!("failed to connect to Docker daemon: {}", e),
        })?;
        Ok(DockerRuntime { docker })
    }
}

/// A 404 from the daemon means the named container does not exist; everything
/// else is surfaced as an API failure.
fn map_err(name: &str, err: bollard::errors::Error) -> RuntimeError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound {
            name: name.to_string(),
        },
        other => RuntimeError::Api {
            reason: other.to_string(),
        },
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &SandboxSpec) -> Result<String, RuntimeError> {
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            env: Some(spec.env.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| map_err(&spec.name, e))?;

        Ok(created.id)
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_err(name, e))
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .stop_container(name, None::<StopContainerOptions>)
            .await
            .map_err(|e| map_err(name, e))
    }

    async fn pause(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .pause_container(name)
            .await
            .map_err(|e| map_err(name, e))
    }

    async fn unpause(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .unpause_container(name)
            .await
            .map_err(|e| map_err(name, e))
    }

    async fn remove(&self, name: &str, force: bool) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.docker
            .remove_container(name, Some(options))
            .await
            .map_err(|e| map_err(name, e))
    }

    async fn wait(&self, name: &str) -> Result<i64, RuntimeError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait_stream = self.docker.wait_container(name, Some(options));
        match wait_stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports nonzero exits through this error variant
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(map_err(name, e)),
            None => Err(RuntimeError::Api {
                reason: format!("wait on {} ended without a status", name),
            }),
        }
    }

    async fn attach(&self, name: &str) -> Result<LogStream, RuntimeError> {
        let docker = self.docker.clone();
        let name = name.to_string();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        // Pump the daemon's follow-stream into a channel. The pump exits when
        // the sandbox stops producing output or the receiver is dropped.
        tokio::spawn(async move {
            let options = LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: true,
                ..Default::default()
            };
            let mut logs = docker.logs(&name, Some(options));
            while let Some(item) = logs.next().await {
                let chunk = match item {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        LogChunk {
                            timestamp: Utc::now(),
                            channel: LogChannel::Stdout,
                            text: String::from_utf8_lossy(&message).to_string(),
                        }
                    }
                    Ok(LogOutput::StdErr { message }) => LogChunk {
                        timestamp: Utc::now(),
                        channel: LogChannel::Stderr,
                        text: String::from_utf8_lossy(&message).to_string(),
                    },
                    Ok(_) => continue,
                    Err(_) => break,
                };
                if tx.send(chunk).is_err() {
                    break;
                }
            }
        });

        let chunks = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        });
        Ok(Box::pin(chunks))
    }
}
