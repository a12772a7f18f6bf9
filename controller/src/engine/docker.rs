use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::models::{HostConfig, RestartPolicy, RestartPolicyNameEnum};
use futures_util::StreamExt;
use tokio::sync::{Semaphore, SemaphorePermit};

use fovea_common::config::HardwareConfig;

use super::logs::{LogEvent, parse_line};
use super::{ContainerEngine, ContainerState, EngineError, EngineResult};
use crate::model::device_id_from_name;

/// Fixed worker command; the image carries the detection program.
const WORKER_ENTRYPOINT: &[&str] = &["python", "transmit.py", "--weights", "yolov5s.pt"];

/// One shared client for the whole process; service and reconcilers all
/// go through the same bounded slot pool.
pub struct DockerEngine {
    client: Docker,
    image: String,
    device_arg: String,
    slots: Semaphore,
    start_timeout: Duration,
    stop_timeout: Duration,
}

impl DockerEngine {
    pub fn new(
        hardware: &HardwareConfig,
        workers: usize,
        start_timeout: Duration,
        stop_timeout: Duration,
    ) -> EngineResult<Self> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|source| EngineError::Unavailable { source })?;
        Ok(DockerEngine {
            client,
            image: hardware.image_tag().to_string(),
            device_arg: hardware.device_arg().to_string(),
            slots: Semaphore::new(workers),
            start_timeout,
            stop_timeout,
        })
    }

    async fn slot(&self) -> SemaphorePermit<'_> {
        self.slots.acquire().await.expect("engine slot pool closed")
    }

    /// Tail the container's log stream until the worker reports a started
    /// stream. Only lines emitted at or after `since` are scanned: a
    /// restarted container still carries the previous run's markers in
    /// its backlog, and those must not satisfy (or fail) this barrier.
    /// Failure and timeout both force-remove the container so a failed
    /// start leaves nothing behind.
    async fn wait_for_start(&self, name: &str, since: i64) -> EngineResult<()> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            since,
            ..Default::default()
        };
        let mut stream = self.client.logs(name, Some(options));

        let scan = async {
            while let Some(item) = stream.next().await {
                let line = item.map_err(|e| map_err(name, e))?.to_string();
                match parse_line(&line) {
                    LogEvent::StreamStarted | LogEvent::Goal => return Ok(()),
                    LogEvent::WorkerError(line) => {
                        return Err(EngineError::Worker {
                            name: name.to_string(),
                            line,
                        });
                    }
                    LogEvent::Other => {}
                }
            }
            Err(EngineError::Worker {
                name: name.to_string(),
                line: "log stream closed before the stream started".to_string(),
            })
        };

        match tokio::time::timeout(self.start_timeout, scan).await {
            Ok(Ok(())) => {
                tracing::info!(container = name, "worker reported stream started");
                Ok(())
            }
            Ok(Err(e)) => {
                self.force_remove(name).await;
                Err(e)
            }
            Err(_) => {
                self.force_remove(name).await;
                Err(EngineError::StartTimeout {
                    name: name.to_string(),
                })
            }
        }
    }

    async fn force_remove(&self, name: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.client.remove_container(name, Some(options)).await {
            Ok(()) => {}
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => tracing::warn!(container = name, error = %e, "failed to remove container"),
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> EngineResult<()> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|source| EngineError::Unavailable { source })
    }

    async fn get(&self, name: &str) -> EngineResult<ContainerState> {
        let _permit = self.slot().await;
        let info = self
            .client
            .inspect_container(name, None)
            .await
            .map_err(|e| map_err(name, e))?;
        let status = info
            .state
            .and_then(|s| s.status)
            .map(|s| s.to_string())
            .unwrap_or_default();
        Ok(ContainerState {
            name: name.to_string(),
            status,
        })
    }

    async fn exists(&self, name: &str) -> EngineResult<bool> {
        match self.get(name).await {
            Ok(_) => Ok(true),
            Err(EngineError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list_controlled(&self) -> EngineResult<Vec<String>> {
        let _permit = self.slot().await;
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let summaries = self.client.list_containers(Some(options)).await?;
        let names = summaries
            .into_iter()
            .flat_map(|summary| summary.names.unwrap_or_default())
            .filter_map(|name| {
                let name = name.strip_prefix('/').unwrap_or(&name).to_string();
                device_id_from_name(&name).map(|_| name)
            })
            .collect();
        Ok(names)
    }

    async fn run(&self, name: &str, stream_url: &str, device_id: i64) -> EngineResult<()> {
        let _permit = self.slot().await;
        tracing::info!(container = name, "creating container");
        let since = chrono::Utc::now().timestamp();

        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        let command = vec![
            "--device".to_string(),
            self.device_arg.clone(),
            "--source".to_string(),
            stream_url.to_string(),
            "--device-id".to_string(),
            device_id.to_string(),
        ];
        let config = Config {
            image: Some(self.image.clone()),
            entrypoint: Some(WORKER_ENTRYPOINT.iter().map(|s| s.to_string()).collect()),
            cmd: Some(command),
            host_config: Some(HostConfig {
                network_mode: Some("host".to_string()),
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::ON_FAILURE),
                    maximum_retry_count: Some(1),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.client
            .create_container(Some(options), config)
            .await
            .map_err(|e| map_err(name, e))?;
        self.client
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_err(name, e))?;

        self.wait_for_start(name, since).await
    }

    async fn start(&self, name: &str) -> EngineResult<()> {
        let _permit = self.slot().await;
        tracing::info!(container = name, "starting container");
        // Stamp before the start so the barrier only sees this run's
        // output, never the exited run's backlog.
        let since = chrono::Utc::now().timestamp();
        self.client
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_err(name, e))?;
        self.wait_for_start(name, since).await
    }

    async fn stop(&self, name: &str) -> EngineResult<()> {
        let _permit = self.slot().await;
        tracing::info!(container = name, "stopping container");
        let options = StopContainerOptions {
            t: self.stop_timeout.as_secs() as i64,
        };
        match self.client.stop_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_err(name, e)),
        }
    }

    async fn remove(&self, name: &str, force: bool) -> EngineResult<()> {
        let _permit = self.slot().await;
        tracing::info!(container = name, force, "removing container");
        if !force {
            let options = StopContainerOptions {
                t: self.stop_timeout.as_secs() as i64,
            };
            match self.client.stop_container(name, Some(options)).await {
                Ok(())
                | Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 304, ..
                }) => {}
                Err(e) => return Err(map_err(name, e)),
            }
        }
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.client
            .remove_container(name, Some(options))
            .await
            .map_err(|e| map_err(name, e))
    }

    async fn pause(&self, name: &str) -> EngineResult<()> {
        let _permit = self.slot().await;
        tracing::info!(container = name, "pausing container");
        self.client
            .pause_container(name)
            .await
            .map_err(|e| map_err(name, e))
    }

    async fn unpause(&self, name: &str) -> EngineResult<()> {
        let _permit = self.slot().await;
        tracing::info!(container = name, "unpausing container");
        self.client
            .unpause_container(name)
            .await
            .map_err(|e| map_err(name, e))
    }
}

fn map_err(name: &str, err: bollard::errors::Error) -> EngineError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => EngineError::NotFound {
            name: name.to_string(),
        },
        other => EngineError::Api { source: other },
    }
}
