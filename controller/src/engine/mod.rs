//! Container engine adapter. The engine is the source of truth for
//! container *existence*; the store is the source of truth for intent.

use async_trait::async_trait;

mod docker;
mod logs;

pub use docker::DockerEngine;
pub use logs::LogEvent;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("container {name} not found")]
    NotFound { name: String },

    #[error("container engine unreachable: {source}")]
    Unavailable {
        #[source]
        source: bollard::errors::Error,
    },

    #[error("container engine error: {source}")]
    Api {
        #[from]
        source: bollard::errors::Error,
    },

    #[error("worker in {name} failed to start: {line}")]
    Worker { name: String, line: String },

    #[error("container {name} did not report a started stream in time")]
    StartTimeout { name: String },
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Observed state of one container.
#[derive(Debug, Clone)]
pub struct ContainerState {
    pub name: String,
    pub status: String,
}

impl ContainerState {
    pub fn is_exited(&self) -> bool {
        self.status == "exited"
    }
}

/// Asynchronous contract over the container daemon. Every call either
/// yields a result or an [`EngineError`]; none blocks the scheduler.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Liveness gate, used before every reconcile pass.
    async fn ping(&self) -> EngineResult<()>;

    async fn get(&self, name: &str) -> EngineResult<ContainerState>;

    async fn exists(&self, name: &str) -> EngineResult<bool>;

    /// Names of every control-plane-owned container (`instance-<digits>`),
    /// including stopped ones.
    async fn list_controlled(&self) -> EngineResult<Vec<String>>;

    /// Create and start a worker container, then block until its log
    /// stream reports a started stream (or fails, or times out). A failed
    /// start leaves no container behind.
    async fn run(&self, name: &str, stream_url: &str, device_id: i64) -> EngineResult<()>;

    /// Restart an exited container and wait for the start barrier again.
    async fn start(&self, name: &str) -> EngineResult<()>;

    async fn stop(&self, name: &str) -> EngineResult<()>;

    async fn remove(&self, name: &str, force: bool) -> EngineResult<()>;

    async fn pause(&self, name: &str) -> EngineResult<()>;

    async fn unpause(&self, name: &str) -> EngineResult<()>;
}
