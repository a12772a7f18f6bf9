//! The instance state machine. Every command runs inside one database
//! transaction; the row mutation happens first, the engine call second,
//! and an engine failure unwinds the row change.

use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use deadpool_postgres::Pool;

use crate::engine::{ContainerEngine, EngineError};
use crate::messages::Action;
use crate::model::{Instance, InstanceStatus, container_name};
use crate::store;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("instance {0} not found")]
    NotFound(i64),

    #[error("instance {0} already exists")]
    AlreadyExists(i64),

    /// Engine-side failure after the row op; the transaction was rolled
    /// back and the caller is told 5000.
    #[error("internal error: {0}")]
    Internal(anyhow::Error),

    /// A bug (domain invariant, connectivity, poisoned state): never
    /// mapped to an ack, the message is dead-lettered instead.
    #[error("unexpected error: {0}")]
    Unexpected(anyhow::Error),
}

/// What a command does in a given state. Pure; the whole table lives in
/// one exhaustive match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Absent + START: insert the row, then run a fresh container.
    CreateAndRun,
    /// PAUSED + START: row back to ACTIVE, unpause the container.
    Resume,
    /// INACTIVE + START: row back to ACTIVE, restart the exited container.
    Restart,
    /// ACTIVE + START: conflict, the engine is not touched.
    Conflict,
    /// STOP on a live row: row to INACTIVE, drop the published stream
    /// URL, force-remove the container.
    Deactivate,
    /// PAUSE on a non-paused row: row to PAUSED, pause the container.
    Pause,
    /// REMOVE on any row: delete the row, force-remove the container.
    Delete,
    NotFound,
    Noop,
}

pub fn transition(action: Action, state: Option<InstanceStatus>) -> Transition {
    use InstanceStatus::{Active, Inactive, Paused};
    match (action, state) {
        (Action::Start, None) => Transition::CreateAndRun,
        (Action::Start, Some(Active)) => Transition::Conflict,
        (Action::Start, Some(Paused)) => Transition::Resume,
        (Action::Start, Some(Inactive)) => Transition::Restart,

        (Action::Stop, None) => Transition::NotFound,
        (Action::Stop, Some(Inactive)) => Transition::Noop,
        (Action::Stop, Some(Active | Paused)) => Transition::Deactivate,

        (Action::Pause, None) => Transition::NotFound,
        (Action::Pause, Some(Paused)) => Transition::Noop,
        (Action::Pause, Some(Active | Inactive)) => Transition::Pause,

        (Action::Remove, None) => Transition::Noop,
        (Action::Remove, Some(_)) => Transition::Delete,
    }
}

pub struct InstanceService {
    pool: Pool,
    engine: Arc<dyn ContainerEngine>,
}

impl InstanceService {
    pub fn new(pool: Pool, engine: Arc<dyn ContainerEngine>) -> Self {
        InstanceService { pool, engine }
    }

    /// Shared-queue filter: commands for devices without a container on
    /// this engine are not ours.
    pub async fn owns_device(&self, device_id: i64) -> Result<bool, ServiceError> {
        self.engine
            .exists(&container_name(device_id))
            .await
            .map_err(|e| ServiceError::Internal(anyhow!(e)))
    }

    pub async fn handle(
        &self,
        action: Action,
        device_id: i64,
        stream_url: Option<&str>,
    ) -> Result<(), ServiceError> {
        let name = container_name(device_id);
        let mut client = self.pool.get().await.map_err(unexpected)?;
        let tx = client.transaction().await.map_err(unexpected)?;

        let stored = store::get(&tx, device_id)
            .await
            .map_err(ServiceError::Unexpected)?;

        match (transition(action, stored.as_ref().map(|i| i.status)), stored) {
            (Transition::Conflict, _) => Err(ServiceError::AlreadyExists(device_id)),
            (Transition::NotFound, _) => Err(ServiceError::NotFound(device_id)),
            (Transition::Noop, _) => Ok(()),

            (Transition::CreateAndRun, None) => {
                let stream_url = stream_url
                    .ok_or_else(|| unexpected(anyhow!("START dispatched without a stream url")))?;
                let instance = Instance::started(device_id, Utc::now());
                match store::create(&tx, &instance).await {
                    Ok(_) => {}
                    Err(e) if store::is_unique_violation(&e) => {
                        return Err(ServiceError::AlreadyExists(device_id));
                    }
                    Err(e) => return Err(ServiceError::Unexpected(e)),
                }
                tracing::info!(device_id, "created instance");
                // Dropping the uncommitted transaction on error rolls the
                // insert back; row and container stay consistent.
                self.engine
                    .run(&name, stream_url, device_id)
                    .await
                    .map_err(internal)?;
                tx.commit().await.map_err(unexpected)?;
                Ok(())
            }

            (Transition::Resume, Some(stored)) => {
                tracing::info!(device_id, "resuming instance");
                self.update_row(&tx, &stored, InstanceStatus::Active).await?;
                self.engine.unpause(&name).await.map_err(internal)?;
                tx.commit().await.map_err(unexpected)?;
                Ok(())
            }

            (Transition::Restart, Some(stored)) => {
                tracing::info!(device_id, "restarting instance");
                self.update_row(&tx, &stored, InstanceStatus::Active).await?;
                self.engine.start(&name).await.map_err(internal)?;
                tx.commit().await.map_err(unexpected)?;
                Ok(())
            }

            (Transition::Deactivate, Some(stored)) => {
                tracing::info!(device_id, "stopping instance");
                self.update_row(&tx, &stored, InstanceStatus::Inactive)
                    .await?;
                store::clear_processed_stream(&tx, device_id)
                    .await
                    .map_err(ServiceError::Unexpected)?;
                match self.engine.remove(&name, true).await {
                    Ok(()) => {
                        tx.commit().await.map_err(unexpected)?;
                        Ok(())
                    }
                    // Drift: the row is the source of intent and still
                    // transitions, but the caller learns the container
                    // was gone.
                    Err(EngineError::NotFound { .. }) => {
                        tx.commit().await.map_err(unexpected)?;
                        Err(ServiceError::NotFound(device_id))
                    }
                    Err(e) => Err(internal(e)),
                }
            }

            (Transition::Pause, Some(stored)) => {
                tracing::info!(device_id, "pausing instance");
                self.update_row(&tx, &stored, InstanceStatus::Paused).await?;
                match self.engine.pause(&name).await {
                    Ok(()) => {
                        tx.commit().await.map_err(unexpected)?;
                        Ok(())
                    }
                    Err(EngineError::NotFound { .. }) => {
                        tx.commit().await.map_err(unexpected)?;
                        Err(ServiceError::NotFound(device_id))
                    }
                    Err(e) => Err(internal(e)),
                }
            }

            (Transition::Delete, Some(_)) => {
                tracing::info!(device_id, "removing instance");
                store::delete(&tx, device_id)
                    .await
                    .map_err(ServiceError::Unexpected)?;
                store::clear_processed_stream(&tx, device_id)
                    .await
                    .map_err(ServiceError::Unexpected)?;
                match self.engine.remove(&name, true).await {
                    // Idempotent: a missing container is already removed
                    Ok(()) | Err(EngineError::NotFound { .. }) => {
                        tx.commit().await.map_err(unexpected)?;
                        Ok(())
                    }
                    Err(e) => Err(internal(e)),
                }
            }

            (t, stored) => Err(unexpected(anyhow!(
                "transition {t:?} does not apply to state {:?}",
                stored.map(|i| i.status)
            ))),
        }
    }

    async fn update_row(
        &self,
        tx: &deadpool_postgres::Transaction<'_>,
        stored: &Instance,
        status: InstanceStatus,
    ) -> Result<(), ServiceError> {
        let updated = stored
            .with_status(status, Utc::now())
            .map_err(|e| unexpected(anyhow!(e)))?;
        store::update(tx, &updated)
            .await
            .map_err(ServiceError::Unexpected)?;
        Ok(())
    }
}

fn internal(e: EngineError) -> ServiceError {
    ServiceError::Internal(anyhow!(e))
}

fn unexpected(e: impl Into<anyhow::Error>) -> ServiceError {
    ServiceError::Unexpected(e.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use InstanceStatus::{Active, Inactive, Paused};

    #[test]
    fn start_transitions() {
        assert_eq!(transition(Action::Start, None), Transition::CreateAndRun);
        assert_eq!(transition(Action::Start, Some(Active)), Transition::Conflict);
        assert_eq!(transition(Action::Start, Some(Paused)), Transition::Resume);
        assert_eq!(transition(Action::Start, Some(Inactive)), Transition::Restart);
    }

    #[test]
    fn stop_transitions() {
        assert_eq!(transition(Action::Stop, None), Transition::NotFound);
        assert_eq!(transition(Action::Stop, Some(Active)), Transition::Deactivate);
        assert_eq!(transition(Action::Stop, Some(Paused)), Transition::Deactivate);
        // already stopped: idempotent success
        assert_eq!(transition(Action::Stop, Some(Inactive)), Transition::Noop);
    }

    #[test]
    fn pause_transitions() {
        assert_eq!(transition(Action::Pause, None), Transition::NotFound);
        assert_eq!(transition(Action::Pause, Some(Active)), Transition::Pause);
        assert_eq!(transition(Action::Pause, Some(Paused)), Transition::Noop);
        assert_eq!(transition(Action::Pause, Some(Inactive)), Transition::Pause);
    }

    #[test]
    fn remove_transitions() {
        // removing an absent instance is idempotent success
        assert_eq!(transition(Action::Remove, None), Transition::Noop);
        assert_eq!(transition(Action::Remove, Some(Active)), Transition::Delete);
        assert_eq!(transition(Action::Remove, Some(Paused)), Transition::Delete);
        assert_eq!(transition(Action::Remove, Some(Inactive)), Transition::Delete);
    }
}
