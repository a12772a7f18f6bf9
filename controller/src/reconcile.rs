//! Background repair: the reaper retires long-stale non-active rows and
//! the consistency scanner reconciles rows against the engine. Both are
//! best-effort; a failed id is logged and the pass moves on.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use futures::future;
use tokio_util::sync::CancellationToken;

use crate::bus::{ACK_EXCHANGE, Bus};
use crate::engine::{ContainerEngine, EngineError};
use crate::messages::{Notification, NotificationAction};
use crate::model::{Instance, InstanceStatus, container_name, device_id_from_name};
use crate::store;

/// Row-vs-container repair decided from one observation. `container` is
/// the observed container status, `None` when no container exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftAction {
    /// No container behind the row: the row goes.
    DeleteRow,
    /// Container exited but the row still claims otherwise.
    MarkInactive,
    None,
}

pub fn drift_action(row_status: InstanceStatus, container: Option<&str>) -> DriftAction {
    match container {
        None => DriftAction::DeleteRow,
        Some("exited") if row_status != InstanceStatus::Inactive => DriftAction::MarkInactive,
        Some(_) => DriftAction::None,
    }
}

pub fn is_reapable(updated_at: DateTime<Utc>, now: DateTime<Utc>, min_age: chrono::Duration) -> bool {
    updated_at < now - min_age
}

enum Drift {
    Updated(i64),
    Removed(i64),
}

pub struct Reconciler {
    pool: Pool,
    engine: Arc<dyn ContainerEngine>,
    bus: Arc<Bus>,
    notification_routing_key: String,
    reaper_period: Duration,
    scanner_period: Duration,
    reaper_min_age: chrono::Duration,
}

impl Reconciler {
    pub fn new(
        pool: Pool,
        engine: Arc<dyn ContainerEngine>,
        bus: Arc<Bus>,
        notification_routing_key: String,
        reaper_period: Duration,
        scanner_period: Duration,
        reaper_min_age: chrono::Duration,
    ) -> Self {
        Reconciler {
            pool,
            engine,
            bus,
            notification_routing_key,
            reaper_period,
            scanner_period,
            reaper_min_age,
        }
    }

    /// Retires stale rows every period. Iterations never overlap: the
    /// sleep starts only once the pass has finished.
    pub async fn run_reaper(&self, cancel: CancellationToken) {
        tracing::info!(period = ?self.reaper_period, "reaper started");
        loop {
            if let Err(e) = self.reap_pass().await {
                tracing::error!(error = ?e, "reaper pass failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.reaper_period) => {}
            }
        }
        tracing::info!("reaper stopped");
    }

    pub async fn run_scanner(&self, cancel: CancellationToken) {
        tracing::info!(period = ?self.scanner_period, "consistency scanner started");
        loop {
            if let Err(e) = self.scan_pass().await {
                tracing::error!(error = ?e, "consistency pass failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.scanner_period) => {}
            }
        }
        tracing::info!("consistency scanner stopped");
    }

    async fn reap_pass(&self) -> Result<()> {
        if let Err(e) = self.engine.ping().await {
            tracing::warn!(error = %e, "engine unreachable, skipping reaper pass");
            return Ok(());
        }
        let rows = store::old_inactive(&self.pool, self.reaper_min_age).await?;
        if rows.is_empty() {
            return Ok(());
        }
        tracing::info!(count = rows.len(), "reaping stale instances");
        future::join_all(rows.into_iter().map(|instance| async move {
            let id = instance.id;
            if let Err(e) = self.reap_one(instance).await {
                tracing::error!(device_id = id, error = ?e, "failed to reap instance");
            }
        }))
        .await;
        Ok(())
    }

    async fn reap_one(&self, instance: Instance) -> Result<()> {
        let name = container_name(instance.id);
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        // The candidate list was read unlocked; re-check under the row
        // lock so a concurrent command wins.
        let Some(stored) = store::get(&tx, instance.id).await? else {
            return Ok(());
        };
        let now = Utc::now();
        if stored.status != instance.status
            || !is_reapable(stored.updated_at, now, self.reaper_min_age)
        {
            return Ok(());
        }

        match stored.status {
            InstanceStatus::Paused => {
                match self.engine.stop(&name).await {
                    Ok(()) | Err(EngineError::NotFound { .. }) => {}
                    Err(e) => return Err(anyhow!(e)),
                }
                let updated = stored.with_status(InstanceStatus::Inactive, now)?;
                store::update(&tx, &updated).await?;
                tx.commit().await?;
                tracing::info!(device_id = instance.id, "stopped stale paused instance");
            }
            InstanceStatus::Inactive => {
                match self.engine.remove(&name, true).await {
                    Ok(()) | Err(EngineError::NotFound { .. }) => {}
                    Err(e) => return Err(anyhow!(e)),
                }
                store::delete(&tx, instance.id).await?;
                store::clear_processed_stream(&tx, instance.id).await?;
                tx.commit().await?;
                tracing::info!(device_id = instance.id, "removed stale inactive instance");
            }
            // not selected by the candidate query
            InstanceStatus::Active => {}
        }
        Ok(())
    }

    async fn scan_pass(&self) -> Result<()> {
        let rows = store::all(&self.pool).await?;
        let known: HashSet<i64> = rows.iter().map(|instance| instance.id).collect();

        let drifts = future::join_all(rows.into_iter().map(|instance| self.check_one(instance)))
            .await;

        let mut updated = Vec::new();
        let mut removed = Vec::new();
        for drift in drifts.into_iter().flatten() {
            match drift {
                Drift::Updated(id) => updated.push(id),
                Drift::Removed(id) => removed.push(id),
            }
        }

        self.sweep_ghosts(&known).await;

        if !updated.is_empty() {
            self.notify(
                NotificationAction::UpdatedInstance,
                updated,
                "instances were inconsistent and were set to INACTIVE",
            )
            .await;
        }
        if !removed.is_empty() {
            self.notify(
                NotificationAction::RemovedInstance,
                removed,
                "instances had no container and were removed",
            )
            .await;
        }
        Ok(())
    }

    async fn check_one(&self, instance: Instance) -> Option<Drift> {
        let name = container_name(instance.id);
        let container = match self.engine.get(&name).await {
            Ok(state) => Some(state),
            Err(EngineError::NotFound { .. }) => None,
            Err(e) => {
                tracing::error!(device_id = instance.id, error = %e, "consistency check failed");
                return None;
            }
        };

        let action = drift_action(
            instance.status,
            container.as_ref().map(|state| state.status.as_str()),
        );
        let result = match action {
            DriftAction::None => return None,
            DriftAction::DeleteRow => self.delete_row(instance.id).await.map(|done| {
                done.then(|| {
                    tracing::warn!(device_id = instance.id, "container disappeared, row removed");
                    Drift::Removed(instance.id)
                })
            }),
            DriftAction::MarkInactive => self.mark_inactive(instance.id).await.map(|done| {
                done.then(|| {
                    tracing::warn!(device_id = instance.id, "container exited, row set to INACTIVE");
                    Drift::Updated(instance.id)
                })
            }),
        };
        match result {
            Ok(drift) => drift,
            Err(e) => {
                tracing::error!(device_id = instance.id, error = ?e, "failed to repair instance");
                None
            }
        }
    }

    async fn delete_row(&self, id: i64) -> Result<bool> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        if store::get(&tx, id).await?.is_none() {
            return Ok(false);
        }
        store::delete(&tx, id).await?;
        store::clear_processed_stream(&tx, id).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn mark_inactive(&self, id: i64) -> Result<bool> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let Some(stored) = store::get(&tx, id).await? else {
            return Ok(false);
        };
        if stored.status == InstanceStatus::Inactive {
            return Ok(false);
        }
        let updated = stored.with_status(InstanceStatus::Inactive, Utc::now())?;
        store::update(&tx, &updated).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Controlled containers without a row. Exited ones are removed;
    /// running ones are only reported, a START may be mid-transaction.
    async fn sweep_ghosts(&self, known: &HashSet<i64>) {
        let names = match self.engine.list_controlled().await {
            Ok(names) => names,
            Err(e) => {
                tracing::debug!(error = %e, "skipping ghost sweep");
                return;
            }
        };
        for name in names {
            let Some(id) = device_id_from_name(&name) else {
                continue;
            };
            if known.contains(&id) {
                continue;
            }
            match self.engine.get(&name).await {
                Ok(state) if state.is_exited() => {
                    tracing::warn!(container = %name, "removing exited ghost container");
                    match self.engine.remove(&name, true).await {
                        Ok(()) | Err(EngineError::NotFound { .. }) => {}
                        Err(e) => {
                            tracing::error!(container = %name, error = %e, "failed to remove ghost")
                        }
                    }
                }
                Ok(state) => {
                    tracing::warn!(container = %name, status = %state.status, "container has no instance row");
                }
                Err(EngineError::NotFound { .. }) => {}
                Err(e) => tracing::error!(container = %name, error = %e, "ghost check failed"),
            }
        }
    }

    async fn notify(&self, action: NotificationAction, device_ids: Vec<i64>, message: &str) {
        let notification = Notification::new(action, device_ids, message);
        if let Err(e) = self
            .bus
            .publish(ACK_EXCHANGE, &self.notification_routing_key, &notification)
            .await
        {
            tracing::error!(error = ?e, "failed to publish reconciler notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn reaper_age_boundary() {
        let now = Utc::now();
        let min_age = Duration::minutes(5);
        assert!(!is_reapable(now - Duration::minutes(4), now, min_age));
        assert!(is_reapable(now - Duration::minutes(6), now, min_age));
    }

    #[test]
    fn drift_decisions() {
        use InstanceStatus::{Active, Inactive, Paused};

        assert_eq!(drift_action(Active, None), DriftAction::DeleteRow);
        assert_eq!(drift_action(Inactive, None), DriftAction::DeleteRow);

        assert_eq!(drift_action(Active, Some("exited")), DriftAction::MarkInactive);
        assert_eq!(drift_action(Paused, Some("exited")), DriftAction::MarkInactive);
        // already consistent
        assert_eq!(drift_action(Inactive, Some("exited")), DriftAction::None);

        assert_eq!(drift_action(Active, Some("running")), DriftAction::None);
        assert_eq!(drift_action(Paused, Some("paused")), DriftAction::None);
    }
}
