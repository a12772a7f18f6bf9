//! Transactional access to the `instance` table and the worker's
//! `processedstream` side table.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use deadpool_postgres::{Pool, Transaction};
use tokio_postgres::Row;
use tokio_postgres::error::SqlState;

use crate::model::{Instance, InstanceStatus};

pub async fn init_schema(pool: &Pool) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS instance (
                id BIGINT PRIMARY KEY,
                status TEXT NOT NULL
                    CHECK (status IN ('ACTIVE', 'INACTIVE', 'PAUSED')),
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
                    CHECK (updated_at >= created_at)
            )
            "#,
            &[],
        )
        .await
        .context("failed to create instance table")?;

    client
        .execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_instance_status_updated_at
            ON instance (status, updated_at)
            "#,
            &[],
        )
        .await
        .context("failed to create instance status index")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS processedstream (
                deviceid BIGINT PRIMARY KEY,
                processedstreamurl TEXT NOT NULL
            )
            "#,
            &[],
        )
        .await
        .context("failed to create processedstream table")?;

    tracing::info!("database schema initialized");
    Ok(())
}

/// Fetches the row for `id`, locking it for the rest of the transaction.
/// The lock is what serializes concurrent commands for one device.
pub async fn get(tx: &Transaction<'_>, id: i64) -> Result<Option<Instance>> {
    let row = tx
        .query_opt(
            r#"
            SELECT id, status, created_at, updated_at
            FROM instance
            WHERE id = $1
            FOR UPDATE
            "#,
            &[&id],
        )
        .await
        .context("failed to select instance row")?;
    row.map(instance_from_row).transpose()
}

pub async fn create(tx: &Transaction<'_>, instance: &Instance) -> Result<i64> {
    let row = tx
        .query_one(
            r#"
            INSERT INTO instance (id, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
            &[
                &instance.id,
                &instance.status.as_str(),
                &instance.created_at,
                &instance.updated_at,
            ],
        )
        .await
        .context("failed to insert instance row")?;
    Ok(row.get(0))
}

pub async fn update(tx: &Transaction<'_>, instance: &Instance) -> Result<u64> {
    tx.execute(
        r#"
        UPDATE instance
        SET status = $2, updated_at = $3
        WHERE id = $1
        "#,
        &[&instance.id, &instance.status.as_str(), &instance.updated_at],
    )
    .await
    .context("failed to update instance row")
}

pub async fn delete(tx: &Transaction<'_>, id: i64) -> Result<u64> {
    tx.execute("DELETE FROM instance WHERE id = $1", &[&id])
        .await
        .context("failed to delete instance row")
}

pub async fn clear_processed_stream(tx: &Transaction<'_>, device_id: i64) -> Result<()> {
    tx.execute("DELETE FROM processedstream WHERE deviceid = $1", &[&device_id])
        .await
        .context("failed to clear processed stream")?;
    Ok(())
}

/// Non-ACTIVE rows untouched for at least `min_age`, oldest first,
/// capped at 100 per pass. Unlocked; the reaper re-checks under lock.
pub async fn old_inactive(pool: &Pool, min_age: Duration) -> Result<Vec<Instance>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let cutoff: DateTime<Utc> = Utc::now() - min_age;
    let rows = client
        .query(
            r#"
            SELECT id, status, created_at, updated_at
            FROM instance
            WHERE status != 'ACTIVE' AND updated_at < $1
            ORDER BY updated_at
            LIMIT 100
            "#,
            &[&cutoff],
        )
        .await
        .context("failed to select old inactive rows")?;
    rows.into_iter().map(instance_from_row).collect()
}

pub async fn all(pool: &Pool) -> Result<Vec<Instance>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let rows = client
        .query(
            "SELECT id, status, created_at, updated_at FROM instance",
            &[],
        )
        .await
        .context("failed to select instance rows")?;
    rows.into_iter().map(instance_from_row).collect()
}

/// True when the error chain bottoms out in a Postgres unique violation;
/// how a concurrent START loses the insert race.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<tokio_postgres::Error>()
        .and_then(tokio_postgres::Error::code)
        == Some(&SqlState::UNIQUE_VIOLATION)
}

fn instance_from_row(row: Row) -> Result<Instance> {
    let status: String = row.get("status");
    let instance = Instance::new(
        row.get("id"),
        status.parse::<InstanceStatus>()?,
        row.get("created_at"),
        row.get("updated_at"),
    )?;
    Ok(instance)
}
