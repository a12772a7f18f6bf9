use anyhow::{Context, Result};
use deadpool_postgres::{Config as PgConfig, ManagerConfig, Pool, PoolConfig, RecyclingMethod};
use tokio_postgres::NoTls;

use crate::config::DatabaseConfig;

pub fn create_pool(cfg: &DatabaseConfig, max_size: usize) -> Result<Pool> {
    let mut pg_pool_cfg = PgConfig::new();
    pg_pool_cfg.host = Some(cfg.host.clone());
    pg_pool_cfg.port = Some(cfg.port);
    pg_pool_cfg.dbname = Some(cfg.name.clone());
    pg_pool_cfg.user = Some(cfg.user.clone());
    pg_pool_cfg.password = Some(cfg.password.clone());
    pg_pool_cfg.pool = Some(PoolConfig::new(max_size));
    pg_pool_cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    pg_pool_cfg
        .create_pool(Some(deadpool_postgres::Runtime::Tokio1), NoTls)
        .context("failed to create Postgres pool")
}
