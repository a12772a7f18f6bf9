use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

mod args;
mod bus;
mod dispatch;
mod engine;
mod messages;
mod model;
mod reconcile;
mod service;
mod store;

use args::{Cli, Commands, RunArgs};
use bus::Bus;
use dispatch::{Dispatcher, QueueKind};
use engine::{ContainerEngine, DockerEngine};
use fovea_common::config::{AppConfig, Environment};
use reconcile::Reconciler;
use service::InstanceService;

#[tokio::main]
async fn main() -> Result<()> {
    fovea_common::init();

    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let env = Environment::from_env()?;
    let cfg = AppConfig::load(Path::new(&args.configs_dir), env)?;
    tracing::info!(environment = %env, "configuration loaded");

    let pool = fovea_common::postgres::create_pool(&cfg.database, args.postgres_pool_size)?;
    store::init_schema(&pool).await?;

    let engine: Arc<dyn ContainerEngine> = Arc::new(DockerEngine::new(
        &cfg.hardware,
        args.engine.engine_workers,
        Duration::from_secs(args.engine.start_timeout_secs),
        Duration::from_secs(args.engine.stop_timeout_secs),
    )?);
    engine
        .ping()
        .await
        .context("container engine is unreachable")?;
    tracing::info!("connected to container engine");

    let bus = Arc::new(Bus::connect(&cfg.rabbitmq).await?);

    let service = Arc::new(InstanceService::new(pool.clone(), engine.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        service,
        bus.clone(),
        cfg.rabbitmq.ack_status_queue.clone(),
    ));
    let reconciler = Reconciler::new(
        pool,
        engine,
        bus.clone(),
        cfg.rabbitmq.scheduler_notification_queue.clone(),
        Duration::from_secs(args.reconcile.reaper_period_secs),
        Duration::from_secs(args.reconcile.scanner_period_secs),
        chrono::Duration::minutes(args.reconcile.reaper_min_age_minutes),
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            fovea_common::shutdown::shutdown_signal().await;
            cancel.cancel();
        }
    });

    let unique = bus.consume_unique(&cfg.rabbitmq.controller_queue).await?;
    let shared = bus.consume_shared(&cfg.rabbitmq.controller_queue).await?;

    tokio::join!(
        dispatcher.clone().run(unique, QueueKind::Unique, cancel.clone()),
        dispatcher.clone().run(shared, QueueKind::Shared, cancel.clone()),
        reconciler.run_reaper(cancel.clone()),
        reconciler.run_scanner(cancel.clone()),
    );

    tracing::info!("control plane shut down");
    Ok(())
}
