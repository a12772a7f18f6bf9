use clap::{Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the control plane: bus consumers plus both reconcilers
    Run(RunArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Directory holding the per-environment INI files
    #[arg(long, env = "CONFIGS_DIR", default_value = "./configs")]
    pub configs_dir: String,

    /// Connections kept by the shared Postgres pool
    #[arg(long, env = "POSTGRES_POOL_SIZE", default_value_t = 16)]
    pub postgres_pool_size: usize,

    #[command(flatten)]
    pub engine: EngineArgs,

    #[command(flatten)]
    pub reconcile: ReconcileArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct EngineArgs {
    /// Concurrent container-engine operations
    #[arg(long, env = "ENGINE_WORKERS", default_value_t = 5)]
    pub engine_workers: usize,

    /// Seconds to wait for a worker to report a started stream
    #[arg(long, env = "ENGINE_START_TIMEOUT_SECS", default_value_t = 60)]
    pub start_timeout_secs: u64,

    /// Grace period in seconds before a stop escalates to a kill
    #[arg(long, env = "ENGINE_STOP_TIMEOUT_SECS", default_value_t = 15)]
    pub stop_timeout_secs: u64,
}

#[derive(Parser, Debug, Clone)]
pub struct ReconcileArgs {
    /// Seconds between reaper passes
    #[arg(long, env = "REAPER_PERIOD_SECS", default_value_t = 60)]
    pub reaper_period_secs: u64,

    /// Minutes a non-active row must be untouched before it is reaped
    #[arg(long, env = "REAPER_MIN_AGE_MINUTES", default_value_t = 5)]
    pub reaper_min_age_minutes: i64,

    /// Seconds between consistency scanner passes
    #[arg(long, env = "SCANNER_PERIOD_SECS", default_value_t = 3)]
    pub scanner_period_secs: u64,
}
