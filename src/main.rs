#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use insightbridge_gateway::server;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "insightbridge-gateway",
    about = "API gateway with health-checked load balancing and per-instance circuit breakers"
)]
struct Cli {
    /// Path to gateway config file (.toml or .json)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Listen address, overrides `listen` from the config file
    #[arg(short, long)]
    listen: Option<String>,

    /// Admin API listen address (health/readiness/metrics/services)
    #[arg(long)]
    admin_listen: Option<String>,

    /// Tokio worker threads (default: container CPU limit)
    #[arg(short, long)]
    workers: Option<usize>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let workers = server::runtime::resolve_worker_threads(cli.workers);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers.count)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        listen: cli.listen,
        admin_listen: cli.admin_listen,
        workers,
    }))
}
