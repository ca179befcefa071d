//! Export gateway entry point
//!
//! Subscribes to processed alarms and fans them out to the configured
//! export targets with per-target circuit breaking.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use pulseone::config::{self, AppConfig};
use pulseone::gateway::{
    GatewayContext, GatewayService, SubscriberConfig, TargetHandlerFactory, TargetRegistry,
    TargetRunner,
};
use pulseone::storage::{
    MemoryEdgeServerRepository, MemoryTargetRepository, RedisConnection, RedisSink,
};

#[derive(Parser, Debug)]
#[command(name = "pulseone-gateway", about = "PulseOne export gateway")]
struct Cli {
    /// Path to pulseone.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Gateway id (edge_servers.id); overrides the config file
    #[arg(long)]
    gateway_id: Option<i64>,

    /// Emit JSON logs instead of the human format
    #[arg(long, default_value_t = false)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    config::init(AppConfig::load(cli.config.as_deref()));
    let cfg = config::get();
    let gateway_id = cli.gateway_id.unwrap_or(cfg.gateway.gateway_id);

    let redis = connect_redis(&cfg.redis.url).await?;

    // Repository wiring: deployment-specific implementations are injected
    // here; the defaults run standalone.
    let target_repo = Arc::new(MemoryTargetRepository::default());
    let edge_repo = Arc::new(MemoryEdgeServerRepository::new(Vec::new()));

    let registry = Arc::new(TargetRegistry::new(
        target_repo,
        TargetHandlerFactory::with_builtin_handlers(),
    ));
    let runner = Arc::new(TargetRunner::new(Arc::clone(&registry)));
    let context = Arc::new(GatewayContext::new(
        gateway_id,
        registry,
        runner,
        redis,
        edge_repo,
    ));

    let service = GatewayService::new(
        context,
        SubscriberConfig {
            redis_url: cfg.redis.url.clone(),
            worker_count: cfg.gateway.subscriber_workers,
            queue_capacity: cfg.gateway.subscriber_queue_capacity,
        },
        cfg.gateway.heartbeat_interval_secs,
    );

    if let Err(e) = service.start().await {
        error!(error = %e, "Gateway failed to start");
        std::process::exit(1);
    }

    info!(gateway_id, "Gateway running — Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("Shutdown signal received");
    service.stop().await;
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn connect_redis(url: &str) -> Result<Arc<dyn RedisSink>> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match RedisConnection::connect(url).await {
            Ok(connection) => return Ok(Arc::new(connection)),
            Err(e) if attempt < 5 => {
                warn!(attempt, error = %e, "Redis not reachable — retrying");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            Err(e) => {
                error!(error = %e, "Redis unreachable after retries");
                return Err(e).context("redis connection");
            }
        }
    }
}
