//! Collector entry point: pipeline service + alarm recovery
//!
//! Protocol drivers feed `DeviceDataMessage`s into the data processing
//! service; this binary wires the stages, runs startup recovery, and keeps
//! the worker pool alive until SIGINT.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pulseone::alarm::{AlarmEvaluator, AlarmRuleRegistry, AlarmStartupRecovery, AlarmStateCache};
use pulseone::config::{self, AppConfig};
use pulseone::pipeline::{
    AlarmStage, DataProcessingService, EnrichmentStage, PersistenceStage, PipelineStage,
};
use pulseone::scripting::{ScriptExecutor, ScriptLibrary};
use pulseone::storage::{
    MemoryAlarmRuleRepository, MemoryOccurrenceRepository, MemoryVirtualPointRepository,
    NullPersistenceSink, PersistenceQueue, RedisConnection, RedisDataWriter, RedisSink,
};
use pulseone::virtual_point::VirtualPointEngine;

#[derive(Parser, Debug)]
#[command(name = "pulseone-collector", about = "PulseOne data acquisition pipeline")]
struct Cli {
    /// Path to pulseone.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Tenant whose rules and virtual points are loaded at boot
    #[arg(long, default_value_t = 1)]
    tenant: i32,

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

    let redis = connect_redis(&cfg.redis.url).await?;
    let writer = Arc::new(RedisDataWriter::new(Arc::clone(&redis)));

    // Repository wiring: deployment-specific implementations are injected
    // here; the defaults run standalone.
    let rule_repo = Arc::new(MemoryAlarmRuleRepository::default());
    let occurrence_repo = Arc::new(MemoryOccurrenceRepository::new());
    let vp_repo = Arc::new(MemoryVirtualPointRepository::default());

    let library = Arc::new(ScriptLibrary::new());
    let executor = Arc::new(ScriptExecutor::new(library));
    let state_cache = Arc::new(AlarmStateCache::new());

    let vp_engine = Arc::new(VirtualPointEngine::new(
        vp_repo,
        Arc::clone(&executor),
        Arc::clone(&state_cache),
    ));
    vp_engine.load_points(cli.tenant).await;

    let registry = Arc::new(AlarmRuleRegistry::new(rule_repo));
    registry.load_rules(cli.tenant).await;
    let evaluator = Arc::new(AlarmEvaluator::new(
        Arc::clone(&executor),
        Arc::clone(&state_cache),
    ));

    let persistence_queue = Arc::new(PersistenceQueue::new(
        cfg.pipeline.persistence_queue_capacity,
    ));
    let cancel = CancellationToken::new();
    persistence_queue.start(Arc::new(NullPersistenceSink), cancel.clone());

    // Cold-start recovery before the pipeline begins accepting data.
    let recovery = AlarmStartupRecovery::new(
        Arc::clone(&occurrence_repo)
            as Arc<dyn pulseone::storage::AlarmOccurrenceRepository>,
        Arc::clone(&writer),
        Arc::clone(&state_cache),
        cfg.recovery.clone(),
    );
    let recovered = recovery.recover_active_alarms().await;
    if recovered > 0 {
        info!(recovered, "Active alarms republished");
    }

    let stages: Vec<Box<dyn PipelineStage>> = vec![
        Box::new(EnrichmentStage::new(Arc::clone(&vp_engine))),
        Box::new(AlarmStage::new(
            Arc::clone(&registry),
            Arc::clone(&evaluator),
            Arc::clone(&state_cache),
            occurrence_repo,
        )),
        Box::new(PersistenceStage::new(
            Arc::clone(&writer),
            Arc::clone(&persistence_queue),
        )),
    ];
    let service = Arc::new(DataProcessingService::new(stages, &cfg.pipeline));
    service.start();

    info!("Collector running — Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("Shutdown signal received");
    service.stop().await;
    cancel.cancel();
    persistence_queue.stop().await;

    let stats = service.stats();
    info!(%stats, "Final pipeline statistics");
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
