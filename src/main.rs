use std::{process, sync::Arc};

use anno_cache::{
    cache::{BackgroundWorker, CacheConfig, CacheManager, CacheStore, WorkerConfig},
    config,
    infra::{error::InfraError, telemetry},
};
use anno_cache_api_types::HealthState;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Run(Box::<config::RunArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Run(_) => run_daemon(settings).await,
        config::Command::Check(_) => run_check(settings).await,
    }
}

fn build_manager(settings: &config::Settings) -> CacheManager {
    let store = Arc::new(CacheStore::new(CacheConfig::from(&settings.cache)));
    CacheManager::with_warm_policy(
        store,
        settings.worker.warm_batch_size.get(),
        settings.worker.warm_pause,
    )
}

async fn run_daemon(settings: config::Settings) -> Result<(), InfraError> {
    let manager = build_manager(&settings);
    info!(
        mode = manager.store().config().mode.name(),
        host = %manager.store().config().host,
        port = manager.store().config().port,
        "starting cache daemon"
    );

    let worker = BackgroundWorker::new(manager, WorkerConfig::from(&settings.worker));
    worker.start().await?;

    let signal = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
    worker.shutdown().await;

    signal.map_err(InfraError::from)
}

async fn run_check(settings: config::Settings) -> Result<(), InfraError> {
    let manager = build_manager(&settings);
    manager.store().connect().await?;

    let health = manager.health_check().await;
    manager.store().disconnect().await;

    match health.status {
        HealthState::Healthy => {
            info!(latency_ms = health.latency_ms, "cache store healthy");
            Ok(())
        }
        HealthState::Unhealthy => {
            let reason = health
                .reason
                .unwrap_or_else(|| "health probe failed".to_string());
            warn!(reason = %reason, "cache store unhealthy");
            Err(InfraError::unhealthy(reason))
        }
    }
}
