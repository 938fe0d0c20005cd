use std::{process, sync::Arc};

use sluice::{
    application::error::AppError,
    application::repos::DurableStore,
    cache::{CacheConfig, CacheEngine, CacheStore, MemoryStore},
    config,
    infra::{db::PostgresRepositories, error::InfraError, telemetry},
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
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

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli().map_err(|err| {
        AppError::from(InfraError::configuration(format!(
            "failed to load configuration: {err}"
        )))
    })?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::RefreshCeilings(_) => run_refresh_ceilings(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let engine = build_engine(&settings).await?;
    engine.start();
    info!(
        target = "sluice::serve",
        sync_interval_seconds = settings.cache.sync_interval_seconds,
        distrust_probability = settings.cache.distrust_probability,
        "Cache engine running"
    );

    let refresh = engine.refresh_ceilings().await;
    if !refresh.is_complete() {
        warn!(target = "sluice::serve", report = %refresh, "Initial ceiling refresh incomplete");
    }

    tokio::signal::ctrl_c().await.map_err(InfraError::from)?;
    info!(target = "sluice::serve", "Shutdown requested");

    let report = engine.stop().await;
    info!(target = "sluice::serve", report = %report, "Shutdown complete");
    Ok(())
}

async fn run_refresh_ceilings(settings: config::Settings) -> Result<(), AppError> {
    let engine = build_engine(&settings).await?;
    let report = engine.refresh_ceilings().await;

    info!(target = "sluice::refresh_ceilings", report = %report, "Ceiling refresh finished");
    if report.is_complete() {
        Ok(())
    } else {
        Err(AppError::unexpected(format!(
            "ceiling refresh incomplete: {report}"
        )))
    }
}

async fn build_engine(settings: &config::Settings) -> Result<CacheEngine, AppError> {
    let durable = init_repositories(settings).await?;
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
    Ok(CacheEngine::new(
        CacheConfig::from(&settings.cache),
        store,
        durable,
    ))
}

async fn init_repositories(
    settings: &config::Settings,
) -> Result<Arc<dyn DurableStore>, AppError> {
    let url = settings.database.url.as_deref().ok_or_else(|| {
        InfraError::configuration("database url is required (set --database-url or SLUICE__DATABASE__URL)")
    })?;

    let pool = PostgresRepositories::connect(url, settings.database.max_connections.get())
        .await
        .map_err(InfraError::from)?;
    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(InfraError::from)?;

    let repositories = PostgresRepositories::new(pool);
    repositories
        .health_check()
        .await
        .map_err(InfraError::from)?;

    Ok(Arc::new(repositories))
}
