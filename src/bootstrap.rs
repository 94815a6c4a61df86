use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{sync::Arc, time::Duration};
use tracing::info;

use crate::{
    api::handler::AppState,
    config::Config,
    error::AppResult,
    middleware::rate_limit::SweepThrottle,
    reconcile::{
        invoker::{HttpSettlementApi, SettlementApi, SettlementInvoker},
        store::{PgRecordStore, RecordStore},
        sweep::{ReconcileSweep, SweepConfig},
        worker::{ReconcileWorker, WorkerConfig},
    },
    supervisor::{HttpProcessSupervisor, ProcessSupervisor},
};

pub async fn initialize_app_state(config: &Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    let pool = initialize_database(&config.database_url).await?;

    let store: Arc<dyn RecordStore> =
        Arc::new(PgRecordStore::new(pool, config.max_attempts));
    info!("✅ Record store initialized");

    let api: Arc<dyn SettlementApi> = Arc::new(HttpSettlementApi::new(
        config.settlement_api_url.clone(),
        config.settlement_api_key.clone(),
    ));
    let invoker = Arc::new(SettlementInvoker::new(store.clone(), api));
    info!(
        "✅ Settlement invoker initialized ({})",
        config.settlement_api_url
    );

    let sweep = Arc::new(ReconcileSweep::new(
        store.clone(),
        invoker,
        SweepConfig {
            stale_minutes: config.stale_claim_minutes,
            default_limit: config.default_sweep_limit,
        },
    ));
    info!(
        "✅ Reconcile sweep initialized (staleness {}m, batch {})",
        config.stale_claim_minutes, config.default_sweep_limit
    );

    let supervisor: Arc<dyn ProcessSupervisor> = Arc::new(HttpProcessSupervisor::new(
        config.supervisor_url.clone(),
        config.worker_process_name.clone(),
    ));
    info!(
        "✅ Worker supervisor proxy initialized ({})",
        config.supervisor_url
    );

    // Sweep triggers come from an external scheduler; a small burst bucket
    // absorbs overlapping cron fires and manual re-runs
    let throttle = Arc::new(SweepThrottle::new(6, 60));

    Ok(AppState {
        store,
        sweep,
        supervisor,
        throttle,
        reconcile_secret: config.reconcile_secret.clone(),
    })
}

/// Build the worker process components. Runs in its own binary under the
/// external supervisor.
pub async fn initialize_worker(config: &Config) -> AppResult<Arc<ReconcileWorker>> {
    let pool = initialize_database(&config.database_url).await?;

    let store: Arc<dyn RecordStore> =
        Arc::new(PgRecordStore::new(pool, config.max_attempts));
    let api: Arc<dyn SettlementApi> = Arc::new(HttpSettlementApi::new(
        config.settlement_api_url.clone(),
        config.settlement_api_key.clone(),
    ));
    let invoker = Arc::new(SettlementInvoker::new(store.clone(), api));

    Ok(Arc::new(ReconcileWorker::new(
        store,
        invoker,
        WorkerConfig {
            poll_interval: Duration::from_secs(config.worker_poll_seconds),
            batch_size: config.worker_batch_size,
        },
    )))
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .connect(database_url)
        .await?;

    // Run migrations
    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
