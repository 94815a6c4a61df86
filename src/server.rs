use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::api::handler::{
    get_record, health_check, retry_all, retry_record, run_sweep, worker_control,
    worker_health, AppState,
};

pub async fn create_app(state: AppState) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let app = Router::new()
        // Public health check endpoint
        .route("/health", get(health_check))
        // API v1 routes
        .nest(
            "/api/v1",
            Router::new()
                // Reconciliation endpoints
                .route("/reconcile/sweep", post(run_sweep))
                .route("/reconcile/retry/:id", post(retry_record))
                .route("/reconcile/retry-all", post(retry_all))
                .route("/reconcile/records/:id", get(get_record))
                // Worker supervision endpoints
                .route("/worker/health", get(worker_health))
                .route("/worker/control", post(worker_control)),
        )
        .layer(CompressionLayer::new())
        // Allow all origins in dev, restrict in prod
        .layer(CorsLayer::very_permissive())
        // Add request tracing
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}
