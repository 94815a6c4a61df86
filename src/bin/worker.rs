use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use akiba_backend::{bootstrap, config::Config};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,akiba_backend=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("🚀 Starting Akiba reconcile worker");

    // Load configuration
    dotenv::dotenv().ok();
    let config = Config::from_env()?;

    let worker = bootstrap::initialize_worker(&config).await?;

    // Drain loop runs until the process supervisor stops us
    worker.start().await?;

    Ok(())
}
