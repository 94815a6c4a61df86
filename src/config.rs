use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// Base URL of the opaque settlement service.
    pub settlement_api_url: String,
    pub settlement_api_key: Option<String>,
    /// Base URL of the process supervisor managing the worker.
    pub supervisor_url: String,
    pub worker_process_name: String,
    /// Shared secret for the sweep trigger; unauthenticated when unset.
    pub reconcile_secret: Option<String>,
    pub stale_claim_minutes: i64,
    pub default_sweep_limit: i64,
    pub max_attempts: i32,
    pub worker_poll_seconds: u64,
    pub worker_batch_size: i64,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/akiba".to_string()),
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            settlement_api_url: std::env::var("SETTLEMENT_API_URL")
                .unwrap_or_else(|_| "http://localhost:9090".to_string()),
            settlement_api_key: std::env::var("SETTLEMENT_API_KEY").ok(),
            supervisor_url: std::env::var("SUPERVISOR_URL")
                .unwrap_or_else(|_| "http://localhost:9615".to_string()),
            worker_process_name: std::env::var("WORKER_PROCESS_NAME")
                .unwrap_or_else(|_| "akiba-worker".to_string()),
            reconcile_secret: std::env::var("RECONCILE_SECRET").ok(),
            stale_claim_minutes: env_parsed("STALE_CLAIM_MINUTES", 20),
            default_sweep_limit: env_parsed("DEFAULT_SWEEP_LIMIT", 20),
            max_attempts: env_parsed("MAX_SETTLEMENT_ATTEMPTS", 3),
            worker_poll_seconds: env_parsed("WORKER_POLL_SECONDS", 15),
            worker_batch_size: env_parsed("WORKER_BATCH_SIZE", 10),
        })
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
