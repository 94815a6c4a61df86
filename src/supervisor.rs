use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AppError, AppResult};

/// Worker process health as reported by the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub status: String,
    pub uptime_seconds: u64,
    pub restarts: u32,
    pub memory_bytes: u64,
    pub cpu_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerAction {
    Start,
    Stop,
    Restart,
}

impl WorkerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerAction::Start => "start",
            WorkerAction::Stop => "stop",
            WorkerAction::Restart => "restart",
        }
    }
}

impl fmt::Display for WorkerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Process supervision seam. The engine never manages the worker process
/// itself; it proxies to whatever supervisor the deployment runs.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    async fn health(&self) -> AppResult<WorkerHealth>;
    async fn control(&self, action: WorkerAction) -> AppResult<()>;
}

/// HTTP client against the external process supervisor daemon.
pub struct HttpProcessSupervisor {
    client: reqwest::Client,
    base_url: String,
    process_name: String,
}

impl HttpProcessSupervisor {
    pub fn new(base_url: String, process_name: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            process_name,
        }
    }
}

#[async_trait]
impl ProcessSupervisor for HttpProcessSupervisor {
    async fn health(&self) -> AppResult<WorkerHealth> {
        let response = self
            .client
            .get(format!(
                "{}/processes/{}",
                self.base_url, self.process_name
            ))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::ExternalError(format!(
                "supervisor returned {} for {}",
                response.status(),
                self.process_name
            )));
        }

        let health = response.json::<WorkerHealth>().await.map_err(|e| {
            AppError::ExternalError(format!("malformed supervisor response: {}", e))
        })?;
        Ok(health)
    }

    async fn control(&self, action: WorkerAction) -> AppResult<()> {
        let response = self
            .client
            .post(format!(
                "{}/processes/{}/{}",
                self.base_url, self.process_name, action
            ))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::ExternalError(format!(
                "supervisor rejected {} for {}: {}",
                action,
                self.process_name,
                response.status()
            )));
        }
        Ok(())
    }
}
