// Liveness probing of expert services

use super::RegistryError;
use crate::orchestration::types::{Expert, ExpertStatus};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Determines the current status of one expert
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `Err` means no verdict could be reached; the caller keeps the previous status.
    async fn probe(&self, expert: &Expert) -> Result<ExpertStatus, RegistryError>;
}

/// Probes `GET {endpoint}/health`
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct HealthBody {
    #[serde(default)]
    status: Option<String>,
}

impl HttpHealthProbe {
    pub fn new(timeout: Duration) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RegistryError::Unavailable(format!("failed to build probe client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, expert: &Expert) -> Result<ExpertStatus, RegistryError> {
        let url = format!("{}/health", expert.endpoint.trim_end_matches('/'));

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(expert = %expert.id, "Health probe unreachable: {}", e);
                return Ok(ExpertStatus::Offline);
            }
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
            return Ok(ExpertStatus::Busy);
        }
        if !status.is_success() {
            debug!(expert = %expert.id, %status, "Health probe returned failure status");
            return Ok(ExpertStatus::Offline);
        }

        // A body is optional; experts may report themselves busy while healthy.
        let reported = response
            .json::<HealthBody>()
            .await
            .ok()
            .and_then(|body| body.status)
            .map(|s| s.to_lowercase());

        Ok(match reported.as_deref() {
            Some("busy") => ExpertStatus::Busy,
            _ => ExpertStatus::Online,
        })
    }
}
