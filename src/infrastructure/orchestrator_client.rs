//! Orchestrator HTTP Client
//!
//! Thin client for the external terminal orchestrator, which materializes
//! and destroys MT5 terminal containers. When no orchestrator URL is
//! configured (local/dev environments), provisioning is simulated as an
//! immediate success so the rest of the farm stays exercisable without a
//! real container fleet.
//!
//! Calls are bounded by the HTTP client's timeout; a timed-out call is a
//! failed call, not an in-flight one.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("orchestrator request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("orchestrator returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Credentials supplied by the user when enabling auto-sync. Held in memory
/// for the provisioning call only; the password is never persisted.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalCredentials {
    pub server: String,
    pub login: String,
    pub password: String,
}

#[derive(Serialize)]
struct ProvisionRequest<'a> {
    #[serde(rename = "terminalId")]
    terminal_id: &'a str,
    #[serde(rename = "accountId")]
    account_id: &'a str,
    server: &'a str,
    login: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct ProvisionResponse {
    #[serde(rename = "containerId", alias = "container_id")]
    container_id: Option<String>,
}

pub struct OrchestratorClient {
    http: reqwest::Client,
    base_url: Option<String>,
}

impl OrchestratorClient {
    pub fn new(base_url: Option<String>, timeout: Duration) -> Result<Self, OrchestratorError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base_url })
    }

    pub fn is_simulated(&self) -> bool {
        self.base_url.is_none()
    }

    /// Materialize a terminal process; returns the container handle.
    pub async fn provision(
        &self,
        terminal_id: &str,
        account_id: &str,
        credentials: &TerminalCredentials,
    ) -> Result<String, OrchestratorError> {
        let Some(base_url) = &self.base_url else {
            let container_id = format!("sim-{}", Uuid::new_v4().simple());
            debug!(
                "No orchestrator configured; simulating provisioning of terminal {} as {}",
                terminal_id, container_id
            );
            return Ok(container_id);
        };

        let response = self
            .http
            .post(format!("{}/terminals", base_url))
            .json(&ProvisionRequest {
                terminal_id,
                account_id,
                server: &credentials.server,
                login: &credentials.login,
                password: &credentials.password,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::Rejected { status, body });
        }

        let parsed: ProvisionResponse = response.json().await?;
        let container_id = parsed
            .container_id
            .unwrap_or_else(|| format!("container-{}", terminal_id));

        info!(
            "Terminal {} provisioned via orchestrator as {}",
            terminal_id, container_id
        );
        Ok(container_id)
    }

    /// Tear a terminal container down.
    pub async fn teardown(&self, container_id: &str) -> Result<(), OrchestratorError> {
        let Some(base_url) = &self.base_url else {
            debug!(
                "No orchestrator configured; simulating teardown of {}",
                container_id
            );
            return Ok(());
        };

        let response = self
            .http
            .delete(format!("{}/terminals/{}", base_url, container_id))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::Rejected { status, body });
        }

        info!("Container {} torn down via orchestrator", container_id);
        Ok(())
    }
}
