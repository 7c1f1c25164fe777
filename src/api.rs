//! Home Assistant REST API client
//!
//! Service calls for executed actions, plus the state and config reads the
//! entity inventory needs.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::config::RuntimeContext;
use crate::scheduler::ControlPlane;

/// Home Assistant REST API client
pub struct HassClient {
    client: Client,
    base_url: String,
    token: String,
}

impl HassClient {
    pub fn new(server: &str, token: &str, timeout: Duration, insecure: bool) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(timeout)
            .user_agent(format!("pplx-assist/{}", env!("CARGO_PKG_VERSION")));

        if insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder.build().context("building HTTP client")?;

        Ok(Self {
            client,
            base_url: server.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    /// Create a client from runtime context
    pub fn from_context(ctx: &RuntimeContext) -> Result<Self> {
        Self::new(
            ctx.server_url()?,
            ctx.token()?,
            Duration::from_secs(ctx.timeout()),
            ctx.insecure(),
        )
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}/api{}", self.base_url, path);
        log::debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("request to {url}"))?;

        self.handle_response(response).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T> {
        let url = format!("{}/api{}", self.base_url, path);
        log::debug!("POST {} {}", url, body);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("request to {url}"))?;

        self.handle_response(response).await
    }

    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        let url = response.url().to_string();

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(status_to_error(status, &url, &error_text));
        }

        response
            .json()
            .await
            .with_context(|| format!("parsing response from {url}"))
    }

    /// Core configuration, including the home location
    pub async fn get_config(&self) -> Result<HassConfig> {
        self.get("/config").await
    }

    pub async fn get_states(&self) -> Result<Vec<EntityState>> {
        self.get("/states").await
    }
}

#[async_trait]
impl ControlPlane for HassClient {
    async fn call_service(&self, domain: &str, service: &str, data: &Value) -> Result<()> {
        let _changed: Value = self
            .post(&format!("/services/{domain}/{service}"), data)
            .await?;
        Ok(())
    }
}

fn status_to_error(status: StatusCode, url: &str, body: &str) -> anyhow::Error {
    let hint = match status {
        StatusCode::UNAUTHORIZED => "Check your authentication token (HASS_TOKEN or --token)",
        StatusCode::FORBIDDEN => "Your token may not have sufficient permissions",
        StatusCode::NOT_FOUND => "Unknown service or entity",
        StatusCode::SERVICE_UNAVAILABLE => "Home Assistant may be starting up or restarting",
        StatusCode::BAD_REQUEST => "Invalid service data",
        _ => "",
    };

    let msg = if body.is_empty() {
        format!("HTTP {status} from {url}")
    } else {
        format!("HTTP {status} from {url}: {body}")
    };

    if hint.is_empty() {
        anyhow!(msg)
    } else {
        anyhow!("{msg}\nHint: {hint}")
    }
}

// --- API Types ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HassConfig {
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub country: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Value,
}

impl EntityState {
    pub fn domain(&self) -> &str {
        self.entity_id.split('.').next().unwrap_or_default()
    }

    /// Friendly name, else the object id with underscores as spaces
    pub fn name(&self) -> String {
        if let Some(name) = self.attributes.get("friendly_name").and_then(Value::as_str) {
            return name.to_string();
        }
        self.entity_id
            .split_once('.')
            .map(|(_, object_id)| object_id.replace('_', " "))
            .unwrap_or_else(|| self.entity_id.clone())
    }
}
