use super::Action;
use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Instant;

/// Action tag for the health check of `system`.
pub fn tag(system: &str) -> String {
    format!("health_check:{system}")
}

/// HTTP health check against an external system, success on any 2xx.
///
/// The request itself has no timeout; the executor bounds the whole action.
pub struct HttpHealthCheck {
    system: String,
    url: String,
    client: Client,
}

impl HttpHealthCheck {
    pub fn new(system: &str, url: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("opsched/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            system: system.to_string(),
            url: url.to_string(),
            client,
        })
    }
}

#[async_trait::async_trait]
impl Action for HttpHealthCheck {
    async fn run(&self, args: &Value) -> Result<Value> {
        // Optional per-job override: {"url": "..."}
        let url = args
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or(&self.url);

        let start = Instant::now();
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("{} unreachable at {}", self.system, url))?;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        let status = resp.status();

        if !status.is_success() {
            anyhow::bail!("{} health check returned HTTP {}", self.system, status.as_u16());
        }

        Ok(json!({
            "system": self.system,
            "url": url,
            "status": status.as_u16(),
            "latency_ms": latency_ms,
        }))
    }
}
