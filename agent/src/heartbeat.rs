//! Heartbeat reporter
//!
//! Posts a status + metrics snapshot to the controller. A failed beat is
//! logged and dropped; the next scheduled tick is the retry.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::host::{HostInfo, PlatformInfo};
use crate::metrics::{collect_metrics, MetricsProbe, MetricsSnapshot};
use crate::version::{VersionState, AGENT_VERSION};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct PingPayload<'a> {
    status: &'static str,
    version: String,
    hostname: &'a str,
    platform: &'a PlatformInfo,
    ip_address: &'a str,
    metrics: MetricsSnapshot,
    timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct RegistrationPayload<'a> {
    status: &'static str,
    version: String,
    #[serde(flatten)]
    host: &'a HostInfo,
}

pub struct HeartbeatReporter {
    client: reqwest::Client,
    config: Arc<AgentConfig>,
    probe: Arc<dyn MetricsProbe>,
    host: HostInfo,
    version: Arc<VersionState>,
}

impl HeartbeatReporter {
    pub fn new(
        config: Arc<AgentConfig>,
        probe: Arc<dyn MetricsProbe>,
        host: HostInfo,
        version: Arc<VersionState>,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .user_agent(format!("ninode-agent/{AGENT_VERSION}"))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            config,
            probe,
            host,
            version,
        }
    }

    /// Send one heartbeat; never fails past this call
    pub async fn report_once(&self) -> bool {
        let payload = PingPayload {
            status: "online",
            version: self.version.current().await,
            hostname: &self.host.hostname,
            platform: &self.host.platform,
            ip_address: &self.host.ip_address,
            metrics: collect_metrics(&self.probe).await,
            timestamp: Utc::now(),
        };

        let ok = self.post(&self.config.ping_url(), &payload).await;
        if ok {
            debug!("Heartbeat delivered");
        }
        ok
    }

    /// Announce this host to the controller once at startup
    pub async fn register(&self) -> bool {
        let payload = RegistrationPayload {
            status: "online",
            version: self.version.current().await,
            host: &self.host,
        };

        let ok = self.post(&self.config.register_url(), &payload).await;
        if ok {
            info!("Registered with controller at {}", self.config.server_url);
        } else {
            warn!("Registration with controller failed, continuing without it");
        }
        ok
    }

    async fn post<T: Serialize>(&self, url: &str, payload: &T) -> bool {
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(payload)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => true,
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                warn!("POST {url} returned {status}: {}", body.trim());
                false
            }
            Err(e) if e.is_timeout() => {
                warn!("POST {url} timed out");
                false
            }
            Err(e) => {
                warn!("POST {url} failed: {e}");
                false
            }
        }
    }
}
