//! Shared fixtures for unit tests: local HTTP servers, configs, probes

use axum::Router;
use chrono::Utc;

use crate::config::AgentConfig;
use crate::metrics::{
    CpuMetrics, DiskMetrics, LoadAverage, MemoryMetrics, MetricsProbe, MetricsSnapshot,
};

/// Serve `router` on an ephemeral loopback port and return its base URL
pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

pub fn test_config(server_url: &str) -> AgentConfig {
    serde_json::from_value(serde_json::json!({
        "api_key": "test-token",
        "server_url": server_url,
        "host": "127.0.0.1",
        "port": 0,
    }))
    .unwrap()
}

pub struct FixedProbe;

impl MetricsProbe for FixedProbe {
    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cpu: CpuMetrics {
                cores: 2,
                load_percent: 25.0,
            },
            memory: MemoryMetrics {
                total_mb: 2048,
                used_mb: 1024,
                available_mb: 1024,
                percent: 50.0,
            },
            disk: DiskMetrics {
                path: "/".into(),
                total_gb: 40.0,
                used_gb: 10.0,
                available_gb: 30.0,
                percent: 25.0,
            },
            load_average: LoadAverage {
                one: 0.5,
                five: 0.4,
                fifteen: 0.3,
            },
            uptime_seconds: 3600,
            collected_at: Utc::now(),
        }
    }
}
