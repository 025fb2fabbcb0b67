//! ninode-agent: host agent for the Ninode controller
//!
//! Serves an authenticated HTTP API (status, metrics, allowlisted commands,
//! manual update), reports heartbeats, and keeps itself up to date.

mod api;
mod config;
mod error;
mod gateway;
mod heartbeat;
mod host;
mod metrics;
mod restart;
mod scheduler;
mod update;
mod version;

#[cfg(test)]
mod test_support;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::AgentConfig;
use crate::gateway::CommandGateway;
use crate::heartbeat::HeartbeatReporter;
use crate::host::HostInfo;
use crate::metrics::{MetricsProbe, SystemProbe};
use crate::restart::{RestartHandle, RESTART_EXIT_CODE};
use crate::scheduler::Scheduler;
use crate::update::{UpdateOrchestrator, UpdatePhase};
use crate::version::VersionState;

fn init_tracing(config: &AgentConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_level(true)
            .compact()
            .init();
    }
}

/// Resolves on SIGINT, SIGTERM or when `shutdown` is cancelled
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(config::load_config().context("Failed to load configuration")?);
    init_tracing(&config);

    info!("ninode-agent {} starting", version::AGENT_VERSION);
    info!("Controller: {}", config.server_url);

    let shutdown = CancellationToken::new();
    let restart = RestartHandle::new(shutdown.clone());
    let version = Arc::new(VersionState::default());
    let probe: Arc<dyn MetricsProbe> = Arc::new(SystemProbe::default());
    let host = HostInfo::collect().await;
    info!(
        "Host {} ({} {}) at {}",
        host.hostname, host.platform.system, host.platform.machine, host.ip_address
    );

    let orchestrator = Arc::new(
        UpdateOrchestrator::new(&config.update, version.clone(), restart.clone())
            .context("Failed to resolve update artifact paths")?,
    );
    let heartbeat = Arc::new(HeartbeatReporter::new(
        config.clone(),
        probe.clone(),
        host.clone(),
        version.clone(),
    ));

    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr()))?;

    heartbeat.register().await;

    let scheduler = Scheduler::start(
        heartbeat,
        orchestrator.clone(),
        config.heartbeat_interval(),
        config.update_interval(),
        shutdown.child_token(),
    );

    let state = AppState {
        config: config.clone(),
        gateway: Arc::new(CommandGateway::new()),
        orchestrator: orchestrator.clone(),
        probe,
        host: Arc::new(host),
        version,
    };

    if let Err(e) = api::serve(listener, state, shutdown_signal(shutdown.clone())).await {
        error!("Agent API failed: {e:#}");
    }

    shutdown.cancel();
    scheduler.shutdown().await;

    // A manual update outlives its request; never exit mid-replace.
    if orchestrator.phase().await != UpdatePhase::Idle {
        info!("Waiting for the running update to finish");
    }
    orchestrator.wait_idle().await;

    if restart.is_requested() {
        info!("Exiting with status {RESTART_EXIT_CODE} for restart");
        std::process::exit(RESTART_EXIT_CODE);
    }
    info!("ninode-agent stopped");
    Ok(())
}
