//! Background loops: heartbeat and scheduled update checks
//!
//! Cancellation is only observed while a loop sleeps. A beat or an update
//! attempt that has started always runs to completion.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::heartbeat::HeartbeatReporter;
use crate::update::{UpdateOrchestrator, UpdateOutcome, UpdateTrigger};

pub struct Scheduler {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn both loops. `update_interval` of `None` leaves updates to `/update`.
    pub fn start(
        heartbeat: Arc<HeartbeatReporter>,
        orchestrator: Arc<UpdateOrchestrator>,
        heartbeat_interval: Duration,
        update_interval: Option<Duration>,
        cancel: CancellationToken,
    ) -> Self {
        let mut handles = vec![tokio::spawn(heartbeat_loop(
            heartbeat,
            heartbeat_interval,
            cancel.clone(),
        ))];

        match update_interval {
            Some(interval) => {
                handles.push(tokio::spawn(update_loop(orchestrator, interval, cancel.clone())));
            }
            None => info!("Scheduled update checks disabled"),
        }

        Self { cancel, handles }
    }

    /// Stop both loops and wait for them to exit
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Scheduler task ended abnormally: {e}");
            }
        }
    }
}

async fn heartbeat_loop(
    reporter: Arc<HeartbeatReporter>,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!("Heartbeat loop started (every {}s)", interval.as_secs());
    let mut failures: u32 = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Heartbeat loop shutting down");
                break;
            }
            _ = tokio::time::sleep(interval) => {
                if reporter.report_once().await {
                    if failures > 0 {
                        info!("Controller reachable again after {failures} failed heartbeat(s)");
                    }
                    failures = 0;
                } else {
                    failures = failures.saturating_add(1);
                }
            }
        }
    }
}

async fn update_loop(
    orchestrator: Arc<UpdateOrchestrator>,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!("Update check loop started (every {}s)", interval.as_secs());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Update check loop shutting down");
                break;
            }
            _ = tokio::time::sleep(interval) => {
                match orchestrator.run(UpdateTrigger::Scheduled).await {
                    Ok(UpdateOutcome::Updated { from_version, to_version }) => {
                        info!("Scheduled update {from_version} -> {to_version} installed");
                    }
                    Ok(UpdateOutcome::UpToDate { .. }) => {}
                    // already logged by the orchestrator
                    Err(_) => {}
                }
            }
        }
    }
}
