//! Self-restart after a successful update.
//!
//! The agent does not exec itself. It stops cleanly and exits with
//! [`RESTART_EXIT_CODE`]; the service manager starts the new binary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// `EX_TEMPFAIL`, paired with `RestartForceExitStatus=75` in the unit file
pub const RESTART_EXIT_CODE: i32 = 75;

#[derive(Clone)]
pub struct RestartHandle {
    shutdown: CancellationToken,
    requested: Arc<AtomicBool>,
}

impl RestartHandle {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Trigger shutdown after `delay`; later requests are no-ops
    pub fn request(&self, delay: Duration) {
        if self.requested.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Restart scheduled in {}s", delay.as_secs());

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shutdown.cancel();
        });
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}
