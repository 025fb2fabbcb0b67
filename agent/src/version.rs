//! Running and latest-known agent versions
//!
//! Neither value is persisted: `current` starts as the build version and
//! moves to the installed version once an update has replaced the binary.

use tokio::sync::RwLock;

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct VersionState {
    current: RwLock<String>,
    latest_known: RwLock<Option<String>>,
}

impl VersionState {
    pub fn new(current: impl Into<String>) -> Self {
        Self {
            current: RwLock::new(current.into()),
            latest_known: RwLock::new(None),
        }
    }

    pub async fn current(&self) -> String {
        self.current.read().await.clone()
    }

    pub async fn latest_known(&self) -> Option<String> {
        self.latest_known.read().await.clone()
    }

    pub async fn set_latest_known(&self, version: &str) {
        *self.latest_known.write().await = Some(version.to_string());
    }

    pub async fn set_current(&self, version: &str) {
        *self.current.write().await = version.to_string();
    }
}

impl Default for VersionState {
    fn default() -> Self {
        Self::new(AGENT_VERSION)
    }
}
