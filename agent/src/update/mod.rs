//! Self-update orchestration
//!
//! One attempt walks check -> download -> verify -> back up -> replace ->
//! restart. Nothing touches the disk until every artifact has been downloaded
//! and verified; after that any failure restores the backups taken in this
//! attempt. A second trigger while an attempt is running is rejected.

pub mod backup;
pub mod registry;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{ArtifactConfig, UpdateConfig};
use crate::error::UpdateError;
use crate::restart::RestartHandle;
use crate::version::VersionState;
use backup::BackupRecord;
use registry::{Release, ReleaseClient};

/// Mode for artifacts installed where no file existed before
const NEW_FILE_MODE: u32 = 0o755;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    Idle,
    CheckingVersion,
    UpToDate,
    Downloading,
    Verifying,
    BackingUp,
    Replacing,
    RollingBack,
    RestartScheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateTrigger {
    Scheduled,
    Manual,
}

impl fmt::Display for UpdateTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckResult {
    UpToDate { current: String },
    Available { current: String, latest: Release },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateOutcome {
    UpToDate {
        current_version: String,
    },
    #[serde(rename = "updating")]
    Updated {
        from_version: String,
        to_version: String,
    },
}

struct Artifact {
    source: ArtifactConfig,
    path: PathBuf,
}

struct Download {
    url: String,
    target: PathBuf,
    bytes: Vec<u8>,
}

/// Bookkeeping for one attempt, dropped when it ends
struct UpdateAttempt {
    id: Uuid,
    target_version: String,
    artifact_paths: Vec<PathBuf>,
    backups: Vec<BackupRecord>,
    created: Vec<PathBuf>,
    started_at: DateTime<Utc>,
}

impl UpdateAttempt {
    fn new(target_version: &str, artifact_paths: Vec<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_version: target_version.to_string(),
            artifact_paths,
            backups: Vec::new(),
            created: Vec::new(),
            started_at: Utc::now(),
        }
    }
}

pub struct UpdateOrchestrator {
    releases: ReleaseClient,
    artifacts: Vec<Artifact>,
    verify_checksums: bool,
    restart_delay: Duration,
    version: Arc<VersionState>,
    restart: RestartHandle,
    gate: Mutex<()>,
    phase: RwLock<UpdatePhase>,
}

impl UpdateOrchestrator {
    /// Artifacts without a path resolve to the running executable
    pub fn new(
        settings: &UpdateConfig,
        version: Arc<VersionState>,
        restart: RestartHandle,
    ) -> io::Result<Self> {
        let artifacts = settings
            .artifacts
            .iter()
            .map(|source| {
                let path = match &source.path {
                    Some(path) => path.clone(),
                    None => std::env::current_exe()?,
                };
                Ok(Artifact {
                    source: source.clone(),
                    path,
                })
            })
            .collect::<io::Result<Vec<_>>>()?;

        Ok(Self {
            releases: ReleaseClient::new(
                &settings.registry_url,
                Duration::from_secs(settings.request_timeout_secs),
            ),
            artifacts,
            verify_checksums: settings.verify_checksums,
            restart_delay: Duration::from_secs(settings.restart_delay_secs),
            version,
            restart,
            gate: Mutex::new(()),
            phase: RwLock::new(UpdatePhase::Idle),
        })
    }

    pub async fn phase(&self) -> UpdatePhase {
        *self.phase.read().await
    }

    /// Resolves once no attempt holds the gate; the phase is `Idle` by then
    pub async fn wait_idle(&self) {
        let _gate = self.gate.lock().await;
    }

    async fn set_phase(&self, phase: UpdatePhase) {
        *self.phase.write().await = phase;
    }

    /// Ask the registry for the latest release. Read-only.
    pub async fn check(&self) -> Result<CheckResult, UpdateError> {
        let latest = self.releases.latest().await?;
        self.version.set_latest_known(&latest.version).await;

        let current = self.version.current().await;
        if latest.version == current {
            Ok(CheckResult::UpToDate { current })
        } else {
            Ok(CheckResult::Available { current, latest })
        }
    }

    /// Run one full update attempt, or fail fast if one is already running
    pub async fn run(&self, trigger: UpdateTrigger) -> Result<UpdateOutcome, UpdateError> {
        let Ok(_gate) = self.gate.try_lock() else {
            warn!("Rejected {trigger} update: another attempt is in progress");
            return Err(UpdateError::InProgress);
        };

        let result = self.attempt(trigger).await;
        if let Err(e) = &result {
            error!("Update ({trigger}) failed: {e}");
        }
        self.set_phase(UpdatePhase::Idle).await;
        result
    }

    async fn attempt(&self, trigger: UpdateTrigger) -> Result<UpdateOutcome, UpdateError> {
        self.set_phase(UpdatePhase::CheckingVersion).await;
        let (current, latest) = match self.check().await? {
            CheckResult::UpToDate { current } => {
                self.set_phase(UpdatePhase::UpToDate).await;
                info!("Agent is up to date at {current}");
                return Ok(UpdateOutcome::UpToDate {
                    current_version: current,
                });
            }
            CheckResult::Available { current, latest } => (current, latest),
        };

        let mut attempt = UpdateAttempt::new(
            &latest.version,
            self.artifacts.iter().map(|a| a.path.clone()).collect(),
        );
        info!(
            "Update {} ({trigger}): {current} -> {} for {} file(s)",
            attempt.id,
            attempt.target_version,
            attempt.artifact_paths.len()
        );

        if let Err(e) = self.apply(&latest, &mut attempt).await {
            self.set_phase(UpdatePhase::RollingBack).await;
            self.roll_back(&attempt).await;
            return Err(e);
        }

        self.version.set_current(&latest.version).await;
        self.set_phase(UpdatePhase::RestartScheduled).await;
        self.restart.request(self.restart_delay);
        info!(
            "Update {} installed {} in {}ms",
            attempt.id,
            latest.version,
            (Utc::now() - attempt.started_at).num_milliseconds()
        );

        Ok(UpdateOutcome::Updated {
            from_version: current,
            to_version: latest.version,
        })
    }

    async fn apply(&self, release: &Release, attempt: &mut UpdateAttempt) -> Result<(), UpdateError> {
        self.set_phase(UpdatePhase::Downloading).await;
        let downloads = self.download_all(release).await?;

        if self.verify_checksums {
            self.set_phase(UpdatePhase::Verifying).await;
            self.verify_all(release, &downloads).await?;
        }

        let write_failed = |message: String| UpdateError::WriteFailed {
            version: release.version.clone(),
            message,
        };

        self.set_phase(UpdatePhase::BackingUp).await;
        let mut modes = Vec::with_capacity(downloads.len());
        for download in &downloads {
            match tokio::fs::metadata(&download.target).await {
                Ok(meta) => {
                    let record = backup::create_backup(&download.target).await.map_err(|e| {
                        write_failed(format!("backing up {}: {e}", download.target.display()))
                    })?;
                    attempt.backups.push(record);
                    modes.push(meta.permissions().mode() & 0o7777);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    attempt.created.push(download.target.clone());
                    modes.push(NEW_FILE_MODE);
                }
                Err(e) => {
                    return Err(write_failed(format!(
                        "inspecting {}: {e}",
                        download.target.display()
                    )))
                }
            }
        }

        self.set_phase(UpdatePhase::Replacing).await;
        for (download, mode) in downloads.iter().zip(modes) {
            install_file(&download.target, &download.bytes, mode)
                .await
                .map_err(|e| write_failed(format!("replacing {}: {e}", download.target.display())))?;
            info!(
                "Installed {} ({} bytes) from {}",
                download.target.display(),
                download.bytes.len(),
                download.url
            );
        }
        Ok(())
    }

    async fn download_all(&self, release: &Release) -> Result<Vec<Download>, UpdateError> {
        let mut downloads = Vec::with_capacity(self.artifacts.len());
        for artifact in &self.artifacts {
            let url = artifact.source.url_for(&release.tag, &release.version);
            let bytes = self
                .releases
                .fetch(&url)
                .await
                .map_err(|message| UpdateError::DownloadFailed {
                    version: release.version.clone(),
                    message,
                })?;
            downloads.push(Download {
                url,
                target: artifact.path.clone(),
                bytes,
            });
        }
        Ok(downloads)
    }

    async fn verify_all(&self, release: &Release, downloads: &[Download]) -> Result<(), UpdateError> {
        for download in downloads {
            let verify_failed = |message: String| UpdateError::VerifyFailed {
                version: release.version.clone(),
                message,
            };
            let expected = self
                .releases
                .expected_checksum(&download.url)
                .await
                .map_err(verify_failed)?;
            let actual = registry::sha256_hex(&download.bytes);
            if actual != expected {
                return Err(verify_failed(format!(
                    "checksum mismatch for {}: expected {expected}, got {actual}",
                    download.url
                )));
            }
        }
        Ok(())
    }

    /// Best effort: every step is attempted even if an earlier one fails
    async fn roll_back(&self, attempt: &UpdateAttempt) {
        if attempt.backups.is_empty() && attempt.created.is_empty() {
            return;
        }
        warn!("Rolling back update {}", attempt.id);

        for record in &attempt.backups {
            if let Err(e) = backup::restore(record).await {
                error!(
                    "Failed to restore {} from {}: {e}",
                    record.original_path.display(),
                    record.backup_path.display()
                );
            }
        }
        for path in &attempt.created {
            match tokio::fs::remove_file(path).await {
                Ok(()) => info!("Removed {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => error!("Failed to remove {}: {e}", path.display()),
            }
        }
    }
}

/// Write `bytes` next to `target`, then rename over it
async fn install_file(target: &Path, bytes: &[u8], mode: u32) -> io::Result<()> {
    let staging = backup::sibling(target, ".download");
    let result = async {
        let mut file = tokio::fs::File::create(&staging).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::set_permissions(&staging, std::fs::Permissions::from_mode(mode)).await?;
        tokio::fs::rename(&staging, target).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&staging).await;
    }
    result
}
