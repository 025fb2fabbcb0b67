//! Sibling backups of files about to be replaced by an update

use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone)]
pub struct BackupRecord {
    pub original_path: PathBuf,
    pub backup_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// `/opt/ninode/agent` -> `/opt/ninode/agent.backup`
pub fn backup_path_for(path: &Path) -> PathBuf {
    sibling(path, ".backup")
}

pub(crate) fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Copy `path` to its `.backup` sibling, overwriting an older backup
pub async fn create_backup(path: &Path) -> io::Result<BackupRecord> {
    let backup_path = backup_path_for(path);
    tokio::fs::copy(path, &backup_path).await?;
    tokio::fs::File::open(&backup_path).await?.sync_all().await?;

    info!("Backed up {} to {}", path.display(), backup_path.display());
    Ok(BackupRecord {
        original_path: path.to_path_buf(),
        backup_path,
        created_at: Utc::now(),
    })
}

/// Put the backed-up bytes back at the original path.
///
/// The copy lands in a staging sibling first and is renamed into place, so a
/// running executable is swapped rather than written through.
pub async fn restore(record: &BackupRecord) -> io::Result<()> {
    let staging = sibling(&record.original_path, ".restore");
    tokio::fs::copy(&record.backup_path, &staging).await?;
    if let Err(e) = tokio::fs::rename(&staging, &record.original_path).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(e);
    }

    info!(
        "Restored {} from backup taken at {}",
        record.original_path.display(),
        record.created_at.to_rfc3339()
    );
    Ok(())
}
