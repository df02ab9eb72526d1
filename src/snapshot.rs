//! Device state backup and restore
//!
//! A [`DeviceSnapshot`] copies the configured directories and files off the
//! device into a private temporary directory. `restore` writes them back,
//! replacing whatever the suite left behind, and may be called any number of
//! times. The local copy is deleted on `release` or drop.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use certsuite_device::{DeviceControl, DeviceError};
use tempfile::TempDir;
use tracing::{debug, info};

use crate::config::DeviceConfig;
use crate::failure::FailureKind;

/// Snapshot errors
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("failed to back up {remote}: {source}")]
    Backup {
        remote: String,
        #[source]
        source: DeviceError,
    },

    #[error("failed to restore {remote}: {source}")]
    Restore {
        remote: String,
        #[source]
        source: DeviceError,
    },

    #[error("failed to remount device read-write: {0}")]
    Remount(#[source] DeviceError),

    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SnapshotError {
    pub fn kind(&self) -> FailureKind {
        let device = match self {
            SnapshotError::Backup { source, .. } | SnapshotError::Restore { source, .. } => source,
            SnapshotError::Remount(source) => source,
            SnapshotError::Io(_) => return FailureKind::Other,
        };
        if device.is_timeout() {
            FailureKind::Timeout
        } else {
            FailureKind::Transport
        }
    }
}

/// What to back up
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupPlan {
    pub dirs: Vec<String>,
    pub files: Vec<String>,
}

impl BackupPlan {
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            dirs: config.backup_dirs.clone(),
            files: config.backup_files.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty() && self.files.is_empty()
    }
}

/// Local copy of device state
pub struct DeviceSnapshot {
    device: Arc<dyn DeviceControl>,
    plan: BackupPlan,
    staging: Option<TempDir>,
}

impl DeviceSnapshot {
    /// Pull every planned entry off the device
    pub fn acquire(device: Arc<dyn DeviceControl>, plan: BackupPlan) -> Result<Self, SnapshotError> {
        let staging = tempfile::Builder::new().prefix("certsuite-backup-").tempdir()?;
        info!(
            dirs = plan.dirs.len(),
            files = plan.files.len(),
            local = %staging.path().display(),
            "Backing up device state"
        );

        for remote in plan.dirs.iter().chain(plan.files.iter()) {
            let local = local_path(staging.path(), remote);
            if let Some(parent) = local.parent() {
                std::fs::create_dir_all(parent)?;
            }
            debug!(remote = %remote, "Pulling");
            device.pull(remote, &local).map_err(|source| SnapshotError::Backup {
                remote: remote.clone(),
                source,
            })?;
        }

        Ok(Self {
            device,
            plan,
            staging: Some(staging),
        })
    }

    pub fn plan(&self) -> &BackupPlan {
        &self.plan
    }

    /// Local directory holding the copy
    pub fn local_root(&self) -> Option<&Path> {
        self.staging.as_ref().map(TempDir::path)
    }

    /// Put the backed-up state back on the device
    pub fn restore(&self) -> Result<(), SnapshotError> {
        let Some(root) = self.local_root() else {
            return Ok(());
        };
        info!("Restoring device state");
        self.device.remount().map_err(SnapshotError::Remount)?;

        for remote in &self.plan.files {
            let restore = |source| SnapshotError::Restore {
                remote: remote.clone(),
                source,
            };
            self.device.remove(remote, false).map_err(restore)?;
            self.device.push(&local_path(root, remote), remote).map_err(restore)?;
        }

        for remote in &self.plan.dirs {
            let restore = |source| SnapshotError::Restore {
                remote: remote.clone(),
                source,
            };
            self.device.remove(remote, true).map_err(restore)?;
            self.device.push(&local_path(root, remote), remote).map_err(restore)?;
        }
        Ok(())
    }

    /// Delete the local copy
    pub fn release(mut self) -> Result<(), SnapshotError> {
        if let Some(staging) = self.staging.take() {
            debug!(local = %staging.path().display(), "Removing device backup");
            staging.close()?;
        }
        Ok(())
    }
}

fn local_path(root: &Path, remote: &str) -> PathBuf {
    root.join(remote.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use certsuite_device::{FailureConfig, MockDevice, MockOp};

    fn device() -> Arc<MockDevice> {
        let device = Arc::new(MockDevice::new());
        device.write_file("/data/local/webapps/app/manifest.webapp", b"v1".to_vec());
        device.write_file("/data/local/webapps/webapps.json", b"{}".to_vec());
        device.write_file("/system/etc/hosts", b"127.0.0.1 localhost".to_vec());
        device
    }

    fn plan() -> BackupPlan {
        BackupPlan {
            dirs: vec!["/data/local/webapps".to_string()],
            files: vec!["/system/etc/hosts".to_string()],
        }
    }

    #[test]
    fn test_restore_undoes_changes() {
        let device = device();
        let before = device.filesystem();
        let snapshot = DeviceSnapshot::acquire(device.clone(), plan()).unwrap();

        device.write_file("/system/etc/hosts", b"10.0.0.1 evil".to_vec());
        device.write_file("/data/local/webapps/new/manifest.webapp", b"x".to_vec());
        device.remove("/data/local/webapps/webapps.json", false).unwrap();

        snapshot.restore().unwrap();
        assert_eq!(device.filesystem(), before);
        assert!(device.remount_count() >= 1);
        snapshot.release().unwrap();
    }

    #[test]
    fn test_restore_is_repeatable() {
        let device = device();
        let before = device.filesystem();
        let snapshot = DeviceSnapshot::acquire(device.clone(), plan()).unwrap();

        for _ in 0..3 {
            device.write_file("/system/etc/hosts", b"changed".to_vec());
            snapshot.restore().unwrap();
            assert_eq!(device.filesystem(), before);
        }
    }

    #[test]
    fn test_release_removes_local_copy() {
        let snapshot = DeviceSnapshot::acquire(device(), plan()).unwrap();
        let root = snapshot.local_root().unwrap().to_path_buf();
        assert!(root.join("system/etc/hosts").is_file());
        snapshot.release().unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn test_drop_removes_local_copy() {
        let snapshot = DeviceSnapshot::acquire(device(), plan()).unwrap();
        let root = snapshot.local_root().unwrap().to_path_buf();
        drop(snapshot);
        assert!(!root.exists());
    }

    #[test]
    fn test_missing_entry_fails_backup() {
        let device = device();
        let plan = BackupPlan {
            dirs: vec![],
            files: vec!["/system/etc/missing".to_string()],
        };
        let err = DeviceSnapshot::acquire(device, plan).err().unwrap();
        assert!(matches!(err, SnapshotError::Backup { .. }));
        assert_eq!(err.kind(), FailureKind::Transport);
    }

    #[test]
    fn test_remount_failure_is_reported() {
        let device = device();
        let snapshot = DeviceSnapshot::acquire(device.clone(), plan()).unwrap();
        device.fail(MockOp::Remount, FailureConfig::error("remount failed"));
        assert!(matches!(snapshot.restore(), Err(SnapshotError::Remount(_))));
    }
}
