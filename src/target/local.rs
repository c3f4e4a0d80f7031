use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use time::OffsetDateTime;

use super::{is_excluded, restart_command, BackupOutcome, Snapshot, Target, TransferPlan};
use crate::archive;
use crate::command;
use crate::config::DeployConfig;
use crate::error::DeployError;

/// Deploys into a directory on this machine.
#[derive(Debug)]
pub struct LocalTarget {
    repo_dir: PathBuf,
    source_dir: PathBuf,
    deploy_path: PathBuf,
    backup_dir: PathBuf,
    service_name: String,
    use_sudo: bool,
}

impl LocalTarget {
    pub fn from_config(config: &DeployConfig) -> Self {
        Self {
            repo_dir: config.repo_dir.clone(),
            source_dir: config.source_dir.clone(),
            deploy_path: config.deploy_path.clone(),
            backup_dir: config.backup_dir.clone(),
            service_name: config.service_name.clone(),
            use_sudo: config.use_sudo,
        }
    }

    fn copy_file(&self, relative: &Path) -> Result<(), DeployError> {
        let from = self.repo_dir.join(relative);
        let to = self.deploy_path.join(relative);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| DeployError::io(format!("creating {}", parent.display()), e))?;
        }
        fs::copy(&from, &to).map_err(|e| {
            DeployError::Transfer(format!(
                "copying {} to {}: {}",
                from.display(),
                to.display(),
                e
            ))
        })?;
        debug!("LOCAL: Copied {}", relative.display());
        Ok(())
    }
}

/// Recursively copies `from` into `to`, skipping excluded paths. Files already in `to` that are
/// absent from `from` are kept.
pub fn sync_tree(from: &Path, to: &Path) -> Result<usize, DeployError> {
    fs::create_dir_all(to)
        .map_err(|e| DeployError::io(format!("creating {}", to.display()), e))?;
    let entries = fs::read_dir(from)
        .map_err(|e| DeployError::Transfer(format!("reading {}: {}", from.display(), e)))?;

    let mut copied = 0;
    for entry in entries {
        let entry =
            entry.map_err(|e| DeployError::Transfer(format!("reading {}: {}", from.display(), e)))?;
        let path = entry.path();
        if is_excluded(Path::new(&entry.file_name())) {
            continue;
        }
        let dest = to.join(entry.file_name());
        let file_type = entry
            .file_type()
            .map_err(|e| DeployError::io(format!("inspecting {}", path.display()), e))?;

        if file_type.is_symlink() {
            copy_link(&path, &dest)?;
            copied += 1;
        } else if file_type.is_dir() {
            copied += sync_tree(&path, &dest)?;
        } else if file_type.is_file() {
            fs::copy(&path, &dest).map_err(|e| {
                DeployError::Transfer(format!(
                    "copying {} to {}: {}",
                    path.display(),
                    dest.display(),
                    e
                ))
            })?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Recreates the link at `dest` pointing where `link` points, as `rsync -a` does.
#[cfg(unix)]
fn copy_link(link: &Path, dest: &Path) -> Result<(), DeployError> {
    let points_to = fs::read_link(link)
        .map_err(|e| DeployError::io(format!("reading link {}", link.display()), e))?;
    if let Ok(existing) = fs::symlink_metadata(dest) {
        let removed = if existing.is_dir() {
            fs::remove_dir_all(dest)
        } else {
            fs::remove_file(dest)
        };
        removed.map_err(|e| DeployError::io(format!("replacing {}", dest.display()), e))?;
    }
    std::os::unix::fs::symlink(&points_to, dest).map_err(|e| {
        DeployError::Transfer(format!("linking {} to {}: {}", dest.display(), points_to.display(), e))
    })?;
    debug!("LOCAL: Linked {} -> {}", dest.display(), points_to.display());
    Ok(())
}

#[cfg(not(unix))]
fn copy_link(link: &Path, _dest: &Path) -> Result<(), DeployError> {
    warn!("LOCAL: Symlinks are not supported here, skipping {}", link.display());
    Ok(())
}

impl Target for LocalTarget {
    fn describe(&self) -> String {
        format!("local:{}", self.deploy_path.display())
    }

    fn backup(&self, now: OffsetDateTime) -> Result<BackupOutcome, DeployError> {
        let deployed = self.deploy_path.join(&self.source_dir);
        if !deployed.is_dir() {
            return Ok(BackupOutcome::NothingDeployed);
        }

        let path = self.backup_dir.join(archive::snapshot_name(now, "zip")?);
        let files = archive::write_zip(&deployed, &self.deploy_path, &path)?;
        info!("LOCAL: Archived {} files to {}", files, path.display());
        Ok(BackupOutcome::Archived(Snapshot {
            path,
            created_at: now,
        }))
    }

    fn latest_snapshot(&self) -> Result<Option<PathBuf>, DeployError> {
        archive::latest_snapshot(&self.backup_dir)
    }

    fn transfer(&self, plan: &TransferPlan, _backup: &BackupOutcome) -> Result<(), DeployError> {
        match plan {
            TransferPlan::Changed(files) => {
                for file in files {
                    self.copy_file(file)?;
                }
                info!("LOCAL: Copied {} changed files", files.len());
            }
            TransferPlan::Full => {
                let copied = sync_tree(
                    &self.repo_dir.join(&self.source_dir),
                    &self.deploy_path.join(&self.source_dir),
                )?;
                info!("LOCAL: Synced {} files", copied);
            }
        }
        Ok(())
    }

    fn restore(&self, snapshot: &Path) -> Result<(), DeployError> {
        let files = archive::extract_zip(snapshot, &self.deploy_path)?;
        info!("LOCAL: Restored {} files from {}", files, snapshot.display());
        Ok(())
    }

    fn restart(&self) -> Result<(), DeployError> {
        let cmd = restart_command(&self.service_name, self.use_sudo);
        command::run(&cmd[0], &cmd[1..], None)
            .map_err(|e| DeployError::Restart(e.to_string()))?;
        Ok(())
    }
}
