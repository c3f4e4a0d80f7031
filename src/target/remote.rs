use std::path::{Path, PathBuf};

use log::{debug, info};
use time::OffsetDateTime;

use super::{
    restart_command, BackupOutcome, Snapshot, Target, TransferPlan, EXCLUDED_DIRS,
    EXCLUDED_EXTENSIONS,
};
use crate::archive;
use crate::command::{self, shell_quote};
use crate::config::DeployConfig;
use crate::error::DeployError;

/// Deploys to another machine over ssh. Snapshots are `.tar.gz` files created and unpacked by
/// `tar` on the remote side; files travel with rsync.
#[derive(Debug)]
pub struct RemoteTarget {
    destination: String,
    repo_dir: PathBuf,
    source_dir: PathBuf,
    deploy_path: PathBuf,
    backup_dir: PathBuf,
    service_name: String,
    use_sudo: bool,
}

impl RemoteTarget {
    pub fn from_config(config: &DeployConfig) -> Self {
        Self {
            destination: config.ssh_destination(),
            repo_dir: config.repo_dir.clone(),
            source_dir: config.source_dir.clone(),
            deploy_path: config.deploy_path.clone(),
            backup_dir: config.backup_dir.clone(),
            service_name: config.service_name.clone(),
            use_sudo: config.use_sudo,
        }
    }

    /// Arguments for running `script` on the remote host. BatchMode stops ssh from hanging on a
    /// password prompt.
    pub fn ssh_args(&self, script: &str) -> Vec<String> {
        vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            self.destination.clone(),
            script.to_string(),
        ]
    }

    fn ssh(&self, script: &str) -> Result<String, DeployError> {
        command::run("ssh", self.ssh_args(script), None)
    }

    fn remote_path(&self, path: &Path) -> String {
        format!("{}:{}", self.destination, shell_quote(&path.to_string_lossy()))
    }

    pub fn backup_script(&self, archive_path: &Path) -> String {
        format!(
            "mkdir -p {} && tar -czf {} -C {} {}",
            shell_quote(&self.backup_dir.to_string_lossy()),
            shell_quote(&archive_path.to_string_lossy()),
            shell_quote(&self.deploy_path.to_string_lossy()),
            shell_quote(&self.source_dir.to_string_lossy()),
        )
    }

    pub fn restore_script(&self, archive_path: &Path) -> String {
        format!(
            "tar -xzf {} -C {}",
            shell_quote(&archive_path.to_string_lossy()),
            shell_quote(&self.deploy_path.to_string_lossy()),
        )
    }

    pub fn restart_script(&self) -> String {
        restart_command(&self.service_name, self.use_sudo)
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// rsync arguments that mirror the checkout's source tree onto the deployed one.
    pub fn full_sync_args(&self) -> Vec<String> {
        let mut args = vec!["-az".to_string()];
        for dir in EXCLUDED_DIRS {
            args.push("--exclude".to_string());
            args.push(dir.to_string());
        }
        for ext in EXCLUDED_EXTENSIONS {
            args.push("--exclude".to_string());
            args.push(format!("*.{ext}"));
        }
        //Trailing slashes sync directory contents rather than nesting the directory
        args.push(format!("{}/", self.repo_dir.join(&self.source_dir).display()));
        args.push(format!(
            "{}/",
            self.remote_path(&self.deploy_path.join(&self.source_dir))
        ));
        args
    }

    fn deployed_exists(&self) -> Result<bool, DeployError> {
        let deployed = self.deploy_path.join(&self.source_dir);
        let script = format!("test -d {}", shell_quote(&deployed.to_string_lossy()));
        match command::status("ssh", self.ssh_args(&script), None)? {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            other => Err(DeployError::Command {
                program: "ssh".to_string(),
                status: format!("{other:?}"),
                stderr: format!("could not reach {}", self.destination),
            }),
        }
    }
}

/// Picks the newest snapshot out of a remote `ls -1` listing.
pub fn newest_in_listing(listing: &str, dir: &Path) -> Option<PathBuf> {
    listing
        .lines()
        .map(str::trim)
        .filter_map(|name| archive::snapshot_time(name).map(|t| (t, name)))
        .max_by_key(|(t, _)| *t)
        .map(|(_, name)| dir.join(name))
}

impl Target for RemoteTarget {
    fn describe(&self) -> String {
        format!("{}:{}", self.destination, self.deploy_path.display())
    }

    fn backup(&self, now: OffsetDateTime) -> Result<BackupOutcome, DeployError> {
        if !self.deployed_exists()? {
            return Ok(BackupOutcome::NothingDeployed);
        }
        let path = self.backup_dir.join(archive::snapshot_name(now, "tar.gz")?);
        self.ssh(&self.backup_script(&path))?;
        info!("REMOTE: Archived to {}:{}", self.destination, path.display());
        Ok(BackupOutcome::Archived(Snapshot {
            path,
            created_at: now,
        }))
    }

    fn latest_snapshot(&self) -> Result<Option<PathBuf>, DeployError> {
        let script = format!(
            "ls -1 {} 2>/dev/null || true",
            shell_quote(&self.backup_dir.to_string_lossy())
        );
        let listing = self.ssh(&script)?;
        Ok(newest_in_listing(&listing, &self.backup_dir))
    }

    fn transfer(&self, plan: &TransferPlan, _backup: &BackupOutcome) -> Result<(), DeployError> {
        match plan {
            TransferPlan::Changed(files) => {
                for file in files {
                    let dest = self.deploy_path.join(file);
                    if let Some(parent) = dest.parent() {
                        self.ssh(&format!("mkdir -p {}", shell_quote(&parent.to_string_lossy())))
                            .map_err(|e| DeployError::Transfer(e.to_string()))?;
                    }
                    let from = self.repo_dir.join(file).to_string_lossy().to_string();
                    command::run("rsync", ["-az".to_string(), from, self.remote_path(&dest)], None)
                        .map_err(|e| DeployError::Transfer(e.to_string()))?;
                    debug!("REMOTE: Copied {}", file.display());
                }
                info!("REMOTE: Copied {} changed files", files.len());
            }
            TransferPlan::Full => {
                let deployed = self.deploy_path.join(&self.source_dir);
                self.ssh(&format!("mkdir -p {}", shell_quote(&deployed.to_string_lossy())))
                    .map_err(|e| DeployError::Transfer(e.to_string()))?;
                command::run("rsync", self.full_sync_args(), None)
                    .map_err(|e| DeployError::Transfer(e.to_string()))?;
                info!("REMOTE: Synced {}", self.source_dir.display());
            }
        }
        Ok(())
    }

    fn restore(&self, snapshot: &Path) -> Result<(), DeployError> {
        self.ssh(&self.restore_script(snapshot))?;
        info!("REMOTE: Restored {}", snapshot.display());
        Ok(())
    }

    fn restart(&self) -> Result<(), DeployError> {
        self.ssh(&self.restart_script())
            .map_err(|e| DeployError::Restart(e.to_string()))?;
        Ok(())
    }
}
