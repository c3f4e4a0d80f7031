//! Targets are the hosts a service is deployed to.
//!
//! A target knows how to snapshot the deployed tree, move files onto it, put a snapshot back and
//! restart the service. [LocalTarget](crate::target::local::LocalTarget) does the work in-process
//! when the deploy host is `localhost`, [RemoteTarget](crate::target::remote::RemoteTarget) drives
//! ssh and rsync otherwise.
//!
//! Transfers take a [BackupOutcome] by reference: the only way to get one is to have run
//! [Target::backup], which keeps "snapshot before first write" a property of the types.
use std::path::{Path, PathBuf};

use time::OffsetDateTime;

use crate::error::DeployError;

pub mod local;
pub mod remote;

/// Directory names that are never shipped to the target.
pub const EXCLUDED_DIRS: [&str; 3] = ["venv", ".venv", "__pycache__"];
/// File extensions that are never shipped to the target.
pub const EXCLUDED_EXTENSIONS: [&str; 1] = ["pyc"];

pub fn is_excluded(path: &Path) -> bool {
    let dir_hit = path
        .components()
        .any(|c| EXCLUDED_DIRS.iter().any(|d| c.as_os_str() == *d));
    let ext_hit = path
        .extension()
        .map(|ext| EXCLUDED_EXTENSIONS.iter().any(|e| ext == *e))
        .unwrap_or(false);
    dir_hit || ext_hit
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferPlan {
    /// Individual files, relative to the repository root.
    Changed(Vec<PathBuf>),
    /// The whole service source tree.
    Full,
}

impl TransferPlan {
    /// An empty change set deploys everything rather than nothing.
    pub fn from_changes(files: Vec<PathBuf>) -> Self {
        if files.is_empty() {
            TransferPlan::Full
        } else {
            TransferPlan::Changed(files)
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TransferPlan::Changed(_) => "changed",
            TransferPlan::Full => "full",
        }
    }

    pub fn file_count(&self) -> Option<usize> {
        match self {
            TransferPlan::Changed(files) => Some(files.len()),
            TransferPlan::Full => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub path: PathBuf,
    pub created_at: OffsetDateTime,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackupOutcome {
    Archived(Snapshot),
    /// The deployed directory did not exist yet, so there was nothing to lose.
    NothingDeployed,
}

impl BackupOutcome {
    pub fn snapshot(&self) -> Option<&Snapshot> {
        match self {
            BackupOutcome::Archived(snapshot) => Some(snapshot),
            BackupOutcome::NothingDeployed => None,
        }
    }
}

pub trait Target {
    fn describe(&self) -> String;
    fn backup(&self, now: OffsetDateTime) -> Result<BackupOutcome, DeployError>;
    /// Most recent snapshot in the backup directory, from any run.
    fn latest_snapshot(&self) -> Result<Option<PathBuf>, DeployError>;
    fn transfer(&self, plan: &TransferPlan, backup: &BackupOutcome) -> Result<(), DeployError>;
    fn restore(&self, snapshot: &Path) -> Result<(), DeployError>;
    fn restart(&self) -> Result<(), DeployError>;
}

/// Program and arguments that restart `service` through systemd.
pub fn restart_command(service: &str, use_sudo: bool) -> Vec<String> {
    let mut cmd = Vec::new();
    if use_sudo {
        cmd.push("sudo".to_string());
    }
    cmd.extend(["systemctl".to_string(), "restart".to_string(), service.to_string()]);
    cmd
}
