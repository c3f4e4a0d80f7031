//! Mutual exclusion between deployments of the same service.
//!
//! The lock is a file created with `create_new`, so exactly one process wins. The file holds a
//! small JSON record of who took it, which is reported back to anyone who loses the race.
//! Releasing happens on drop. A crashed run never gets to drop its lock, so a holder whose pid
//! has exited is treated as gone.
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::DeployError;

#[derive(Debug, Deserialize, Serialize)]
pub struct LockHolder {
    pub pid: u32,
    pub service: String,
    pub acquired_at: i64,
}

#[derive(Debug)]
pub struct DeployLock {
    path: PathBuf,
}

impl DeployLock {
    /// Takes the lock at `path`. A lock left behind by a process that no longer exists is removed
    /// and taken over, one held by a live process is an error naming that process.
    pub fn acquire(path: &Path, service: &str) -> Result<Self, DeployError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| DeployError::io(format!("creating {}", parent.display()), e))?;
        }

        let file = match create(path)? {
            Some(file) => file,
            None => {
                let holder = read_holder(path);
                match &holder {
                    Some(h) if !is_running(h.pid) => {
                        warn!(
                            "LOCK: {} was left by pid {} which is gone, taking it over",
                            path.display(),
                            h.pid
                        );
                        fs::remove_file(path).map_err(|e| {
                            DeployError::io(format!("removing stale {}", path.display()), e)
                        })?;
                        //Someone else may have reclaimed it first
                        create(path)?.ok_or_else(|| {
                            DeployError::Lock(describe_holder(path, read_holder(path).as_ref()))
                        })?
                    }
                    _ => return Err(DeployError::Lock(describe_holder(path, holder.as_ref()))),
                }
            }
        };
        Self::write_holder(file, path, service)?;

        info!("LOCK: Acquired {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    fn write_holder(mut file: File, path: &Path, service: &str) -> Result<(), DeployError> {
        let holder = LockHolder {
            pid: std::process::id(),
            service: service.to_string(),
            acquired_at: OffsetDateTime::now_utc().unix_timestamp(),
        };
        let body = serde_json::to_string(&holder)
            .map_err(|e| DeployError::Lock(format!("encoding holder: {e}")))?;
        //No half-written lock left behind
        if let Err(e) = file.write_all(body.as_bytes()) {
            let _ = fs::remove_file(path);
            return Err(DeployError::io(format!("writing {}", path.display()), e));
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `None` when the file already exists.
fn create(path: &Path) -> Result<Option<File>, DeployError> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(DeployError::io(format!("creating {}", path.display()), e)),
    }
}

fn read_holder(path: &Path) -> Option<LockHolder> {
    fs::read_to_string(path)
        .ok()
        .and_then(|body| serde_json::from_str::<LockHolder>(&body).ok())
}

#[cfg(target_os = "linux")]
fn is_running(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

//Without procfs a holder cannot be checked and is treated as live
#[cfg(not(target_os = "linux"))]
fn is_running(_pid: u32) -> bool {
    true
}

fn describe_holder(path: &Path, holder: Option<&LockHolder>) -> String {
    match holder {
        Some(h) => format!(
            "{} is held by pid {} deploying {} since {}",
            path.display(),
            h.pid,
            h.service,
            h.acquired_at
        ),
        None => format!("{} exists, another deployment may be running", path.display()),
    }
}

impl Drop for DeployLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => info!("LOCK: Released {}", self.path.display()),
            Err(e) => warn!("LOCK: Could not remove {}: {}", self.path.display(), e),
        }
    }
}
