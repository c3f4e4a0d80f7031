//! Pre-deployment checks run against the fresh checkout.
//!
//! Both checks are optional in the sense that a missing entry point is skipped with a warning,
//! but once an entry point exists its failure blocks the deployment before anything on the
//! target is touched.
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::command;
use crate::error::DeployError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuiteOutcome {
    Passed,
    Skipped,
}

pub trait Suite {
    /// Import-level smoke check of the service.
    fn preflight(&self) -> Result<SuiteOutcome, DeployError>;
    /// Regression tests.
    fn regression(&self) -> Result<SuiteOutcome, DeployError>;
}

/// Runs checks through the service's own Python interpreter.
#[derive(Debug)]
pub struct Pytest {
    repo_dir: PathBuf,
    python: String,
    test_path: PathBuf,
    preflight_module: Option<String>,
}

impl Pytest {
    pub fn new(
        repo_dir: impl Into<PathBuf>,
        python: impl Into<String>,
        test_path: impl Into<PathBuf>,
        preflight_module: Option<String>,
    ) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            python: python.into(),
            test_path: test_path.into(),
            preflight_module,
        }
    }
}

/// `backend.preflight` lives at `backend/preflight.py`.
pub fn module_path(module: &str) -> PathBuf {
    let mut path: PathBuf = module.split('.').collect();
    path.set_extension("py");
    path
}

fn failure_detail(err: DeployError, what: &Path) -> String {
    match err {
        DeployError::Command { status, stderr, .. } => {
            format!("{} ({}): {}", what.display(), status, last_lines(&stderr, 20))
        }
        other => format!("{}: {}", what.display(), other),
    }
}

fn last_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}

impl Suite for Pytest {
    fn preflight(&self) -> Result<SuiteOutcome, DeployError> {
        let Some(module) = &self.preflight_module else {
            return Ok(SuiteOutcome::Skipped);
        };
        let file = module_path(module);
        if !self.repo_dir.join(&file).is_file() {
            warn!("SUITE: No preflight at {}, skipping", file.display());
            return Ok(SuiteOutcome::Skipped);
        }

        info!("SUITE: Running preflight {}", module);
        command::run(
            &self.python,
            ["-m", module.as_str()],
            Some(&self.repo_dir),
        )
        .map_err(|e| DeployError::PreflightFailed(failure_detail(e, &file)))?;
        Ok(SuiteOutcome::Passed)
    }

    fn regression(&self) -> Result<SuiteOutcome, DeployError> {
        if !self.repo_dir.join(&self.test_path).exists() {
            warn!(
                "SUITE: No tests at {}, deploying without them",
                self.test_path.display()
            );
            return Ok(SuiteOutcome::Skipped);
        }

        info!("SUITE: Running {}", self.test_path.display());
        let test_path = self.test_path.to_string_lossy().to_string();
        command::run(
            &self.python,
            ["-m", "pytest", test_path.as_str(), "-q"],
            Some(&self.repo_dir),
        )
        .map_err(|e| DeployError::TestsFailed(failure_detail(e, &self.test_path)))?;
        Ok(SuiteOutcome::Passed)
    }
}
