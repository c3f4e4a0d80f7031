//! Version control operations: revision ids, pulling and the changed-file set.
use std::fmt::{Display, Formatter};
use std::ops::Deref;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::Serialize;

use crate::command;
use crate::error::DeployError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Revision(String);

impl Revision {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// First seven characters, for log lines.
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(7).map(|(i, _)| i).unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl Deref for Revision {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for Revision {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Revisions {
    pub before: Revision,
    pub after: Revision,
}

impl Revisions {
    pub fn moved(&self) -> bool {
        self.before != self.after
    }
}

pub trait Vcs {
    fn head(&self) -> Result<Revision, DeployError>;
    fn pull(&self) -> Result<(), DeployError>;
    /// Paths, relative to the repository root, that differ between the two revisions and still
    /// exist in `after`. Implementations may return paths outside `scope`; callers narrow the set
    /// with [scope_paths].
    fn changed_files(&self, revisions: &Revisions, scope: &Path)
        -> Result<Vec<PathBuf>, DeployError>;
}

/// Keeps only the paths strictly below `scope`, preserving order. Matching is by path component
/// so `backend_old/x.py` is not inside `backend`.
pub fn scope_paths(paths: Vec<PathBuf>, scope: &Path) -> Vec<PathBuf> {
    paths
        .into_iter()
        .filter(|p| p.starts_with(scope) && p.as_path() != scope)
        .collect()
}

/// Splits `git diff -z --name-only` output. Entries are NUL terminated and never quoted.
fn parse_name_list(output: &str) -> Vec<PathBuf> {
    output
        .split('\0')
        .filter(|name| !name.is_empty())
        .map(PathBuf::from)
        .collect()
}

#[derive(Debug)]
pub struct Git {
    repo_dir: PathBuf,
    remote: String,
    branch: Option<String>,
}

impl Git {
    pub fn new(repo_dir: impl Into<PathBuf>, remote: impl Into<String>, branch: Option<String>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            remote: remote.into(),
            branch,
        }
    }

    fn git<I, S>(&self, args: I) -> Result<String, DeployError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        command::run("git", args, Some(&self.repo_dir))
    }

    fn current_branch(&self) -> Result<String, DeployError> {
        if let Some(branch) = &self.branch {
            return Ok(branch.clone());
        }
        let branch = self.git(["rev-parse", "--abbrev-ref", "HEAD"])?.trim().to_string();
        if branch == "HEAD" {
            return Err(DeployError::Vcs(
                "checkout is on a detached HEAD, set DEPLOY_BRANCH".to_string(),
            ));
        }
        Ok(branch)
    }
}

impl Vcs for Git {
    fn head(&self) -> Result<Revision, DeployError> {
        let id = self.git(["rev-parse", "HEAD"])?.trim().to_string();
        if id.is_empty() {
            return Err(DeployError::Vcs("rev-parse returned nothing".to_string()));
        }
        Ok(Revision::new(id))
    }

    fn pull(&self) -> Result<(), DeployError> {
        let branch = self.current_branch()?;
        info!("GIT: Fetching {} and pulling {}", self.remote, branch);
        self.git(["fetch", self.remote.as_str()])?;
        self.git(["pull", self.remote.as_str(), branch.as_str()])?;
        Ok(())
    }

    fn changed_files(
        &self,
        revisions: &Revisions,
        scope: &Path,
    ) -> Result<Vec<PathBuf>, DeployError> {
        let range = format!("{}..{}", revisions.before, revisions.after);
        let scope_arg = scope.to_string_lossy().to_string();
        //Lowercase `d` excludes deletions, removed files are not propagated to the target
        let output = self.git([
            "-c",
            "core.quotePath=false",
            "diff",
            "-z",
            "--name-only",
            "--diff-filter=d",
            range.as_str(),
            "--",
            scope_arg.as_str(),
        ])?;
        let files = parse_name_list(&output);
        debug!("GIT: {} paths changed in {}", files.len(), range);
        Ok(files)
    }
}
