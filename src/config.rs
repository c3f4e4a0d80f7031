//! Deployment settings.
//!
//! All knobs are read once at startup into a [DeployConfig] that is then handed by reference to
//! each step. Nothing downstream reads the environment.
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::DeployError;

pub const LOCAL_HOST: &str = "localhost";

#[derive(Clone, Debug)]
pub struct DeployConfig {
    pub deploy_user: String,
    pub deploy_host: String,
    pub deploy_path: PathBuf,
    pub service_name: String,
    pub backup_dir: PathBuf,
    pub health_url: String,
    pub health_token: String,
    pub health_retries: u32,
    pub health_delay: Duration,
    pub settle_delay: Duration,
    pub repo_dir: PathBuf,
    pub source_dir: PathBuf,
    pub git_remote: String,
    //None follows whatever branch is checked out
    pub git_branch: Option<String>,
    pub test_path: PathBuf,
    pub python: String,
    pub preflight_module: Option<String>,
    pub use_sudo: bool,
    pub lock_path: PathBuf,
    pub history_path: Option<PathBuf>,
}

impl DeployConfig {
    pub fn from_env() -> Result<Self, DeployError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. Unset keys fall back to the defaults of
    /// [DeployConfigBuilder]; set-but-malformed keys are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, DeployError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = DeployConfigBuilder::new();

        if let Some(v) = lookup("DEPLOY_REPO_DIR") {
            builder.with_repo_dir(v);
        }
        if let Some(v) = lookup("DEPLOY_USER") {
            builder.with_deploy_user(v);
        }
        if let Some(v) = lookup("DEPLOY_HOST") {
            builder.with_deploy_host(v);
        }
        if let Some(v) = lookup("DEPLOY_PATH") {
            builder.with_deploy_path(v);
        }
        if let Some(v) = lookup("DEPLOY_SERVICE") {
            builder.with_service_name(v);
        }
        if let Some(v) = lookup("DEPLOY_BACKUP_DIR") {
            builder.with_backup_dir(v);
        }
        if let Some(v) = lookup("DEPLOY_HEALTH_URL") {
            builder.with_health_url(v);
        }
        if let Some(v) = lookup("DEPLOY_HEALTH_TOKEN") {
            builder.with_health_token(v);
        }
        if let Some(v) = lookup("DEPLOY_HEALTH_RETRIES") {
            let retries = parse_number("DEPLOY_HEALTH_RETRIES", &v)?;
            builder.with_health_retries(u32::try_from(retries).map_err(|_| {
                DeployError::Config(format!("DEPLOY_HEALTH_RETRIES is too large: {retries}"))
            })?);
        }
        if let Some(v) = lookup("DEPLOY_HEALTH_DELAY_SECS") {
            builder.with_health_delay(Duration::from_secs(parse_number(
                "DEPLOY_HEALTH_DELAY_SECS",
                &v,
            )?));
        }
        if let Some(v) = lookup("DEPLOY_SETTLE_SECS") {
            builder.with_settle_delay(Duration::from_secs(parse_number("DEPLOY_SETTLE_SECS", &v)?));
        }
        if let Some(v) = lookup("DEPLOY_SOURCE_DIR") {
            builder.with_source_dir(v);
        }
        if let Some(v) = lookup("DEPLOY_REMOTE") {
            builder.with_git_remote(v);
        }
        if let Some(v) = lookup("DEPLOY_BRANCH") {
            builder.with_git_branch(non_empty(v));
        }
        if let Some(v) = lookup("DEPLOY_TEST_PATH") {
            builder.with_test_path(v);
        }
        if let Some(v) = lookup("DEPLOY_PYTHON") {
            builder.with_python(v);
        }
        if let Some(v) = lookup("DEPLOY_PREFLIGHT") {
            builder.with_preflight_module(non_empty(v));
        }
        if let Some(v) = lookup("DEPLOY_SUDO") {
            builder.with_sudo(parse_flag("DEPLOY_SUDO", &v)?);
        }
        if let Some(v) = lookup("DEPLOY_LOCK_PATH") {
            builder.with_lock_path(v);
        }
        if let Some(v) = lookup("DEPLOY_HISTORY") {
            builder.with_history_path(non_empty(v).map(PathBuf::from));
        }
        builder.build()
    }

    pub fn is_local(&self) -> bool {
        self.deploy_host == LOCAL_HOST
    }

    /// `user@host`, as handed to ssh and rsync.
    pub fn ssh_destination(&self) -> String {
        format!("{}@{}", self.deploy_user, self.deploy_host)
    }

    /// Where the service source tree lives on the target.
    pub fn deployed_dir(&self) -> PathBuf {
        self.deploy_path.join(&self.source_dir)
    }

    /// Where the service source tree lives in the checkout.
    pub fn checkout_dir(&self) -> PathBuf {
        self.repo_dir.join(&self.source_dir)
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64, DeployError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| DeployError::Config(format!("{key} must be a whole number, got `{value}`")))
}

fn parse_flag(key: &str, value: &str) -> Result<bool, DeployError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(DeployError::Config(format!(
            "{key} must be true or false, got `{value}`"
        ))),
    }
}

pub struct DeployConfigBuilder {
    deploy_user: String,
    deploy_host: String,
    deploy_path: PathBuf,
    service_name: String,
    backup_dir: PathBuf,
    health_url: String,
    health_token: String,
    health_retries: u32,
    health_delay: Duration,
    settle_delay: Duration,
    repo_dir: Option<PathBuf>,
    source_dir: PathBuf,
    git_remote: String,
    git_branch: Option<String>,
    test_path: PathBuf,
    python: String,
    preflight_module: Option<String>,
    use_sudo: bool,
    //Both derive from other fields unless set explicitly
    lock_path: Option<PathBuf>,
    history_path: Option<Option<PathBuf>>,
}

impl DeployConfigBuilder {
    pub fn build(&mut self) -> Result<DeployConfig, DeployError> {
        if self.health_retries == 0 {
            return Err(DeployError::Config(
                "health check needs at least one attempt".to_string(),
            ));
        }
        if self.source_dir.as_os_str().is_empty() || self.source_dir.is_absolute() {
            return Err(DeployError::Config(format!(
                "source dir must be a relative path, got `{}`",
                self.source_dir.display()
            )));
        }
        //Every body contains the empty string
        if self.health_token.trim().is_empty() {
            return Err(DeployError::Config("health token is empty".to_string()));
        }
        if self.deploy_host.trim().is_empty() {
            return Err(DeployError::Config("deploy host is empty".to_string()));
        }

        let repo_dir = match self.repo_dir.take() {
            Some(dir) => dir,
            None => std::env::current_dir()
                .map_err(|e| DeployError::io("resolving working directory", e))?,
        };
        let lock_path = self.lock_path.take().unwrap_or_else(|| {
            std::env::temp_dir().join(format!("{}.deploy.lock", self.service_name))
        });
        let history_path = self
            .history_path
            .take()
            .unwrap_or_else(|| Some(repo_dir.join(".deploy_history.csv")));

        Ok(DeployConfig {
            deploy_user: self.deploy_user.clone(),
            deploy_host: self.deploy_host.clone(),
            deploy_path: self.deploy_path.clone(),
            service_name: self.service_name.clone(),
            backup_dir: self.backup_dir.clone(),
            health_url: self.health_url.clone(),
            health_token: self.health_token.clone(),
            health_retries: self.health_retries,
            health_delay: self.health_delay,
            settle_delay: self.settle_delay,
            repo_dir,
            source_dir: self.source_dir.clone(),
            git_remote: self.git_remote.clone(),
            git_branch: self.git_branch.clone(),
            test_path: self.test_path.clone(),
            python: self.python.clone(),
            preflight_module: self.preflight_module.clone(),
            use_sudo: self.use_sudo,
            lock_path,
            history_path,
        })
    }

    pub fn with_deploy_user(&mut self, user: impl Into<String>) -> &mut Self {
        self.deploy_user = user.into();
        self
    }

    pub fn with_deploy_host(&mut self, host: impl Into<String>) -> &mut Self {
        self.deploy_host = host.into();
        self
    }

    pub fn with_deploy_path(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.deploy_path = path.into();
        self
    }

    pub fn with_service_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.service_name = name.into();
        self
    }

    pub fn with_backup_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.backup_dir = dir.into();
        self
    }

    pub fn with_health_url(&mut self, url: impl Into<String>) -> &mut Self {
        self.health_url = url.into();
        self
    }

    pub fn with_health_token(&mut self, token: impl Into<String>) -> &mut Self {
        self.health_token = token.into();
        self
    }

    pub fn with_health_retries(&mut self, retries: u32) -> &mut Self {
        self.health_retries = retries;
        self
    }

    pub fn with_health_delay(&mut self, delay: Duration) -> &mut Self {
        self.health_delay = delay;
        self
    }

    pub fn with_settle_delay(&mut self, delay: Duration) -> &mut Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_repo_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.repo_dir = Some(dir.into());
        self
    }

    pub fn with_source_dir(&mut self, dir: impl AsRef<Path>) -> &mut Self {
        //Tolerate `backend/` and `./backend`
        let cleaned: PathBuf = dir
            .as_ref()
            .components()
            .filter(|c| !matches!(c, std::path::Component::CurDir))
            .collect();
        self.source_dir = cleaned;
        self
    }

    pub fn with_git_remote(&mut self, remote: impl Into<String>) -> &mut Self {
        self.git_remote = remote.into();
        self
    }

    pub fn with_git_branch(&mut self, branch: Option<String>) -> &mut Self {
        self.git_branch = branch;
        self
    }

    pub fn with_test_path(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.test_path = path.into();
        self
    }

    pub fn with_python(&mut self, python: impl Into<String>) -> &mut Self {
        self.python = python.into();
        self
    }

    pub fn with_preflight_module(&mut self, module: Option<String>) -> &mut Self {
        self.preflight_module = module;
        self
    }

    pub fn with_sudo(&mut self, use_sudo: bool) -> &mut Self {
        self.use_sudo = use_sudo;
        self
    }

    pub fn with_lock_path(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.lock_path = Some(path.into());
        self
    }

    pub fn with_history_path(&mut self, path: Option<PathBuf>) -> &mut Self {
        self.history_path = Some(path);
        self
    }

    pub fn new() -> Self {
        Self {
            deploy_user: "amarktai".to_string(),
            deploy_host: LOCAL_HOST.to_string(),
            deploy_path: PathBuf::from("/var/amarktai/app"),
            service_name: "amarktai-api".to_string(),
            backup_dir: PathBuf::from("/var/amarktai/backups"),
            health_url: "http://localhost:8000/api/health/ping".to_string(),
            health_token: "ok".to_string(),
            health_retries: 5,
            health_delay: Duration::from_secs(3),
            settle_delay: Duration::from_secs(5),
            repo_dir: None,
            source_dir: PathBuf::from("backend"),
            git_remote: "origin".to_string(),
            git_branch: None,
            test_path: PathBuf::from("backend/tests/test_verification_suite.py"),
            python: "python3".to_string(),
            preflight_module: Some("backend.preflight".to_string()),
            use_sudo: true,
            lock_path: None,
            history_path: None,
        }
    }
}

impl Default for DeployConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
