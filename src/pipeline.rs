//! The deployment run itself.
//!
//! A run moves through two phases. The first (pull, preflight, tests, diff) only reads the
//! checkout and any failure simply aborts. The second (backup, transfer, restart, health) touches
//! the target and runs under the deploy lock; only a failed health check leads to rollback.
//! Failures before that point leave the target as they found it or, for a failed transfer or
//! restart, partially updated.
use std::path::PathBuf;
use std::time::Duration;

use log::{error, info, warn};
use time::OffsetDateTime;

use crate::config::DeployConfig;
use crate::error::DeployError;
use crate::health::{
    wait_until_healthy, HealthOutcome, HealthPolicy, HttpProbe, Pause, Probe, ThreadPause,
};
use crate::history::{self, HistoryRecord};
use crate::lock::DeployLock;
use crate::suite::{Pytest, Suite, SuiteOutcome};
use crate::target::local::LocalTarget;
use crate::target::remote::RemoteTarget;
use crate::target::{BackupOutcome, Target, TransferPlan};
use crate::vcs::{scope_paths, Git, Revisions, Vcs};

/// Upper bound on a single health request.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum DeployOutcome {
    Deployed {
        revisions: Revisions,
        plan: TransferPlan,
        attempts: u32,
    },
    Aborted(DeployError),
    RolledBack {
        last_body: String,
        restored: Option<PathBuf>,
        restarted: bool,
    },
}

impl DeployOutcome {
    /// A rollback is a failure even when the restored service comes back.
    pub fn exit_code(&self) -> u8 {
        match self {
            DeployOutcome::Deployed { .. } => 0,
            DeployOutcome::Aborted(_) | DeployOutcome::RolledBack { .. } => 1,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DeployOutcome::Deployed { .. } => "deployed",
            DeployOutcome::Aborted(_) => "aborted",
            DeployOutcome::RolledBack { .. } => "rolled_back",
        }
    }
}

//What the run learnt along the way, kept for the history row
#[derive(Default)]
struct RunRecord {
    revisions: Option<Revisions>,
    plan: Option<TransferPlan>,
    snapshot: Option<PathBuf>,
}

pub struct Deployer {
    config: DeployConfig,
    vcs: Box<dyn Vcs>,
    suite: Box<dyn Suite>,
    target: Box<dyn Target>,
    probe: Box<dyn Probe>,
    pause: Box<dyn Pause>,
}

impl Deployer {
    /// Wires the production collaborators: git, pytest, ssh or local filesystem depending on the
    /// deploy host, and an HTTP health probe.
    pub fn from_config(config: DeployConfig) -> Result<Self, DeployError> {
        let target: Box<dyn Target> = if config.is_local() {
            Box::new(LocalTarget::from_config(&config))
        } else {
            Box::new(RemoteTarget::from_config(&config))
        };
        let probe = HttpProbe::new(config.health_url.clone(), PROBE_TIMEOUT)?;

        DeployerBuilder::new()
            .with_vcs(Box::new(Git::new(
                config.repo_dir.clone(),
                config.git_remote.clone(),
                config.git_branch.clone(),
            )))
            .with_suite(Box::new(Pytest::new(
                config.repo_dir.clone(),
                config.python.clone(),
                config.test_path.clone(),
                config.preflight_module.clone(),
            )))
            .with_target(target)
            .with_probe(Box::new(probe))
            .with_pause(Box::new(ThreadPause))
            .with_config(config)
            .build()
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    pub fn run(&self) -> DeployOutcome {
        info!(
            "DEPLOY: {} -> {}",
            self.config.service_name,
            self.target.describe()
        );
        let mut record = RunRecord::default();
        let outcome = self.execute(&mut record);

        match &outcome {
            DeployOutcome::Deployed { revisions, .. } => {
                info!("DEPLOY: {} is live and healthy", revisions.after.short())
            }
            DeployOutcome::Aborted(e) => error!("DEPLOY: Aborted: {}", e),
            DeployOutcome::RolledBack { restored, .. } => match restored {
                Some(path) => error!("DEPLOY: Failed, rolled back to {}", path.display()),
                None => error!("DEPLOY: Failed and no snapshot could be restored"),
            },
        }
        self.record_history(&record, &outcome);
        outcome
    }

    fn execute(&self, record: &mut RunRecord) -> DeployOutcome {
        let (revisions, plan) = match self.prepare(record) {
            Ok(prepared) => prepared,
            Err(e) => return DeployOutcome::Aborted(e),
        };

        //Held until this function returns, which is after restart or rollback
        let _lock = match DeployLock::acquire(&self.config.lock_path, &self.config.service_name) {
            Ok(lock) => lock,
            Err(e) => return DeployOutcome::Aborted(e),
        };
        self.apply(revisions, plan, record)
    }

    fn prepare(&self, record: &mut RunRecord) -> Result<(Revisions, TransferPlan), DeployError> {
        let revisions = self.pull()?;
        record.revisions = Some(revisions.clone());
        self.test()?;
        let plan = self.diff(&revisions)?;
        record.plan = Some(plan.clone());
        Ok((revisions, plan))
    }

    fn pull(&self) -> Result<Revisions, DeployError> {
        let before = self.vcs.head()?;
        self.vcs.pull()?;
        let after = self.vcs.head()?;
        info!("PULL: {} -> {}", before.short(), after.short());
        Ok(Revisions { before, after })
    }

    fn test(&self) -> Result<(), DeployError> {
        if self.suite.preflight()? == SuiteOutcome::Passed {
            info!("TEST: Preflight passed");
        }
        if self.suite.regression()? == SuiteOutcome::Passed {
            info!("TEST: Regression suite passed");
        }
        Ok(())
    }

    fn diff(&self, revisions: &Revisions) -> Result<TransferPlan, DeployError> {
        if !revisions.moved() {
            info!("DIFF: No new commits, deploying the whole tree");
            return Ok(TransferPlan::Full);
        }
        let changed = self.vcs.changed_files(revisions, &self.config.source_dir)?;
        let scoped = scope_paths(changed, &self.config.source_dir);
        let plan = TransferPlan::from_changes(scoped);
        match &plan {
            TransferPlan::Changed(files) => info!("DIFF: {} files changed", files.len()),
            TransferPlan::Full => info!(
                "DIFF: Nothing changed under {}, deploying the whole tree",
                self.config.source_dir.display()
            ),
        }
        Ok(plan)
    }

    /// Failure here is tolerated in the sense that it does not abort on its own, transfer then
    /// refuses to run without an outcome.
    fn backup(&self) -> Option<BackupOutcome> {
        match self.target.backup(OffsetDateTime::now_utc()) {
            Ok(outcome) => {
                match &outcome {
                    BackupOutcome::Archived(snapshot) => {
                        info!("BACKUP: Snapshot at {}", snapshot.path.display())
                    }
                    BackupOutcome::NothingDeployed => {
                        warn!("BACKUP: Nothing deployed yet, no snapshot taken")
                    }
                }
                Some(outcome)
            }
            Err(e) => {
                warn!("BACKUP: Failed: {}", e);
                None
            }
        }
    }

    fn transfer(
        &self,
        plan: &TransferPlan,
        backup: Option<&BackupOutcome>,
    ) -> Result<(), DeployError> {
        let Some(backup) = backup else {
            return Err(DeployError::BackupUnavailable(format!(
                "snapshot of {} could not be taken",
                self.config.deployed_dir().display()
            )));
        };
        info!("TRANSFER: Deploying {} plan", plan.kind());
        self.target.transfer(plan, backup)
    }

    fn restart(&self) -> Result<(), DeployError> {
        info!("RESTART: {}", self.config.service_name);
        self.target.restart()?;
        self.pause.pause(self.config.settle_delay);
        Ok(())
    }

    fn apply(
        &self,
        revisions: Revisions,
        plan: TransferPlan,
        record: &mut RunRecord,
    ) -> DeployOutcome {
        let backup = self.backup();
        record.snapshot = backup
            .as_ref()
            .and_then(|b| b.snapshot())
            .map(|s| s.path.clone());

        if let Err(e) = self.transfer(&plan, backup.as_ref()) {
            return DeployOutcome::Aborted(e);
        }
        if let Err(e) = self.restart() {
            return DeployOutcome::Aborted(e);
        }

        let policy = HealthPolicy::from_config(&self.config);
        match wait_until_healthy(&*self.probe, &*self.pause, &policy) {
            HealthOutcome::Healthy { attempts } => DeployOutcome::Deployed {
                revisions,
                plan,
                attempts,
            },
            HealthOutcome::Exhausted { attempts, last_body } => {
                error!("HEALTH: Still unhealthy after {} attempts, rolling back", attempts);
                self.rollback(backup.as_ref(), last_body)
            }
        }
    }

    /// Restores a snapshot and restarts once. The restarted service is not probed again.
    fn rollback(&self, backup: Option<&BackupOutcome>, last_body: String) -> DeployOutcome {
        let snapshot = match backup.and_then(|b| b.snapshot()) {
            Some(snapshot) => Some(snapshot.path.clone()),
            None => match self.target.latest_snapshot() {
                Ok(found) => found,
                Err(e) => {
                    error!("ROLLBACK: Could not look up snapshots: {}", e);
                    None
                }
            },
        };

        let restored = match snapshot {
            Some(path) => match self.target.restore(&path) {
                Ok(()) => {
                    info!("ROLLBACK: Restored {}", path.display());
                    Some(path)
                }
                Err(e) => {
                    error!("ROLLBACK: Restore of {} failed: {}", path.display(), e);
                    None
                }
            },
            None => {
                error!("ROLLBACK: No snapshot to restore");
                None
            }
        };

        let restarted = match self.target.restart() {
            Ok(()) => true,
            Err(e) => {
                error!("ROLLBACK: {}", e);
                false
            }
        };

        DeployOutcome::RolledBack {
            last_body,
            restored,
            restarted,
        }
    }

    fn record_history(&self, record: &RunRecord, outcome: &DeployOutcome) {
        let Some(path) = &self.config.history_path else {
            return;
        };
        let (before, after) = match &record.revisions {
            Some(r) => (r.before.to_string(), r.after.to_string()),
            None => (String::new(), String::new()),
        };
        let detail = match outcome {
            DeployOutcome::Deployed { attempts, .. } => format!("healthy after {attempts} attempts"),
            DeployOutcome::Aborted(e) => e.to_string(),
            DeployOutcome::RolledBack { last_body, .. } => {
                format!("last health body: {}", last_body.trim())
            }
        };
        let row = HistoryRecord {
            recorded_at: OffsetDateTime::now_utc().unix_timestamp(),
            target: self.target.describe(),
            before,
            after,
            plan: record
                .plan
                .as_ref()
                .map(|p| p.kind().to_string())
                .unwrap_or_default(),
            files: record.plan.as_ref().and_then(|p| p.file_count()),
            snapshot: record
                .snapshot
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            outcome: outcome.label().to_string(),
            detail,
        };
        if let Err(e) = history::append(path, &row) {
            warn!("HISTORY: {}", e);
        }
    }
}

pub struct DeployerBuilder {
    config: Option<DeployConfig>,
    vcs: Option<Box<dyn Vcs>>,
    suite: Option<Box<dyn Suite>>,
    target: Option<Box<dyn Target>>,
    probe: Option<Box<dyn Probe>>,
    pause: Option<Box<dyn Pause>>,
}

impl DeployerBuilder {
    pub fn build(&mut self) -> Result<Deployer, DeployError> {
        let missing = |what: &str| DeployError::Config(format!("deployer is missing its {what}"));
        Ok(Deployer {
            config: self.config.take().ok_or_else(|| missing("config"))?,
            vcs: self.vcs.take().ok_or_else(|| missing("version control"))?,
            suite: self.suite.take().ok_or_else(|| missing("test suite"))?,
            target: self.target.take().ok_or_else(|| missing("target"))?,
            probe: self.probe.take().ok_or_else(|| missing("health probe"))?,
            pause: self.pause.take().ok_or_else(|| missing("pause"))?,
        })
    }

    pub fn with_config(&mut self, config: DeployConfig) -> &mut Self {
        self.config = Some(config);
        self
    }

    pub fn with_vcs(&mut self, vcs: Box<dyn Vcs>) -> &mut Self {
        self.vcs = Some(vcs);
        self
    }

    pub fn with_suite(&mut self, suite: Box<dyn Suite>) -> &mut Self {
        self.suite = Some(suite);
        self
    }

    pub fn with_target(&mut self, target: Box<dyn Target>) -> &mut Self {
        self.target = Some(target);
        self
    }

    pub fn with_probe(&mut self, probe: Box<dyn Probe>) -> &mut Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_pause(&mut self, pause: Box<dyn Pause>) -> &mut Self {
        self.pause = Some(pause);
        self
    }

    pub fn new() -> Self {
        Self {
            config: None,
            vcs: None,
            suite: None,
            target: None,
            probe: None,
            pause: None,
        }
    }
}

impl Default for DeployerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
