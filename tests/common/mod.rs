#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use actix_web::{web, App, HttpResponse, HttpServer};
use time::OffsetDateTime;

use amarktai_deploy::config::{DeployConfig, DeployConfigBuilder};
use amarktai_deploy::error::DeployError;
use amarktai_deploy::health::{Pause, Probe, CONNECTION_FAILED};
use amarktai_deploy::pipeline::{Deployer, DeployerBuilder};
use amarktai_deploy::suite::{Suite, SuiteOutcome};
use amarktai_deploy::target::local::LocalTarget;
use amarktai_deploy::target::{BackupOutcome, Snapshot, Target, TransferPlan};
use amarktai_deploy::vcs::{Revision, Revisions, Vcs};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Pull,
    ChangedFiles,
    Preflight,
    Regression,
    Backup,
    LatestSnapshot,
    Transfer(TransferPlan),
    Restore(PathBuf),
    Restart,
    Probe,
    Pause(Duration),
}

pub type Journal = Rc<RefCell<Vec<Event>>>;

pub fn journal() -> Journal {
    Rc::new(RefCell::new(Vec::new()))
}

pub fn count(journal: &Journal, event: &Event) -> usize {
    journal.borrow().iter().filter(|e| *e == event).count()
}

pub fn position(journal: &Journal, pred: impl Fn(&Event) -> bool) -> Option<usize> {
    journal.borrow().iter().position(pred)
}

static SCRATCH: AtomicUsize = AtomicUsize::new(0);

/// Fresh, empty directory unique to this test process and call.
pub fn scratch(name: &str) -> PathBuf {
    let n = SCRATCH.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!(
        "amarktai-it-{}-{}-{}",
        name,
        std::process::id(),
        n
    ));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// Config with everything stateful pointed inside `root` and no real waiting.
pub fn config_in(root: &Path) -> DeployConfig {
    DeployConfigBuilder::new()
        .with_repo_dir(root.join("repo"))
        .with_deploy_path(root.join("app"))
        .with_backup_dir(root.join("backups"))
        .with_lock_path(root.join("deploy.lock"))
        .with_history_path(Some(root.join("history.csv")))
        .build()
        .unwrap()
}

pub struct FakeVcs {
    pub journal: Journal,
    pub heads: RefCell<VecDeque<&'static str>>,
    pub changed: Vec<PathBuf>,
    pub pull_fails: bool,
}

impl FakeVcs {
    pub fn moving(journal: &Journal, before: &'static str, after: &'static str) -> Self {
        Self {
            journal: journal.clone(),
            heads: RefCell::new(VecDeque::from(vec![before, after])),
            changed: Vec::new(),
            pull_fails: false,
        }
    }

    pub fn with_changes(mut self, paths: &[&str]) -> Self {
        self.changed = paths.iter().map(PathBuf::from).collect();
        self
    }
}

impl Vcs for FakeVcs {
    fn head(&self) -> Result<Revision, DeployError> {
        let mut heads = self.heads.borrow_mut();
        //Last head repeats once the script runs out
        let id = if heads.len() > 1 {
            heads.pop_front().unwrap()
        } else {
            *heads.front().unwrap()
        };
        Ok(Revision::new(id))
    }

    fn pull(&self) -> Result<(), DeployError> {
        self.journal.borrow_mut().push(Event::Pull);
        if self.pull_fails {
            return Err(DeployError::Vcs("could not resolve host".to_string()));
        }
        Ok(())
    }

    fn changed_files(
        &self,
        _revisions: &Revisions,
        _scope: &Path,
    ) -> Result<Vec<PathBuf>, DeployError> {
        self.journal.borrow_mut().push(Event::ChangedFiles);
        Ok(self.changed.clone())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behaviour {
    Pass,
    Skip,
    Fail,
}

pub struct FakeSuite {
    pub journal: Journal,
    pub preflight: Behaviour,
    pub regression: Behaviour,
}

impl FakeSuite {
    pub fn passing(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            preflight: Behaviour::Pass,
            regression: Behaviour::Pass,
        }
    }
}

impl Suite for FakeSuite {
    fn preflight(&self) -> Result<SuiteOutcome, DeployError> {
        self.journal.borrow_mut().push(Event::Preflight);
        match self.preflight {
            Behaviour::Pass => Ok(SuiteOutcome::Passed),
            Behaviour::Skip => Ok(SuiteOutcome::Skipped),
            Behaviour::Fail => Err(DeployError::PreflightFailed("import error".to_string())),
        }
    }

    fn regression(&self) -> Result<SuiteOutcome, DeployError> {
        self.journal.borrow_mut().push(Event::Regression);
        match self.regression {
            Behaviour::Pass => Ok(SuiteOutcome::Passed),
            Behaviour::Skip => Ok(SuiteOutcome::Skipped),
            Behaviour::Fail => Err(DeployError::TestsFailed("1 failed".to_string())),
        }
    }
}

pub struct FakeTarget {
    pub journal: Journal,
    pub backup_fails: bool,
    pub nothing_deployed: bool,
    pub transfer_fails: bool,
    pub previous_snapshot: Option<PathBuf>,
    pub snapshot: Rc<RefCell<Option<Snapshot>>>,
}

impl FakeTarget {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            backup_fails: false,
            nothing_deployed: false,
            transfer_fails: false,
            previous_snapshot: None,
            snapshot: Rc::new(RefCell::new(None)),
        }
    }
}

impl Target for FakeTarget {
    fn describe(&self) -> String {
        "fake".to_string()
    }

    fn backup(&self, now: OffsetDateTime) -> Result<BackupOutcome, DeployError> {
        self.journal.borrow_mut().push(Event::Backup);
        if self.backup_fails {
            return Err(DeployError::Archive("disk full".to_string()));
        }
        if self.nothing_deployed {
            return Ok(BackupOutcome::NothingDeployed);
        }
        let snapshot = Snapshot {
            path: PathBuf::from("/backups/backup_now.zip"),
            created_at: now,
        };
        *self.snapshot.borrow_mut() = Some(snapshot.clone());
        Ok(BackupOutcome::Archived(snapshot))
    }

    fn latest_snapshot(&self) -> Result<Option<PathBuf>, DeployError> {
        self.journal.borrow_mut().push(Event::LatestSnapshot);
        Ok(self.previous_snapshot.clone())
    }

    fn transfer(&self, plan: &TransferPlan, _backup: &BackupOutcome) -> Result<(), DeployError> {
        self.journal.borrow_mut().push(Event::Transfer(plan.clone()));
        if self.transfer_fails {
            return Err(DeployError::Transfer("permission denied".to_string()));
        }
        Ok(())
    }

    fn restore(&self, snapshot: &Path) -> Result<(), DeployError> {
        self.journal
            .borrow_mut()
            .push(Event::Restore(snapshot.to_path_buf()));
        Ok(())
    }

    fn restart(&self) -> Result<(), DeployError> {
        self.journal.borrow_mut().push(Event::Restart);
        Ok(())
    }
}

/// A real [LocalTarget] whose restarts are only recorded, systemd is not available in tests.
pub struct NoRestartLocal {
    pub journal: Journal,
    pub inner: LocalTarget,
}

impl Target for NoRestartLocal {
    fn describe(&self) -> String {
        self.inner.describe()
    }

    fn backup(&self, now: OffsetDateTime) -> Result<BackupOutcome, DeployError> {
        self.journal.borrow_mut().push(Event::Backup);
        self.inner.backup(now)
    }

    fn latest_snapshot(&self) -> Result<Option<PathBuf>, DeployError> {
        self.journal.borrow_mut().push(Event::LatestSnapshot);
        self.inner.latest_snapshot()
    }

    fn transfer(&self, plan: &TransferPlan, backup: &BackupOutcome) -> Result<(), DeployError> {
        self.journal.borrow_mut().push(Event::Transfer(plan.clone()));
        self.inner.transfer(plan, backup)
    }

    fn restore(&self, snapshot: &Path) -> Result<(), DeployError> {
        self.journal
            .borrow_mut()
            .push(Event::Restore(snapshot.to_path_buf()));
        self.inner.restore(snapshot)
    }

    fn restart(&self) -> Result<(), DeployError> {
        self.journal.borrow_mut().push(Event::Restart);
        Ok(())
    }
}

pub struct FakeProbe {
    pub journal: Journal,
    pub bodies: RefCell<VecDeque<String>>,
}

impl FakeProbe {
    /// Answers with `bodies` in order, then with the connection-failure sentinel.
    pub fn answering(journal: &Journal, bodies: &[&str]) -> Self {
        Self {
            journal: journal.clone(),
            bodies: RefCell::new(bodies.iter().map(|b| b.to_string()).collect()),
        }
    }
}

impl Probe for FakeProbe {
    fn probe(&self) -> String {
        self.journal.borrow_mut().push(Event::Probe);
        self.bodies
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| CONNECTION_FAILED.to_string())
    }
}

pub struct RecordingPause {
    pub journal: Journal,
}

impl Pause for RecordingPause {
    fn pause(&self, duration: Duration) {
        self.journal.borrow_mut().push(Event::Pause(duration));
    }
}

pub fn deployer(
    config: DeployConfig,
    journal: &Journal,
    vcs: FakeVcs,
    suite: FakeSuite,
    target: Box<dyn Target>,
    probe: FakeProbe,
) -> Deployer {
    DeployerBuilder::new()
        .with_config(config)
        .with_vcs(Box::new(vcs))
        .with_suite(Box::new(suite))
        .with_target(target)
        .with_probe(Box::new(probe))
        .with_pause(Box::new(RecordingPause {
            journal: journal.clone(),
        }))
        .build()
        .unwrap()
}

/// Serves `body` at `/api/health/ping` on an ephemeral port from a background thread and
/// returns the full URL. The listener is bound before returning so requests queue until the
/// server accepts them.
pub fn serve_health(body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    thread::spawn(move || {
        let _ = actix_web::rt::System::new().block_on(async move {
            HttpServer::new(move || {
                App::new().route(
                    "/api/health/ping",
                    web::get().to(move || async move { HttpResponse::Ok().body(body) }),
                )
            })
            .workers(1)
            .listen(listener)?
            .run()
            .await
        });
    });

    format!("http://127.0.0.1:{port}/api/health/ping")
}

/// A URL on which nothing is listening.
pub fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{port}/api/health/ping")
}
