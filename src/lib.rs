//! # What is amarktai-deploy?
//!
//! amarktai-deploy updates a running service from version control and puts it back the way it
//! was if the new version does not come up healthy. It replaces the shell script that used to do
//! the same job and keeps its behaviour, but every step now returns a result and the failure
//! policy is written down in one place, [Deployer](crate::pipeline::Deployer).
//!
//! # A run
//!
//! 1. Pull: record HEAD, fetch and pull the current branch, record HEAD again.
//! 2. Test: the preflight module and the regression suite, if present. Either failing stops the
//! run before anything on the target is touched.
//! 3. Diff: the files changed between the two revisions, restricted to the service source
//! directory. No new commits, or no changes in that directory, means the whole tree is deployed.
//! 4. Lock: a lock file keeps two deployments of the same service apart.
//! 5. Backup: the deployed tree is archived to a timestamped snapshot. A transfer cannot start
//! without the outcome of this step.
//! 6. Transfer: changed files one by one, or the whole tree minus virtualenvs and bytecode.
//! 7. Restart through systemd, then wait for the service to settle.
//! 8. Health: poll the health endpoint a bounded number of times. If it never answers with the
//! expected token the snapshot is restored, the service restarted, and the run fails.
//!
//! Targets are either this machine ([LocalTarget](crate::target::local::LocalTarget)) or a host
//! reached over ssh ([RemoteTarget](crate::target::remote::RemoteTarget)), chosen by whether the
//! deploy host is `localhost`.
//!
//! ```text
//! DEPLOY_HOST=vps.example cargo run --bin amarktai-deploy
//! ```
//!
//! Settings come from the environment, see [DeployConfig](crate::config::DeployConfig).
//!
//! # Known gaps
//!
//! - A failed transfer or restart aborts without rolling back.
//! - After a rollback the service is restarted but not probed again.
//! - Files deleted upstream are not removed from the target on a partial deploy.
//! - Snapshots are never pruned.
pub mod archive;
pub mod command;
pub mod config;
pub mod error;
pub mod health;
pub mod history;
pub mod lock;
pub mod pipeline;
pub mod suite;
pub mod target;
pub mod vcs;
