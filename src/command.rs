//! Spawning of external programs.
//!
//! Every collaborator that is not spoken to natively (git, pytest, systemctl, ssh, rsync) goes
//! through here so that non-zero exits are converted into [DeployError::Command] in one place.
use std::ffi::OsStr;
use std::path::Path;
use std::process::{Command, Output};

use log::debug;

use crate::error::DeployError;

fn spawn<I, S>(program: &str, args: I, cwd: Option<&Path>) -> Result<Output, DeployError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    debug!("COMMAND: {:?}", cmd);
    cmd.output()
        .map_err(|e| DeployError::io(format!("spawning `{program}`"), e))
}

/// Runs the program to completion and returns its stdout. A non-zero exit is an error carrying
/// whatever the program wrote to stderr (or stdout when stderr is empty).
pub fn run<I, S>(program: &str, args: I, cwd: Option<&Path>) -> Result<String, DeployError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = spawn(program, args, cwd)?;
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(DeployError::Command {
            program: program.to_string(),
            status: output.status.to_string(),
            stderr: if stderr.is_empty() {
                stdout.trim().to_string()
            } else {
                stderr
            },
        });
    }
    Ok(stdout)
}

/// Runs the program and hands back its exit code without judging it. `None` means the process
/// was killed by a signal.
pub fn status<I, S>(program: &str, args: I, cwd: Option<&Path>) -> Result<Option<i32>, DeployError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Ok(spawn(program, args, cwd)?.status.code())
}

/// Quotes a value for a POSIX shell. Remote commands travel to ssh as a single string, so every
/// path interpolated into one goes through this.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-:=@+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}
