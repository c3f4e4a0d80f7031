use derive_more::{Display, Error};

/// Every way a deployment step can fail.
///
/// Steps return `Result<_, DeployError>` and the pipeline decides whether a given failure aborts
/// the run or is only logged.
#[derive(Debug, Display, Error)]
pub enum DeployError {
    #[display("invalid configuration: {}", _0)]
    Config(#[error(not(source))] String),
    #[display("`{}` failed ({}): {}", program, status, stderr)]
    Command {
        program: String,
        status: String,
        stderr: String,
    },
    #[display("{}: {}", context, source)]
    Io {
        context: String,
        source: std::io::Error,
    },
    #[display("version control: {}", _0)]
    Vcs(#[error(not(source))] String),
    #[display("preflight check failed: {}", _0)]
    PreflightFailed(#[error(not(source))] String),
    #[display("regression tests failed: {}", _0)]
    TestsFailed(#[error(not(source))] String),
    #[display("no backup available, refusing to transfer: {}", _0)]
    BackupUnavailable(#[error(not(source))] String),
    #[display("transfer failed: {}", _0)]
    Transfer(#[error(not(source))] String),
    #[display("archive: {}", _0)]
    Archive(#[error(not(source))] String),
    #[display("restart failed: {}", _0)]
    Restart(#[error(not(source))] String),
    #[display("deploy lock: {}", _0)]
    Lock(#[error(not(source))] String),
    #[display("deploy history: {}", _0)]
    History(#[error(not(source))] String),
}

impl DeployError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        DeployError::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<zip::result::ZipError> for DeployError {
    fn from(value: zip::result::ZipError) -> Self {
        DeployError::Archive(value.to_string())
    }
}

impl From<csv::Error> for DeployError {
    fn from(value: csv::Error) -> Self {
        DeployError::History(value.to_string())
    }
}
