use std::process::ExitCode;

use amarktai_deploy::config::DeployConfig;
use amarktai_deploy::pipeline::{DeployOutcome, Deployer};
use anyhow::{Context, Result};
use log::error;

fn deploy() -> Result<DeployOutcome> {
    let config = DeployConfig::from_env().context("loading deploy configuration")?;
    let deployer = Deployer::from_config(config).context("setting up deployment")?;
    Ok(deployer.run())
}

fn main() -> ExitCode {
    //A missing .env is the normal case
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match deploy() {
        Ok(outcome) => ExitCode::from(outcome.exit_code()),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
