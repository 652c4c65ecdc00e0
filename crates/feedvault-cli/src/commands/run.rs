//! `feedvault run`: batch fetch from a manifest.

use std::fs;
use std::process::ExitCode;

use feedvault_core::{run_sources, RunManifest};

use crate::cli::RunArgs;
use crate::error::CliError;
use crate::output;
use crate::settings;

use super::{Context, EXIT_CANCELLED, EXIT_FETCH_FAILED};

pub async fn run(args: &RunArgs, context: &Context) -> Result<ExitCode, CliError> {
    let manifest = RunManifest::from_toml_str(&fs::read_to_string(&args.manifest)?)?;
    let jobs = manifest.into_jobs(settings::credential_for)?;
    let threshold = args
        .failure_threshold
        .unwrap_or(context.config.failure_threshold);

    let client = context.fetch_client(context.open_store()?);
    let report = run_sources(&client, jobs, threshold).await;
    output::render(&report, context.pretty)?;

    if report.cancelled {
        return Ok(ExitCode::from(EXIT_CANCELLED));
    }
    if report.threshold_exceeded() {
        return Ok(ExitCode::from(EXIT_FETCH_FAILED));
    }
    Ok(ExitCode::SUCCESS)
}
