//! The `status` subcommand.

use clap::Args;

use super::Services;
use crate::{config::Settings, jobs::JobId, prelude::*};

/// Options for the `status` subcommand.
#[derive(Debug, Args)]
pub struct StatusOpts {
    /// The job to look up.
    job_id: JobId,

    /// Print the full progress record as JSON.
    #[clap(long)]
    json: bool,
}

/// Print a job's status code and progress message.
#[instrument(level = "debug", skip_all, fields(job_id = %opts.job_id))]
pub async fn cmd_status(settings: &Settings, opts: &StatusOpts) -> Result<()> {
    let services = Services::connect(settings).await?;
    let control = services.control(settings).await?;
    let progress = control
        .job_status(opts.job_id)
        .await?
        .ok_or_else(|| anyhow!("unknown job {}", opts.job_id))?;
    if opts.json {
        println!(
            "{}",
            serde_json::to_string(&progress).context("failed to serialize progress")?
        );
    } else {
        println!("{} {}", progress.status_code(), progress);
    }
    Ok(())
}
