//! The `cancel` subcommand.

use clap::Args;

use super::Services;
use crate::{config::Settings, jobs::JobId, prelude::*, ui::Ui};

/// Options for the `cancel` subcommand.
#[derive(Debug, Args)]
pub struct CancelOpts {
    /// The job to cancel.
    job_id: JobId,
}

/// Ask the workers to stop a job before its next page.
#[instrument(level = "debug", skip_all, fields(job_id = %opts.job_id))]
pub async fn cmd_cancel(ui: Ui, settings: &Settings, opts: &CancelOpts) -> Result<()> {
    let services = Services::connect(settings).await?;
    services.require_shared("cancel")?;
    let control = services.control(settings).await?;
    if control.cancel_job(opts.job_id).await? {
        ui.display_message("🛑", &format!("Cancelling job {}", opts.job_id));
    } else {
        ui.display_message(
            "🤷",
            &format!("Job {} is unknown or already finished", opts.job_id),
        );
    }
    Ok(())
}
