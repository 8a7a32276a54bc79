//! The `submit` subcommand.

use clap::Args;

use super::{RecognitionOpts, Services};
use crate::{config::Settings, jobs::Job, prelude::*};

/// Options for the `submit` subcommand.
#[derive(Debug, Args)]
pub struct SubmitOpts {
    /// Who to charge for the job.
    #[clap(long, default_value = "cli")]
    owner: String,

    #[clap(flatten)]
    recognition: RecognitionOpts,

    /// Page images, in page order.
    #[clap(required = true)]
    pages: Vec<PathBuf>,
}

/// Queue a job for the workers and print its ID.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_submit(settings: &Settings, opts: &SubmitOpts) -> Result<()> {
    let services = Services::connect(settings).await?;
    services.require_shared("submit")?;
    let control = services.control(settings).await?;

    // Stage copies, so the pipeline is free to delete them.
    let job = Job::new(&opts.owner, opts.pages.clone(), opts.recognition.to_config());
    let page_refs = services.jobs.stage_pages(job.id, &job.page_refs).await?;
    let job = Job { page_refs, ..job };
    let job = control.submit_job(job).await?;
    println!("{}", job.id);
    Ok(())
}
