//! The `recognize` subcommand.

use std::time::Duration;

use clap::Args;

use super::{RecognitionOpts, Services, collect_ad_hoc_result, print_task_result};
use crate::{config::Settings, prelude::*, ui::Ui};

/// Options for the `recognize` subcommand.
#[derive(Debug, Args)]
pub struct RecognizeOpts {
    #[clap(flatten)]
    recognition: RecognitionOpts,

    /// Seconds to wait for a worker to pick up the task.
    #[clap(long, default_value = "60")]
    wait: u64,

    /// Page image.
    image: PathBuf,
}

/// Recognize one page outside of any job, on the service lane.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_recognize(ui: Ui, settings: &Settings, opts: &RecognizeOpts) -> Result<()> {
    let services = Services::connect(settings).await?;
    let control = services.control(settings).await?;

    // The worker deletes the image when it's done, so hand it a copy.
    let staged = services
        .jobs
        .stage_pages(uuid::Uuid::new_v4(), std::slice::from_ref(&opts.image))
        .await?;
    let image_ref = staged
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("failed to stage {:?}", opts.image))?;

    let task_id = control
        .submit_service_page(image_ref, opts.recognition.to_config())
        .await?;
    let result = collect_ad_hoc_result(
        &ui,
        settings,
        &services,
        &control,
        task_id,
        Duration::from_secs(opts.wait),
    )
    .await?;
    print_task_result(&result)
}
