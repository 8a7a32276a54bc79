//! The `rerun` subcommand.

use std::time::Duration;

use clap::Args;

use super::{Services, collect_ad_hoc_result, print_task_result};
use crate::{config::Settings, geometry::Region, prelude::*, ui::Ui};

/// Options for the `rerun` subcommand.
#[derive(Debug, Args)]
pub struct RerunOpts {
    /// Archived page image.
    image: PathBuf,

    /// Region as `x_min y_min x_max y_max`.
    #[clap(num_args = 4, value_names = ["X_MIN", "Y_MIN", "X_MAX", "Y_MAX"], allow_negative_numbers = true)]
    bbox: Vec<i32>,

    /// Rotation of the region, in degrees counter-clockwise.
    #[clap(long, default_value = "0", allow_negative_numbers = true)]
    rotation: f32,

    /// Text recognizer model ID.
    #[clap(long, default_value = "default")]
    recognizer: String,

    /// Seconds to wait for a worker to pick up the task.
    #[clap(long, default_value = "60")]
    wait: u64,
}

/// Recognize a single region again, possibly with another recognizer.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_rerun(ui: Ui, settings: &Settings, opts: &RerunOpts) -> Result<()> {
    let [x_min, y_min, x_max, y_max] = opts.bbox[..] else {
        return Err(anyhow!("expected 4 coordinates, got {}", opts.bbox.len()));
    };
    let region = Region::new(x_min, y_min, x_max, y_max).with_rotation(opts.rotation);

    let services = Services::connect(settings).await?;
    let control = services.control(settings).await?;
    let task_id = control
        .submit_single(opts.image.clone(), region, opts.recognizer.clone())
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
