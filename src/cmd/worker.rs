//! The `worker` subcommand.

use clap::Args;

use super::Services;
use crate::{
    config::Settings,
    prelude::*,
    queues::worker::{RunMode, TaskReport},
    ui::{Activity, Ui},
};

/// Options for the `worker` subcommand.
#[derive(Debug, Args)]
pub struct WorkerOpts {
    /// Exit once every lane is empty instead of waiting for more work.
    #[clap(long)]
    until_idle: bool,
}

/// Take tasks from the shared queue until interrupted.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_worker(ui: Ui, settings: &Settings, opts: &WorkerOpts) -> Result<()> {
    let services = Services::connect(settings).await?;
    services.require_shared("worker")?;
    let worker = services.worker(settings)?;
    info!(
        concurrency = settings.worker_count(),
        backend = ?settings.backend,
        "Worker started"
    );

    let spinner = ui.task_spinner(Activity::Serving);
    let mut finished_jobs = 0;
    let mode = if opts.until_idle {
        RunMode::UntilIdle
    } else {
        RunMode::UntilInterrupted
    };
    let stats = worker
        .run(mode, |report| {
            spinner.inc(1);
            if let Ok(TaskReport::Finished(_)) = report {
                finished_jobs += 1;
                spinner.set_message(format!("{finished_jobs} jobs finished"));
            }
        })
        .await?;
    spinner.finish_using_style();
    ui.display_message(
        "📊",
        &format!(
            "{} steps, {} completed, {} errored, {} cancelled, {} stale, {} ad-hoc ({} failed), {} broken tasks",
            stats.steps,
            stats.completed,
            stats.errored,
            stats.cancelled,
            stats.dropped,
            stats.ad_hoc,
            stats.ad_hoc_failed,
            stats.failures
        ),
    );
    Ok(())
}
