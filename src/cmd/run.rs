//! The `run` subcommand.

use std::pin::pin;

use clap::Args;
use tokio::io::AsyncWriteExt as _;

use super::{RecognitionOpts, Services};
use crate::{
    config::Settings,
    jobs::{Job, JobRepository as _, JobStatus},
    prelude::*,
    queues::worker::RunMode,
    ui::Ui,
};

/// Options for the `run` subcommand.
#[derive(Debug, Args)]
pub struct RunOpts {
    /// Who to charge for the job.
    #[clap(long, default_value = "cli")]
    owner: String,

    #[clap(flatten)]
    recognition: RecognitionOpts,

    /// Output file for page results, as JSON Lines. Defaults to stdout.
    #[clap(short = 'o', long = "output")]
    pub output_path: Option<PathBuf>,

    /// Page images, in page order.
    #[clap(required = true)]
    pages: Vec<PathBuf>,
}

/// Process one job start to finish in this process, without a shared store.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_run(ui: Ui, settings: &Settings, opts: &RunOpts) -> Result<()> {
    let services = Services::in_process(settings);
    let control = services.control(settings).await?;
    let worker = services.worker(settings)?;

    let job = Job::new(&opts.owner, opts.pages.clone(), opts.recognition.to_config());
    let page_refs = services.jobs.stage_pages(job.id, &job.page_refs).await?;
    let job = control.submit_job(Job { page_refs, ..job }).await?;

    let bar = ui.job_bar(job.total_pages());
    let mut run = pin!(worker.run(RunMode::UntilIdle, |_| {}));
    loop {
        tokio::select! {
            stats = &mut run => {
                stats?;
                break;
            }
            _ = tokio::time::sleep(settings.poll_interval()) => {
                if let Some(progress) = control.job_status(job.id).await? {
                    bar.update(&progress);
                }
            }
        }
    }

    let job = services
        .jobs
        .load_job(job.id)
        .await?
        .ok_or_else(|| anyhow!("job {} disappeared", job.id))?;
    bar.finish(job.status);
    let results = services.jobs.load_page_results(job.id).await?;
    let mut out = String::new();
    for result in &results {
        out.push_str(&serde_json::to_string(result).context("failed to serialize page result")?);
        out.push('\n');
    }
    match &opts.output_path {
        Some(path) => tokio::fs::write(path, out)
            .await
            .with_context(|| format!("failed to write {:?}", path))?,
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(out.as_bytes()).await?;
            stdout.flush().await?;
        }
    }

    let charged = services
        .jobs
        .load_charges()
        .await?
        .iter()
        .filter(|charge| charge.job_id == job.id)
        .map(|charge| charge.units)
        .sum::<u32>();
    ui.display_message(
        "🧾",
        &format!("Charged {charged} page(s) to {}", job.owner_id),
    );

    if job.status != JobStatus::Completed {
        return Err(anyhow!(
            "job {} ended as {:?} after {} of {} pages",
            job.id,
            job.status,
            results.len(),
            job.total_pages()
        ));
    }
    Ok(())
}
