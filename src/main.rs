use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{config::Settings, prelude::*, ui::Ui};

mod async_utils;
mod cmd;
mod config;
mod error;
mod geometry;
mod image_codec;
mod jobs;
mod orchestrator;
mod prelude;
mod queues;
mod recognition;
mod retry;
mod store;
mod ui;

/// Recognize text in multi-page documents, one page at a time.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  Every option above can also be set through the environment variable
  shown next to it, for example OCR_REDIS_URL or OCR_DETECTOR_URL.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(flatten)]
    settings: Settings,

    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Process queued tasks from the shared queue.
    Worker(cmd::worker::WorkerOpts),
    /// Submit a job to the shared queue and print its ID.
    Submit(cmd::submit::SubmitOpts),
    /// Cancel a job before its next page.
    Cancel(cmd::cancel::CancelOpts),
    /// Show a job's progress.
    Status(cmd::status::StatusOpts),
    /// Process a job in this process and print its page results.
    Run(cmd::run::RunOpts),
    /// Recognize one region of an archived page again.
    Rerun(cmd::rerun::RerunOpts),
    /// Recognize a single page outside of any job.
    Recognize(cmd::recognize::RecognizeOpts),
}

impl Cmd {
    /// Are we using stdout for bulk output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Run(opts) => opts.output_path.is_none(),
            _ => false,
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.stderr_writer())
        .with_filter(env_filter);
    tracing_subscriber::registry().with(subscriber).init();

    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    let settings = &opts.settings;
    match &opts.subcmd {
        Cmd::Worker(opts) => cmd::worker::cmd_worker(ui, settings, opts).await,
        Cmd::Submit(opts) => cmd::submit::cmd_submit(settings, opts).await,
        Cmd::Cancel(opts) => cmd::cancel::cmd_cancel(ui, settings, opts).await,
        Cmd::Status(opts) => cmd::status::cmd_status(settings, opts).await,
        Cmd::Run(opts) => cmd::run::cmd_run(ui, settings, opts).await,
        Cmd::Rerun(opts) => cmd::rerun::cmd_rerun(ui, settings, opts).await,
        Cmd::Recognize(opts) => cmd::recognize::cmd_recognize(ui, settings, opts).await,
    }
}
