//! Terminal UI: a page bar for jobs we run ourselves, spinners for the
//! worker, and a stderr writer that keeps log lines from tearing them.
//!
//! The bar plumbing is adapted from `substudy` by Eric Kidd, which is
//! licensed under Apache-2.0 OR MIT. Used with permission.

use std::{borrow::Cow, io, sync::Arc, time::Duration};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressFinish, ProgressStyle};

use crate::{jobs::JobStatus, store::Progress};

/// Application UI state.
#[derive(Clone)]
pub struct Ui {
    multi_progress: Arc<MultiProgress>,
}

impl Ui {
    /// Create a new UI. Bars draw to stderr.
    pub fn init() -> Ui {
        Ui {
            multi_progress: Arc::new(MultiProgress::new()),
        }
    }

    /// Hide all bars, for when results go to stdout.
    pub fn hide_progress_bars(&self) {
        self.multi_progress
            .set_draw_target(ProgressDrawTarget::hidden());
    }

    /// A writer for `tracing` that suspends the bars around each write.
    pub fn stderr_writer(&self) -> SafeStderrWriter {
        SafeStderrWriter { ui: self.clone() }
    }

    /// A bar that follows one job's pages.
    pub fn job_bar(&self, total_pages: usize) -> JobBar {
        let bar = ProgressBar::new(total_pages as u64).with_style(job_bar_style());
        let bar = self.multi_progress.add(bar);
        bar.set_prefix("📄");
        bar.set_message(Progress::new(JobStatus::Queued { total_pages }).message());
        bar.enable_steady_tick(Duration::from_millis(250));
        JobBar { bar, total_pages }
    }

    /// A spinner that ticks once per finished task.
    pub fn task_spinner(&self, activity: Activity) -> ProgressBar {
        let spinner = ProgressBar::new_spinner().with_style(spinner_style());
        let spinner = self.multi_progress.add(spinner);
        spinner.set_prefix(activity.emoji());
        spinner.set_message(activity.running());
        spinner.enable_steady_tick(Duration::from_millis(250));
        spinner.with_finish(ProgressFinish::WithMessage(Cow::Borrowed(activity.done())))
    }

    /// Print a line to stderr without tearing any bars.
    pub fn display_message(&self, emoji: &str, msg: &str) {
        self.multi_progress.suspend(|| eprintln!("{emoji} {msg}"));
    }
}

/// What a spinner is waiting on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activity {
    /// A long-running worker polling the shared queue.
    Serving,
    /// Ad-hoc tasks run in this process before collecting their result.
    RecognizingLocally,
}

impl Activity {
    fn emoji(self) -> &'static str {
        match self {
            Activity::Serving => "⚙️",
            Activity::RecognizingLocally => "🔎",
        }
    }

    fn running(self) -> &'static str {
        match self {
            Activity::Serving => "Waiting for tasks",
            Activity::RecognizingLocally => "Recognizing",
        }
    }

    fn done(self) -> &'static str {
        match self {
            Activity::Serving => "Worker stopped",
            Activity::RecognizingLocally => "Recognized",
        }
    }
}

/// A page bar driven by a job's published [`Progress`].
pub struct JobBar {
    bar: ProgressBar,
    total_pages: usize,
}

impl JobBar {
    /// Show `progress`. Fully processed pages fill the bar, and the message
    /// says which page and region we're on.
    pub fn update(&self, progress: &Progress) {
        if let Some(done) = pages_done(progress.status, self.total_pages) {
            self.bar.set_position(done as u64);
        }
        self.bar.set_message(progress.message());
    }

    /// Show the job's final state and stop the bar.
    pub fn finish(&self, status: JobStatus) {
        self.update(&Progress::new(status));
        self.bar.abandon();
    }
}

/// Pages that are completely processed at `status`, if it says.
fn pages_done(status: JobStatus, total_pages: usize) -> Option<usize> {
    match status {
        JobStatus::Queued { .. } => Some(0),
        JobStatus::Processing { current_page, .. } => Some(current_page.saturating_sub(1)),
        JobStatus::Completed => Some(total_pages),
        JobStatus::Errored | JobStatus::Cancelled => None,
    }
}

fn job_bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("  {prefix:3}{pos:>4}/{len:4} {wide_bar:.cyan/blue} {elapsed_precise}\n     {msg}")
        .expect("bad progress bar template")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner} {prefix:3}{msg} ({pos} tasks)")
        .expect("bad progress bar template")
}

/// Writes to stderr, hiding and re-showing the bars around each write.
#[derive(Clone)]
pub struct SafeStderrWriter {
    ui: Ui,
}

impl io::Write for SafeStderrWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ui.multi_progress.suspend(|| io::stderr().write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ui.multi_progress.suspend(|| io::stderr().flush())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.ui.multi_progress.suspend(|| io::stderr().write_all(buf))
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SafeStderrWriter {
    type Writer = SafeStderrWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hidden_ui() -> Ui {
        let ui = Ui::init();
        ui.hide_progress_bars();
        ui
    }

    #[test]
    fn test_job_bar_follows_progress() {
        let bar = hidden_ui().job_bar(3);
        assert_eq!(bar.bar.position(), 0);
        assert_eq!(bar.bar.message(), "3 Pages parsed. Queued for processing...");

        let status = JobStatus::Processing {
            current_page: 2,
            total_pages: 3,
        };
        bar.update(&Progress::regions(status, 4, 9));
        assert_eq!(bar.bar.position(), 1);
        assert_eq!(bar.bar.message(), "Processing page 2/3, region 4/9.");

        bar.finish(JobStatus::Completed);
        assert_eq!(bar.bar.position(), 3);
        assert_eq!(bar.bar.message(), "Completed.");
    }

    #[test]
    fn test_failed_jobs_keep_their_position() {
        let bar = hidden_ui().job_bar(5);
        let third = JobStatus::Processing {
            current_page: 3,
            total_pages: 5,
        };
        bar.update(&Progress::page_started(third));
        assert_eq!(bar.bar.position(), 2);

        bar.finish(JobStatus::Errored);
        assert_eq!(bar.bar.position(), 2);
        assert_eq!(bar.bar.message(), "Errored.");
    }
}
