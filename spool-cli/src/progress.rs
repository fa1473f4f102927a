use std::time::Duration;

use indicatif::{HumanBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};
use spool_engine::{JobError, JobListener, JobProgress, JobState};

const TEMPLATE: &str =
    "{spinner:.green} {prefix} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} segments {msg}";

/// Renders job events as a terminal progress bar.
pub struct ProgressListener {
    bar: ProgressBar,
}

impl ProgressListener {
    pub fn new(job_id: &str, hidden: bool) -> Self {
        let bar = if hidden {
            ProgressBar::with_draw_target(None, ProgressDrawTarget::hidden())
        } else {
            ProgressBar::new(0)
        };
        let style = ProgressStyle::with_template(TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        bar.set_style(style);
        bar.set_prefix(job_id.to_string());
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }
}

fn describe_bytes(progress: &JobProgress) -> String {
    match progress.total_bytes {
        Some(total) if total >= progress.bytes_downloaded => format!(
            "{} / {}",
            HumanBytes(progress.bytes_downloaded),
            HumanBytes(total)
        ),
        _ => HumanBytes(progress.bytes_downloaded).to_string(),
    }
}

impl JobListener for ProgressListener {
    fn on_progress(&self, progress: &JobProgress) {
        self.bar.set_length(progress.total_segments as u64);
        self.bar.set_position(progress.segments_completed as u64);
        self.bar.set_message(describe_bytes(progress));
    }

    fn on_error(&self, error: &JobError) {
        let detail = error
            .detail
            .as_deref()
            .map(|d| format!(" ({d})"))
            .unwrap_or_default();
        self.bar
            .println(format!("error [{}]: {}{detail}", error.code, error.message));
    }

    fn on_complete(&self, _job_id: &str, state: JobState) {
        let label = match state {
            JobState::Completed => "done",
            JobState::Paused => "paused",
            JobState::Canceled => "canceled",
            JobState::Failed => "failed",
            JobState::Queued | JobState::Running => "stopped",
        };
        self.bar.finish_with_message(label);
    }
}
