use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{DownloadError, ErrorCode};
use crate::state::{DownloadJobState, JobState, LastError};

/// Aggregate progress of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub job_id: String,
    pub state: JobState,
    pub bytes_downloaded: u64,
    /// `None` while no segment size is known
    pub total_bytes: Option<u64>,
    pub segments_completed: usize,
    pub total_segments: usize,
}

impl JobProgress {
    pub fn from_state(state: &DownloadJobState) -> Self {
        Self {
            job_id: state.id.clone(),
            state: state.state,
            bytes_downloaded: state.bytes_downloaded(),
            total_bytes: state.total_bytes(),
            segments_completed: state.completed_segments(),
            total_segments: state.segments.len(),
        }
    }

    pub fn fraction(&self) -> Option<f64> {
        (self.total_segments > 0)
            .then(|| self.segments_completed as f64 / self.total_segments as f64)
    }
}

/// Terminal cause of a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobError {
    pub job_id: String,
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl JobError {
    pub fn new(job_id: impl Into<String>, err: &DownloadError) -> Self {
        Self {
            job_id: job_id.into(),
            code: err.code(),
            message: err.to_string(),
            detail: None,
        }
    }

    pub fn from_last_error(job_id: impl Into<String>, last: &LastError) -> Self {
        Self {
            job_id: job_id.into(),
            code: last.code,
            message: last.message.clone(),
            detail: last.detail.clone(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Progress(JobProgress),
    Error(JobError),
    Completed { job_id: String, state: JobState },
}

/// Receives job events. Called from the job's own tasks, so implementations
/// should return quickly.
pub trait JobListener: Send + Sync {
    fn on_progress(&self, _progress: &JobProgress) {}

    fn on_error(&self, _error: &JobError) {}

    /// Called once per `start` with the job's final state.
    fn on_complete(&self, _job_id: &str, _state: JobState) {}
}

/// Forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<JobEvent>,
}

impl ChannelListener {
    pub fn new(tx: mpsc::UnboundedSender<JobEvent>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    fn send(&self, event: JobEvent) {
        if self.tx.send(event).is_err() {
            trace!("Job event receiver dropped");
        }
    }
}

impl JobListener for ChannelListener {
    fn on_progress(&self, progress: &JobProgress) {
        self.send(JobEvent::Progress(progress.clone()));
    }

    fn on_error(&self, error: &JobError) {
        self.send(JobEvent::Error(error.clone()));
    }

    fn on_complete(&self, job_id: &str, state: JobState) {
        self.send(JobEvent::Completed {
            job_id: job_id.to_string(),
            state,
        });
    }
}
