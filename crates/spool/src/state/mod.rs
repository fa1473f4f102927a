//! Durable job and segment state.
//!
//! Every mutation of a job's persisted record goes through a [`StateStore`].
//! Stores apply segment updates and job transitions as a single
//! read-modify-write per job, so concurrent segment tasks never lose each
//! other's updates.

mod file;
mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{DownloadError, ErrorCode};

pub use file::FileStateStore;
pub use memory::MemoryStateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Whether a job-level transition from `self` to `next` is permitted.
    ///
    /// Terminal states are sticky and a paused job can only be canceled.
    /// Restarting such a job goes through a fresh `save` by the downloader.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match self {
            s if s.is_terminal() => *s == next,
            Self::Paused => matches!(next, Self::Paused | Self::Canceled),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentState {
    pub uri: String,
    pub sequence: u64,
    pub file_key: String,
    pub status: SegmentStatus,
    pub bytes_downloaded: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
}

impl SegmentState {
    pub fn pending(uri: impl Into<String>, sequence: u64, file_key: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            sequence,
            file_key: file_key.into(),
            status: SegmentStatus::Pending,
            bytes_downloaded: 0,
            total_bytes: None,
        }
    }

    pub fn with_status(mut self, status: SegmentStatus, bytes: u64) -> Self {
        self.status = status;
        self.bytes_downloaded = bytes;
        if status == SegmentStatus::Completed {
            self.total_bytes = Some(bytes);
        }
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == SegmentStatus::Completed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl LastError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl From<&DownloadError> for LastError {
    fn from(err: &DownloadError) -> Self {
        let last = Self::new(err.code(), err.to_string());
        match err {
            DownloadError::HttpStatus { status, url, .. } => {
                last.with_detail(format!("HTTP {} from {url}", status.as_u16()))
            }
            DownloadError::Io { source } => last.with_detail(source.kind().to_string()),
            _ => last,
        }
    }
}

/// Persisted record of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadJobState {
    pub id: String,
    pub playlist_uri: String,
    /// Opaque blob, the serialized plan the job was started from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_metadata: Option<String>,
    pub state: JobState,
    pub segments: Vec<SegmentState>,
    /// Milliseconds since the Unix epoch
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl DownloadJobState {
    pub fn new(
        id: impl Into<String>,
        playlist_uri: impl Into<String>,
        state: JobState,
        segments: Vec<SegmentState>,
    ) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            playlist_uri: playlist_uri.into(),
            plan_metadata: None,
            state,
            segments,
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    pub fn touch(&mut self) {
        // Keep timestamps monotonic even if the clock steps backwards.
        self.updated_at = now_millis().max(self.updated_at);
    }

    /// Replace the segment with the same file key. A completed segment is
    /// never moved back to an earlier status. Returns whether anything changed.
    pub fn apply_segment(&mut self, update: SegmentState) -> bool {
        let Some(slot) = self
            .segments
            .iter_mut()
            .find(|s| s.file_key == update.file_key)
        else {
            return false;
        };
        if slot.is_completed() && !update.is_completed() {
            return false;
        }
        *slot = update;
        self.touch();
        true
    }

    /// Move the job to `next` when permitted. Returns whether it moved.
    pub fn apply_transition(&mut self, next: JobState, error: Option<LastError>) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        if error.is_some() {
            self.last_error = error;
        }
        self.touch();
        true
    }

    pub fn completed_segments(&self) -> usize {
        self.segments.iter().filter(|s| s.is_completed()).count()
    }

    pub fn all_completed(&self) -> bool {
        self.segments.iter().all(SegmentState::is_completed)
    }

    pub fn any_failed(&self) -> bool {
        self.segments
            .iter()
            .any(|s| s.status == SegmentStatus::Failed)
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.segments.iter().map(|s| s.bytes_downloaded).sum()
    }

    /// Sum of known segment sizes, `None` when no size is known yet.
    pub fn total_bytes(&self) -> Option<u64> {
        self.segments
            .iter()
            .filter_map(|s| s.total_bytes)
            .fold(None, |acc, n| Some(acc.unwrap_or(0) + n))
    }
}

/// Durable mapping from job id to [`DownloadJobState`].
///
/// `save` replaces a snapshot atomically: a concurrent `get` observes either
/// the old or the new record. `update_segment` and `transition` are atomic
/// read-modify-write operations on a single job.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, job_id: &str) -> Result<Option<DownloadJobState>, DownloadError>;

    /// All readable jobs. Unreadable records are discarded, not reported.
    async fn list(&self) -> Result<Vec<DownloadJobState>, DownloadError>;

    async fn save(&self, state: &DownloadJobState) -> Result<(), DownloadError>;

    /// Replace one segment by file key. Returns false if the job or segment
    /// does not exist or the update would regress a completed segment.
    async fn update_segment(
        &self,
        job_id: &str,
        segment: SegmentState,
    ) -> Result<bool, DownloadError>;

    /// Change the job-level state, recording `error` when given. Returns the
    /// updated snapshot, or `None` when the job is missing or the transition
    /// is not permitted.
    async fn transition(
        &self,
        job_id: &str,
        state: JobState,
        error: Option<LastError>,
    ) -> Result<Option<DownloadJobState>, DownloadError>;

    async fn delete(&self, job_id: &str) -> Result<bool, DownloadError>;
}
