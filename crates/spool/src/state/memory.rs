use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{DownloadJobState, JobState, LastError, SegmentState, StateStore};
use crate::error::DownloadError;

/// Process-local store, for tests and one-shot runs that need no resume.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    jobs: Mutex<HashMap<String, DownloadJobState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, job_id: &str) -> Result<Option<DownloadJobState>, DownloadError> {
        Ok(self.jobs.lock().get(job_id).cloned())
    }

    async fn list(&self) -> Result<Vec<DownloadJobState>, DownloadError> {
        let mut jobs: Vec<_> = self.jobs.lock().values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn save(&self, state: &DownloadJobState) -> Result<(), DownloadError> {
        self.jobs.lock().insert(state.id.clone(), state.clone());
        Ok(())
    }

    async fn update_segment(
        &self,
        job_id: &str,
        segment: SegmentState,
    ) -> Result<bool, DownloadError> {
        Ok(self
            .jobs
            .lock()
            .get_mut(job_id)
            .is_some_and(|job| job.apply_segment(segment)))
    }

    async fn transition(
        &self,
        job_id: &str,
        state: JobState,
        error: Option<LastError>,
    ) -> Result<Option<DownloadJobState>, DownloadError> {
        let mut jobs = self.jobs.lock();
        let Some(job) = jobs.get_mut(job_id) else {
            return Ok(None);
        };
        Ok(job.apply_transition(state, error).then(|| job.clone()))
    }

    async fn delete(&self, job_id: &str) -> Result<bool, DownloadError> {
        Ok(self.jobs.lock().remove(job_id).is_some())
    }
}
