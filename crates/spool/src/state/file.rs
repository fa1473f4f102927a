use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{DownloadJobState, JobState, LastError, SegmentState, StateStore};
use crate::error::DownloadError;

/// JSON file per job under `<base>/download_state/<job id>.json`.
///
/// Snapshots are written to a temporary sibling and renamed into place.
/// Read-modify-write operations are serialized by a store-wide lock.
pub struct FileStateStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStateStore {
    pub const DIR_NAME: &'static str = "download_state";

    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: base_dir.as_ref().join(Self::DIR_NAME),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, job_id: &str) -> Result<PathBuf, DownloadError> {
        let unsafe_id = job_id.is_empty()
            || job_id.starts_with('.')
            || job_id.contains(['/', '\\', '\0'])
            || job_id.contains("..");
        if unsafe_id {
            return Err(DownloadError::validation(format!(
                "job id `{job_id}` is not usable as a file name"
            )));
        }
        Ok(self.dir.join(format!("{job_id}.json")))
    }

    /// Read a record, discarding it when it cannot be parsed.
    async fn read(&self, path: &Path) -> Result<Option<DownloadJobState>, DownloadError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<DownloadJobState>(&bytes) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding unreadable job state");
                if let Err(e) = tokio::fs::remove_file(path).await
                    && e.kind() != ErrorKind::NotFound
                {
                    warn!(path = %path.display(), error = %e, "Failed to remove unreadable job state");
                }
                Ok(None)
            }
        }
    }

    async fn write(&self, state: &DownloadJobState) -> Result<(), DownloadError> {
        let path = self.path_for(&state.id)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let json = serde_json::to_vec(state)?;
        let temp_path = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(&json).await?;
        // Contents must be on disk before the rename makes them visible.
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp_path, &path).await?;
        debug!(job_id = %state.id, state = ?state.state, "Job state persisted");
        Ok(())
    }

    async fn modify<F>(&self, job_id: &str, f: F) -> Result<Option<DownloadJobState>, DownloadError>
    where
        F: FnOnce(&mut DownloadJobState) -> bool + Send,
    {
        let path = self.path_for(job_id)?;
        let _guard = self.write_lock.lock().await;
        let Some(mut state) = self.read(&path).await? else {
            return Ok(None);
        };
        if !f(&mut state) {
            return Ok(None);
        }
        self.write(&state).await?;
        Ok(Some(state))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, job_id: &str) -> Result<Option<DownloadJobState>, DownloadError> {
        let path = self.path_for(job_id)?;
        self.read(&path).await
    }

    async fn list(&self) -> Result<Vec<DownloadJobState>, DownloadError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut jobs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            if let Some(state) = self.read(&path).await? {
                jobs.push(state);
            }
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn save(&self, state: &DownloadJobState) -> Result<(), DownloadError> {
        let _guard = self.write_lock.lock().await;
        self.write(state).await
    }

    async fn update_segment(
        &self,
        job_id: &str,
        segment: SegmentState,
    ) -> Result<bool, DownloadError> {
        Ok(self
            .modify(job_id, move |state| state.apply_segment(segment))
            .await?
            .is_some())
    }

    async fn transition(
        &self,
        job_id: &str,
        state: JobState,
        error: Option<LastError>,
    ) -> Result<Option<DownloadJobState>, DownloadError> {
        self.modify(job_id, move |job| job.apply_transition(state, error))
            .await
    }

    async fn delete(&self, job_id: &str) -> Result<bool, DownloadError> {
        let path = self.path_for(job_id)?;
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
