//! Job scheduler: drives the segments of one job through a bounded pool of
//! concurrent fetches and owns the job's lifecycle in the state store.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use parking_lot::Mutex;
use reqwest::Client;
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::constraints::{ConstraintChecker, DiskSpaceProbe, NoopConstraintChecker, SysinfoDiskProbe};
use super::events::{JobError, JobListener, JobProgress};
use super::fetcher::{HttpSegmentFetcher, SegmentFetcher};
use super::layout::{
    cleanup_files, file_len, map_complete_path, map_partial_path, segment_complete_path,
    segment_partial_path, write_concat_lists,
};
use super::request::{CleanupPolicy, DownloadRequest, DownloadSegment, validate_segments};
use super::retry::RetryPolicy;
use crate::config::EngineConfig;
use crate::error::{DownloadError, ErrorCode};
use crate::hls::DownloadPlan;
use crate::state::{DownloadJobState, JobState, LastError, SegmentState, SegmentStatus, StateStore};

const MIN_PROGRESS_INTERVAL: Duration = Duration::from_millis(10);

/// How a call to [`JobDownloader::start`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl DownloadOutcome {
    fn from_state(state: JobState) -> Self {
        match state {
            JobState::Completed => Self::Completed,
            JobState::Canceled => Self::Cancelled,
            JobState::Paused => Self::Paused,
            JobState::Queued | JobState::Running | JobState::Failed => Self::Failed,
        }
    }

    pub fn job_state(&self) -> JobState {
        match self {
            Self::Completed => JobState::Completed,
            Self::Failed => JobState::Failed,
            Self::Cancelled => JobState::Canceled,
            Self::Paused => JobState::Paused,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum StopRequest {
    Pause,
    Cancel { delete_files: bool },
}

#[derive(Default)]
struct JobControl {
    token: CancellationToken,
    stop: Mutex<Option<StopRequest>>,
}

impl JobControl {
    fn stop(&self, request: StopRequest) {
        *self.stop.lock() = Some(request);
        self.token.cancel();
    }
}

type ActiveJobs = Mutex<HashMap<String, Arc<JobControl>>>;

/// Unregisters a running job when its `start` call ends or is dropped.
struct ActiveGuard<'a> {
    active: &'a ActiveJobs,
    job_id: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.lock().remove(&self.job_id);
    }
}

struct NullListener;

impl JobListener for NullListener {}

/// Runs download jobs. One instance can run many jobs concurrently; each job
/// is limited to `max_parallel` segment fetches in flight.
pub struct JobDownloader {
    config: EngineConfig,
    store: Arc<dyn StateStore>,
    fetcher: Arc<dyn SegmentFetcher>,
    constraints: Arc<dyn ConstraintChecker>,
    disk: Arc<dyn DiskSpaceProbe>,
    listener: Arc<dyn JobListener>,
    active: ActiveJobs,
}

impl JobDownloader {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn StateStore>,
        fetcher: Arc<dyn SegmentFetcher>,
    ) -> Self {
        Self {
            config,
            store,
            fetcher,
            constraints: Arc::new(NoopConstraintChecker),
            disk: Arc::new(SysinfoDiskProbe),
            listener: Arc::new(NullListener),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Downloader backed by [`HttpSegmentFetcher`] on the given client.
    pub fn with_http(client: Client, config: EngineConfig, store: Arc<dyn StateStore>) -> Self {
        let fetcher = Arc::new(HttpSegmentFetcher::new(client, &config));
        Self::new(config, store, fetcher)
    }

    pub fn with_constraint_checker(mut self, checker: Arc<dyn ConstraintChecker>) -> Self {
        self.constraints = checker;
        self
    }

    pub fn with_disk_probe(mut self, probe: Arc<dyn DiskSpaceProbe>) -> Self {
        self.disk = probe;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn JobListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn is_active(&self, job_id: &str) -> bool {
        self.active.lock().contains_key(job_id)
    }

    /// Run a job to a terminal or paused state.
    ///
    /// Segments whose completed file is already on disk are skipped, so
    /// calling this again for a finished job fetches nothing. Failures of the
    /// job itself are reported through the outcome, the persisted state and
    /// the listener; `Err` is returned only when the job could not be run.
    #[instrument(skip_all, fields(job_id = %request.id))]
    pub async fn start(
        &self,
        request: DownloadRequest,
        segments: Vec<DownloadSegment>,
    ) -> Result<DownloadOutcome, DownloadError> {
        let control = Arc::new(JobControl::default());
        {
            let mut active = self.active.lock();
            if active.contains_key(&request.id) {
                return Err(DownloadError::state(format!(
                    "job {} is already running",
                    request.id
                )));
            }
            active.insert(request.id.clone(), control.clone());
        }
        let _guard = ActiveGuard {
            active: &self.active,
            job_id: request.id.clone(),
        };

        info!(
            segments = segments.len(),
            output_dir = %request.output_dir.display(),
            "Starting job"
        );

        if let Err(err) = self.preflight(&request, &segments) {
            return self.reject(&request, &segments, &err).await;
        }

        tokio::fs::create_dir_all(&request.output_dir).await?;
        let state = self.initial_state(&request, &segments).await?;
        self.store.save(&state).await?;
        self.listener.on_progress(&JobProgress::from_state(&state));

        let done: HashSet<&str> = state
            .segments
            .iter()
            .filter(|s| s.is_completed())
            .map(|s| s.file_key.as_str())
            .collect();
        let pending: Vec<&DownloadSegment> = segments
            .iter()
            .filter(|s| !done.contains(s.file_key.as_str()))
            .collect();
        debug!(
            skipped = done.len(),
            pending = pending.len(),
            "Scheduling segments"
        );

        let run = JobRun::new(self, &request, control.token.child_token());
        if !pending.is_empty() {
            run.execute(pending).await;
        }
        self.finish(&request, &segments, &control, &run).await
    }

    /// Stop a job and mark it canceled. In-flight fetches are allowed to
    /// finish; no new attempt starts. Returns false when the job is unknown
    /// or already terminal.
    #[instrument(skip(self, output_dir, cleanup_policy))]
    pub async fn cancel(
        &self,
        job_id: &str,
        output_dir: &Path,
        cleanup_policy: &CleanupPolicy,
    ) -> Result<bool, DownloadError> {
        let control = self.active.lock().get(job_id).cloned();
        if let Some(control) = &control {
            control.stop(StopRequest::Cancel {
                delete_files: cleanup_policy.delete_on_cancel,
            });
        }

        let canceled = self
            .store
            .transition(job_id, JobState::Canceled, None)
            .await?
            .is_some();
        if canceled {
            info!("Job canceled");
        }

        // A running job cleans up after its in-flight fetches have drained.
        if control.is_none() && canceled {
            if cleanup_policy.delete_on_cancel {
                cleanup_files(output_dir, false).await?;
            }
            self.listener.on_complete(job_id, JobState::Canceled);
        }
        Ok(canceled)
    }

    /// Stop a job without deleting anything so it can be resumed later.
    #[instrument(skip(self))]
    pub async fn pause(&self, job_id: &str) -> Result<bool, DownloadError> {
        if let Some(control) = self.active.lock().get(job_id) {
            control.stop(StopRequest::Pause);
        }
        let paused = self
            .store
            .transition(job_id, JobState::Paused, None)
            .await?
            .is_some();
        if paused {
            info!("Job paused");
        }
        Ok(paused)
    }

    /// Restart a persisted job from the plan stored with it.
    #[instrument(skip(self, output_dir))]
    pub async fn resume(
        &self,
        job_id: &str,
        output_dir: &Path,
    ) -> Result<DownloadOutcome, DownloadError> {
        let state = self
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| DownloadError::state(format!("unknown job {job_id}")))?;
        if state.state == JobState::Canceled {
            return Err(DownloadError::state(format!(
                "job {job_id} was canceled and cannot be resumed"
            )));
        }
        let metadata = state.plan_metadata.ok_or_else(|| {
            DownloadError::state(format!("job {job_id} has no stored plan to resume from"))
        })?;
        let plan: DownloadPlan = serde_json::from_str(&metadata)?;
        if plan.id != job_id {
            return Err(DownloadError::state(format!(
                "stored plan belongs to job {}, not {job_id}",
                plan.id
            )));
        }

        let (request, segments) = DownloadRequest::from_plan(&plan, output_dir)?;
        info!(segments = segments.len(), "Resuming job");
        self.start(request, segments).await
    }

    /// Delete the persisted record of a finished job.
    pub async fn remove(&self, job_id: &str) -> Result<bool, DownloadError> {
        if self.is_active(job_id) {
            return Err(DownloadError::state(format!("job {job_id} is still running")));
        }
        match self.store.get(job_id).await? {
            Some(state) if !state.state.is_terminal() => Err(DownloadError::state(format!(
                "job {job_id} is {:?}, only finished jobs can be removed",
                state.state
            ))),
            Some(_) => self.store.delete(job_id).await,
            None => Ok(false),
        }
    }

    fn preflight(
        &self,
        request: &DownloadRequest,
        segments: &[DownloadSegment],
    ) -> Result<(), DownloadError> {
        let verdict = self.constraints.check(&request.constraints, request);
        if !verdict.allowed {
            return Err(DownloadError::Constraints {
                reason: verdict
                    .reason
                    .unwrap_or_else(|| "job constraints are not satisfied".to_string()),
            });
        }

        if segments.is_empty() {
            return Err(DownloadError::validation("job has no segments"));
        }
        validate_segments(segments)?;

        // Budget twice the download for the assembly step.
        let required = request
            .required_bytes
            .map(|bytes| bytes.saturating_mul(2))
            .unwrap_or(self.config.unknown_size_min_free_bytes);
        match self.disk.available_bytes(&request.output_dir) {
            Some(available) if available < required => {
                Err(DownloadError::InsufficientSpace {
                    available,
                    required,
                })
            }
            Some(available) => {
                debug!(available, required, "Disk space check passed");
                Ok(())
            }
            None => {
                warn!(
                    path = %request.output_dir.display(),
                    "Could not determine free disk space, continuing"
                );
                Ok(())
            }
        }
    }

    /// Persist a job that failed before any work was scheduled.
    async fn reject(
        &self,
        request: &DownloadRequest,
        segments: &[DownloadSegment],
        err: &DownloadError,
    ) -> Result<DownloadOutcome, DownloadError> {
        error!(code = %err.code(), error = %err, "Job rejected");
        let last = LastError::from(err);

        let pending = segments
            .iter()
            .map(|s| SegmentState::pending(s.uri.clone(), s.sequence, s.file_key.clone()))
            .collect();
        let mut state =
            DownloadJobState::new(&request.id, &request.playlist_uri, JobState::Failed, pending);
        state.plan_metadata = request.plan_metadata.clone();
        state.last_error = Some(last.clone());
        if let Some(previous) = self.store.get(&request.id).await? {
            state.created_at = previous.created_at;
        }
        self.store.save(&state).await?;

        self.listener
            .on_error(&JobError::from_last_error(&request.id, &last));
        self.listener.on_complete(&request.id, JobState::Failed);
        Ok(DownloadOutcome::Failed)
    }

    /// Segment states for a (re)started job. The files on disk decide what is
    /// complete: a segment counts as done when its completed file and its init
    /// map, if any, exist.
    async fn initial_state(
        &self,
        request: &DownloadRequest,
        segments: &[DownloadSegment],
    ) -> Result<DownloadJobState, DownloadError> {
        let dir = &request.output_dir;
        let previous = self.store.get(&request.id).await?;

        let mut states = Vec::with_capacity(segments.len());
        for segment in segments {
            let pending =
                SegmentState::pending(segment.uri.clone(), segment.sequence, segment.file_key.clone());
            let map_ready = match &segment.map {
                Some(map) => tokio::fs::try_exists(map_complete_path(dir, &map.file_key)).await?,
                None => true,
            };
            let complete = segment_complete_path(dir, &segment.file_key);

            let state = if map_ready && tokio::fs::try_exists(&complete).await? {
                pending.with_status(SegmentStatus::Completed, file_len(&complete).await?)
            } else {
                let was_completed = previous.as_ref().is_some_and(|p| {
                    p.segments
                        .iter()
                        .any(|s| s.file_key == segment.file_key && s.is_completed())
                });
                if was_completed {
                    debug!(
                        file_key = %segment.file_key,
                        "Segment was completed earlier but its files are gone"
                    );
                }
                let partial = if segment.is_encrypted() {
                    0
                } else {
                    file_len(&segment_partial_path(dir, &segment.file_key)).await?
                };
                SegmentState {
                    bytes_downloaded: partial,
                    ..pending
                }
            };
            states.push(state);
        }

        let mut state =
            DownloadJobState::new(&request.id, &request.playlist_uri, JobState::Running, states);
        state.plan_metadata = request.plan_metadata.clone();
        if let Some(previous) = previous {
            state.created_at = previous.created_at;
            state.updated_at = state.updated_at.max(previous.updated_at);
            if state.plan_metadata.is_none() {
                state.plan_metadata = previous.plan_metadata;
            }
        }
        Ok(state)
    }

    async fn publish_progress(&self, job_id: &str) {
        match self.store.get(job_id).await {
            Ok(Some(state)) => self.listener.on_progress(&JobProgress::from_state(&state)),
            Ok(None) => {}
            Err(e) => debug!(error = %e, "Could not read job state for progress"),
        }
    }

    async fn current_outcome(&self, job_id: &str) -> Result<DownloadOutcome, DownloadError> {
        let state = self
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| DownloadError::state(format!("job {job_id} is missing from the state store")))?;
        Ok(DownloadOutcome::from_state(state.state))
    }

    /// Decide the final state once every scheduled segment task has ended.
    async fn finish(
        &self,
        request: &DownloadRequest,
        segments: &[DownloadSegment],
        control: &JobControl,
        run: &JobRun<'_>,
    ) -> Result<DownloadOutcome, DownloadError> {
        let job_id = &request.id;
        let dir = &request.output_dir;

        let stop = *control.stop.lock();
        let outcome = match stop {
            Some(stop) => {
                // The stop request may not have reached the store yet. Whichever
                // transition landed first, this one or a job failure, is final.
                let target = match stop {
                    StopRequest::Pause => JobState::Paused,
                    StopRequest::Cancel { .. } => JobState::Canceled,
                };
                self.store.transition(job_id, target, None).await?;
                let outcome = self.current_outcome(job_id).await?;
                match (outcome, stop) {
                    (DownloadOutcome::Cancelled, StopRequest::Cancel { delete_files: true }) => {
                        cleanup_files(dir, false).await?;
                    }
                    (DownloadOutcome::Failed, _) if request.cleanup_policy.delete_on_failure => {
                        cleanup_files(dir, true).await?;
                    }
                    _ => {}
                }
                outcome
            }
            None => {
                let state = self.store.get(job_id).await?.ok_or_else(|| {
                    DownloadError::state(format!("job {job_id} is missing from the state store"))
                })?;

                if state.state == JobState::Running && state.all_completed() {
                    if self
                        .store
                        .transition(job_id, JobState::Completed, None)
                        .await?
                        .is_some()
                    {
                        info!(bytes = state.bytes_downloaded(), "Job completed");
                        if request.cleanup_policy.delete_on_success {
                            cleanup_files(dir, true).await?;
                        } else {
                            cleanup_files(dir, false).await?;
                            write_concat_lists(dir, segments).await?;
                        }
                        DownloadOutcome::Completed
                    } else {
                        self.current_outcome(job_id).await?
                    }
                } else {
                    if state.state == JobState::Running {
                        let cause = run.last_error().unwrap_or_else(|| {
                            LastError::new(
                                ErrorCode::Unexpected,
                                "job ended with incomplete segments",
                            )
                        });
                        run.fail_job(cause).await;
                    }
                    let outcome = self.current_outcome(job_id).await?;
                    if outcome == DownloadOutcome::Failed && request.cleanup_policy.delete_on_failure {
                        cleanup_files(dir, true).await?;
                    }
                    outcome
                }
            }
        };

        self.publish_progress(job_id).await;
        info!(outcome = ?outcome, "Job finished");
        self.listener.on_complete(job_id, outcome.job_state());
        Ok(outcome)
    }
}

/// Shared context of one `start` call.
struct JobRun<'a> {
    downloader: &'a JobDownloader,
    request: &'a DownloadRequest,
    /// Cancelled by a stop request or by the failure budget
    halt: CancellationToken,
    permits: Semaphore,
    retry: RetryPolicy,
    maps: Mutex<HashSet<String>>,
    failures: AtomicU32,
    failed: AtomicBool,
    last_error: Mutex<Option<LastError>>,
}

impl<'a> JobRun<'a> {
    fn new(downloader: &'a JobDownloader, request: &'a DownloadRequest, halt: CancellationToken) -> Self {
        Self {
            downloader,
            request,
            halt,
            permits: Semaphore::new(downloader.config.max_parallel.max(1)),
            retry: RetryPolicy::new(&downloader.config.retry),
            maps: Mutex::new(HashSet::new()),
            failures: AtomicU32::new(0),
            failed: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    fn job_id(&self) -> &str {
        &self.request.id
    }

    fn last_error(&self) -> Option<LastError> {
        self.last_error.lock().clone()
    }

    async fn execute(&self, pending: Vec<&DownloadSegment>) {
        let mut tasks: FuturesUnordered<_> = pending
            .into_iter()
            .map(|segment| self.download_segment(segment))
            .collect();

        let period = self.downloader.config.progress_interval.max(MIN_PROGRESS_INTERVAL);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                next = tasks.next() => match next {
                    Some(Ok(())) => {}
                    Some(Err(err)) => self.fail_job(LastError::from(&err)).await,
                    None => break,
                },
                _ = ticker.tick() => self.downloader.publish_progress(self.job_id()).await,
            }
        }
    }

    async fn update(
        &self,
        segment: &DownloadSegment,
        status: SegmentStatus,
        bytes: u64,
    ) -> Result<(), DownloadError> {
        let state = SegmentState::pending(segment.uri.clone(), segment.sequence, segment.file_key.clone())
            .with_status(status, bytes);
        self.downloader
            .store
            .update_segment(self.job_id(), state)
            .await?;
        Ok(())
    }

    async fn download_segment(&self, segment: &DownloadSegment) -> Result<(), DownloadError> {
        let _permit = tokio::select! {
            permit = self.permits.acquire() => permit
                .map_err(|_| DownloadError::internal("segment permits closed"))?,
            _ = self.halt.cancelled() => return Ok(()),
        };
        if self.halt.is_cancelled() {
            return Ok(());
        }

        let result = match self.ensure_map(segment).await {
            Ok(()) => self.fetch_segment(segment).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(bytes) => {
                debug!(
                    job_id = self.job_id(),
                    sequence = segment.sequence,
                    file_key = %segment.file_key,
                    bytes,
                    "Segment completed"
                );
                self.update(segment, SegmentStatus::Completed, bytes).await?;
                self.downloader.publish_progress(self.job_id()).await;
                Ok(())
            }
            Err(DownloadError::Cancelled) => {
                let partial = if segment.is_encrypted() {
                    0
                } else {
                    file_len(&segment_partial_path(&self.request.output_dir, &segment.file_key))
                        .await?
                };
                self.update(segment, SegmentStatus::Pending, partial).await
            }
            Err(err) => self.segment_failed(segment, err).await,
        }
    }

    /// Download the segment's init map unless another task already has. A
    /// failed download releases the map so a later segment can try again.
    async fn ensure_map(&self, segment: &DownloadSegment) -> Result<(), DownloadError> {
        let Some(map) = &segment.map else {
            return Ok(());
        };
        if !self.maps.lock().insert(map.file_key.clone()) {
            return Ok(());
        }

        let dir = &self.request.output_dir;
        let complete = map_complete_path(dir, &map.file_key);
        if tokio::fs::try_exists(&complete).await? {
            return Ok(());
        }

        let map_segment = DownloadSegment {
            track: segment.track,
            uri: map.uri.clone(),
            duration: 0.0,
            sequence: segment.sequence,
            file_key: map.file_key.clone(),
            byte_range: map.byte_range,
            key: None,
            map: None,
        };
        debug!(job_id = self.job_id(), file_key = %map.file_key, "Fetching init map");
        let partial = map_partial_path(dir, &map.file_key);
        match self
            .fetch_with_retry(&map_segment, &partial, &complete, false)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                self.maps.lock().remove(&map.file_key);
                Err(err)
            }
        }
    }

    async fn fetch_segment(&self, segment: &DownloadSegment) -> Result<u64, DownloadError> {
        let dir = &self.request.output_dir;
        let complete = segment_complete_path(dir, &segment.file_key);
        if tokio::fs::try_exists(&complete).await? {
            return file_len(&complete).await;
        }

        let partial = segment_partial_path(dir, &segment.file_key);
        if !segment.is_encrypted()
            && let Some(range) = &segment.byte_range
        {
            let existing = file_len(&partial).await?;
            if existing >= range.length {
                debug!(
                    job_id = self.job_id(),
                    sequence = segment.sequence,
                    existing,
                    "Partial file already covers the byte range"
                );
                if existing > range.length {
                    let file = tokio::fs::OpenOptions::new()
                        .write(true)
                        .open(&partial)
                        .await?;
                    file.set_len(range.length).await?;
                }
                tokio::fs::rename(&partial, &complete).await?;
                return Ok(range.length);
            }
        }

        self.fetch_with_retry(segment, &partial, &complete, true)
            .await
    }

    /// Attempt loop for one file. Cancellation is only observed between
    /// attempts; an attempt in flight runs to completion.
    async fn fetch_with_retry(
        &self,
        item: &DownloadSegment,
        partial: &Path,
        complete: &Path,
        tracked: bool,
    ) -> Result<u64, DownloadError> {
        let mut attempt: u32 = 0;
        loop {
            if self.halt.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            attempt += 1;

            let resume = if item.is_encrypted() {
                0
            } else {
                file_len(partial).await?
            };
            if tracked {
                self.update(item, SegmentStatus::Downloading, resume).await?;
            }

            match self
                .downloader
                .fetcher
                .fetch(item, partial, &self.request.headers, resume)
                .await
            {
                Ok(len) => {
                    tokio::fs::rename(partial, complete).await?;
                    return Ok(len);
                }
                Err(err) if err.is_retryable() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.next_delay(attempt);
                    warn!(
                        job_id = self.job_id(),
                        sequence = item.sequence,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Attempt failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.halt.cancelled() => return Err(DownloadError::Cancelled),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn segment_failed(
        &self,
        segment: &DownloadSegment,
        err: DownloadError,
    ) -> Result<(), DownloadError> {
        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(
            job_id = self.job_id(),
            sequence = segment.sequence,
            failures,
            code = %err.code(),
            error = %err,
            "Segment failed"
        );
        let last = LastError::from(&err);
        *self.last_error.lock() = Some(last.clone());
        self.update(segment, SegmentStatus::Failed, 0).await?;

        let config = &self.downloader.config;
        if config.strict_failures || failures >= config.failure_budget.max(1) {
            self.fail_job(last).await;
        }
        Ok(())
    }

    /// Flip the job to FAILED and stop scheduling. Only the first call has
    /// any effect, so exactly one error event is emitted per run.
    async fn fail_job(&self, cause: LastError) {
        self.halt.cancel();
        if self.failed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.last_error.lock() = Some(cause.clone());
        error!(
            job_id = self.job_id(),
            code = %cause.code,
            error = %cause.message,
            "Job failed"
        );

        let downloader = self.downloader;
        match downloader
            .store
            .transition(self.job_id(), JobState::Failed, Some(cause.clone()))
            .await
        {
            Ok(Some(_)) => {}
            // Paused or canceled in the meantime.
            Ok(None) => return,
            Err(e) => error!(job_id = self.job_id(), error = %e, "Failed to persist job failure"),
        }
        downloader
            .listener
            .on_error(&JobError::from_last_error(self.job_id(), &cause));
    }
}
