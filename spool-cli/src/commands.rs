use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use indicatif::HumanBytes;
use reqwest::Client;
use spool_engine::download::cleanup_files;
use spool_engine::hls::CookieInput;
use spool_engine::{
    CleanupPolicy, DownloadError, DownloadOutcome, DownloadPlan, DownloadRequest,
    DownloaderConfig, EngineConfig, FileStateStore, HttpPlaylistFetcher, JobDownloader,
    PlanBuilder, PlanOptions, PlanRequest, ProxyAuth, ProxyConfig, RetryConfig, StateStore,
    create_client,
};
use tracing::{info, warn};

use crate::cli::{EngineArgs, HttpArgs, SourceArgs};
use crate::error::{AppError, Result};
use crate::progress::ProgressListener;
use crate::utils::parse_headers;

pub struct CommandExecutor {
    client: Client,
    store: Arc<FileStateStore>,
    hide_progress: bool,
}

impl CommandExecutor {
    pub fn new(http: &HttpArgs, state_dir: &Path, hide_progress: bool) -> Result<Self> {
        let client = create_client(&downloader_config(http))?;
        Ok(Self {
            client,
            store: Arc::new(FileStateStore::new(state_dir)),
            hide_progress,
        })
    }

    pub async fn plan(&self, source: &SourceArgs) -> Result<()> {
        let request = plan_request(&uuid::Uuid::new_v4().to_string(), source)?;
        let plan = self.build_plan(&request, source).await?;
        println!("{}", serde_json::to_string_pretty(&plan)?);
        Ok(())
    }

    pub async fn download(
        &self,
        source: &SourceArgs,
        engine: &EngineArgs,
        output_dir: &Path,
        id: Option<String>,
        cleanup_policy: CleanupPolicy,
    ) -> Result<()> {
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        validate_job_id(&id)?;

        let mut request = plan_request(&id, source)?;
        request.cleanup_policy = Some(cleanup_policy);
        let plan = self.build_plan(&request, source).await?;
        info!(job_id = %id, segments = plan.segment_count(), "Plan ready");

        let dir = job_dir(output_dir, &id);
        let (download, segments) = DownloadRequest::from_plan(&plan, &dir)?;
        let downloader = self.downloader(&id, engine);
        let runner = downloader.clone();
        let outcome = drive(&downloader, &id, async move {
            runner.start(download, segments).await
        })
        .await?;
        report(&id, &dir, outcome)
    }

    pub async fn resume(&self, id: &str, engine: &EngineArgs, output_dir: &Path) -> Result<()> {
        validate_job_id(id)?;
        if self.store.get(id).await?.is_none() {
            return Err(AppError::UnknownJob(id.to_string()));
        }

        let dir = job_dir(output_dir, id);
        let downloader = self.downloader(id, engine);
        let runner = downloader.clone();
        let (job_id, job_dir) = (id.to_string(), dir.clone());
        let outcome = drive(&downloader, id, async move {
            runner.resume(&job_id, &job_dir).await
        })
        .await?;
        report(id, &dir, outcome)
    }

    pub async fn list(&self) -> Result<()> {
        let jobs = self.store.list().await?;
        if jobs.is_empty() {
            println!("No jobs");
            return Ok(());
        }
        println!(
            "{:<38} {:<10} {:>11} {:>12}  UPDATED",
            "ID", "STATE", "SEGMENTS", "BYTES"
        );
        for job in jobs {
            let updated = chrono::DateTime::from_timestamp_millis(job.updated_at)
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:<38} {:<10} {:>11} {:>12}  {updated}",
                job.id,
                format!("{:?}", job.state).to_uppercase(),
                format!("{}/{}", job.completed_segments(), job.segments.len()),
                HumanBytes(job.bytes_downloaded()).to_string(),
            );
            if let Some(err) = &job.last_error {
                println!("    last error [{}]: {}", err.code, err.message);
            }
        }
        Ok(())
    }

    pub async fn clean(&self, id: &str, output_dir: &Path, all: bool) -> Result<()> {
        validate_job_id(id)?;
        let state = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| AppError::UnknownJob(id.to_string()))?;

        let dir = job_dir(output_dir, id);
        let downloader = JobDownloader::with_http(
            self.client.clone(),
            EngineConfig::default(),
            self.store.clone(),
        );
        if !state.state.is_terminal() {
            let policy = CleanupPolicy {
                delete_on_cancel: all,
                ..CleanupPolicy::default()
            };
            downloader.cancel(id, &dir, &policy).await?;
        }

        let removed = cleanup_files(&dir, all).await?;
        downloader.remove(id).await?;
        if all && let Err(e) = tokio::fs::remove_dir(&dir).await {
            warn!(dir = %dir.display(), error = %e, "Output directory not removed");
        }
        println!("Removed job {id} ({removed} files deleted)");
        Ok(())
    }

    async fn build_plan(&self, request: &PlanRequest, source: &SourceArgs) -> Result<DownloadPlan> {
        let builder = PlanBuilder::new(Arc::new(HttpPlaylistFetcher::new(self.client.clone())))
            .with_options(plan_options(source));
        Ok(builder.build(request).await?)
    }

    fn downloader(&self, id: &str, engine: &EngineArgs) -> Arc<JobDownloader> {
        let listener = ProgressListener::new(id, self.hide_progress);
        Arc::new(
            JobDownloader::with_http(self.client.clone(), engine_config(engine), self.store.clone())
                .with_listener(Arc::new(listener)),
        )
    }
}

/// Run a job to its end. Ctrl-C pauses the job and waits for in-flight
/// fetches to drain so it can be resumed later.
async fn drive<F>(downloader: &JobDownloader, job_id: &str, job: F) -> Result<DownloadOutcome>
where
    F: Future<Output = std::result::Result<DownloadOutcome, DownloadError>> + Send + 'static,
{
    let mut task = tokio::spawn(job);
    let joined = tokio::select! {
        joined = &mut task => joined,
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => {
                    warn!(job_id, "Interrupted, pausing job");
                    downloader.pause(job_id).await?;
                }
                Err(e) => warn!(error = %e, "Could not listen for Ctrl-C"),
            }
            task.await
        }
    };
    Ok(joined??)
}

fn report(id: &str, dir: &Path, outcome: DownloadOutcome) -> Result<()> {
    match outcome {
        DownloadOutcome::Completed => {
            println!("Job {id} completed, files in {}", dir.display());
            Ok(())
        }
        DownloadOutcome::Paused => {
            println!("Job {id} paused, continue with `spool resume {id}`");
            Ok(())
        }
        DownloadOutcome::Failed | DownloadOutcome::Cancelled => Err(AppError::JobUnfinished {
            id: id.to_string(),
            state: outcome.job_state(),
        }),
    }
}

fn validate_job_id(id: &str) -> Result<()> {
    if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\', '\0']) {
        return Err(AppError::InvalidInput(format!("Invalid job id: {id:?}")));
    }
    Ok(())
}

fn job_dir(output_dir: &Path, id: &str) -> PathBuf {
    output_dir.join(id)
}

fn plan_request(id: &str, source: &SourceArgs) -> Result<PlanRequest> {
    let mut request = PlanRequest::new(id, &source.url);
    request.headers = parse_headers(&source.headers)?;
    request.cookies = source.cookies.clone().map(CookieInput::Raw);
    Ok(request)
}

fn plan_options(source: &SourceArgs) -> PlanOptions {
    PlanOptions {
        live_refresh_limit: source.live_refresh_limit,
        max_live_wait: source.max_live_wait.map(Duration::from_secs),
        ..PlanOptions::default()
    }
}

fn engine_config(engine: &EngineArgs) -> EngineConfig {
    EngineConfig {
        unknown_size_min_free_bytes: engine.min_free_mb.saturating_mul(1024 * 1024),
        ..EngineConfig::default()
    }
    .with_max_parallel(engine.max_parallel)
    .with_failure_budget(engine.failure_budget, engine.strict)
    .with_retry(RetryConfig {
        max_attempts: engine.max_attempts.max(1),
        ..RetryConfig::default()
    })
}

fn downloader_config(http: &HttpArgs) -> DownloaderConfig {
    let defaults = DownloaderConfig::default();
    DownloaderConfig {
        connect_timeout: Duration::from_secs(http.connect_timeout),
        read_timeout: Duration::from_secs(http.read_timeout),
        user_agent: http.user_agent.clone().unwrap_or(defaults.user_agent.clone()),
        proxy: http.proxy.as_ref().map(|url| ProxyConfig {
            url: url.clone(),
            proxy_type: http.proxy_type,
            auth: http.proxy_user.as_ref().map(|username| ProxyAuth {
                username: username.clone(),
                password: http.proxy_pass.clone().unwrap_or_default(),
            }),
        }),
        use_system_proxy: !http.no_system_proxy,
        ..defaults
    }
}
