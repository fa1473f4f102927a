use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::drm::detect_drm;
use super::live::{merge_live_playlist, next_reload_delay};
use super::manifest::{MediaPlaylist, Segment, parse_master_playlist, parse_media_playlist};
use super::selection::{SelectedTracks, select_tracks};
use crate::client::header_map;
use crate::download::{CleanupPolicy, Headers, JobConstraints};
use crate::error::DownloadError;

const COOKIE_HEADER: &str = "Cookie";
const COOKIE_SEPARATOR: &str = "; ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
    Subtitle,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Subtitle => "subtitle",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackPlan {
    pub playlist_uri: String,
    pub segments: Vec<Segment>,
}

/// Everything needed to download a job, serializable so it can be persisted
/// alongside the job state and reloaded on resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadPlan {
    pub id: String,
    pub master_playlist_uri: String,
    pub tracks: SelectedTracks,
    pub video: TrackPlan,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<TrackPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitles: Option<TrackPlan>,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<JobConstraints>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_policy: Option<CleanupPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_destination: Option<String>,
}

impl DownloadPlan {
    /// Track plans in download order: video, audio, subtitles.
    pub fn track_plans(&self) -> impl Iterator<Item = (TrackKind, &TrackPlan)> {
        std::iter::once((TrackKind::Video, &self.video))
            .chain(self.audio.as_ref().map(|t| (TrackKind::Audio, t)))
            .chain(self.subtitles.as_ref().map(|t| (TrackKind::Subtitle, t)))
    }

    pub fn segment_count(&self) -> usize {
        self.track_plans().map(|(_, t)| t.segments.len()).sum()
    }
}

/// Cookies supplied either as a ready-made header value or as name/value pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CookieInput {
    Raw(String),
    Pairs(BTreeMap<String, String>),
}

impl CookieInput {
    pub fn header_value(&self) -> Option<String> {
        let value = match self {
            Self::Raw(raw) => raw.trim().to_string(),
            Self::Pairs(pairs) => pairs
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join(COOKIE_SEPARATOR),
        };
        (!value.is_empty()).then_some(value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest {
    pub id: String,
    pub master_playlist_uri: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub cookies: Option<CookieInput>,
    #[serde(default)]
    pub constraints: Option<JobConstraints>,
    #[serde(default)]
    pub cleanup_policy: Option<CleanupPolicy>,
    #[serde(default)]
    pub export_destination: Option<String>,
}

impl PlanRequest {
    pub fn new(id: impl Into<String>, master_playlist_uri: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            master_playlist_uri: master_playlist_uri.into(),
            ..Default::default()
        }
    }

    /// Request headers with the cookie header synthesized from `cookies`.
    /// A synthesized cookie replaces any `Cookie` header given explicitly.
    pub fn merged_headers(&self) -> Headers {
        let mut headers = self.headers.clone();
        if let Some(cookie) = self.cookies.as_ref().and_then(CookieInput::header_value) {
            headers.retain(|name, _| !name.eq_ignore_ascii_case(COOKIE_HEADER));
            headers.insert(COOKIE_HEADER.to_string(), cookie);
        }
        headers
    }
}

/// Bounds of the live reload loop.
#[derive(Debug, Clone)]
pub struct PlanOptions {
    /// Reloads allowed per live track before the plan is cut off
    pub live_refresh_limit: u32,
    /// Lower bound of the delay between reloads
    pub reload_floor: Duration,
    /// Delay used when a live playlist carries no duration information
    pub default_reload_delay: Duration,
    /// Optional wall-clock bound on the reload loop of a single track
    pub max_live_wait: Option<Duration>,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            live_refresh_limit: 5,
            reload_floor: Duration::from_secs(1),
            default_reload_delay: Duration::from_secs(5),
            max_live_wait: None,
        }
    }
}

/// Source of playlist text. Swapped for a scripted fetcher in tests.
#[async_trait]
pub trait PlaylistFetcher: Send + Sync {
    async fn fetch_text(&self, url: &str, headers: &Headers) -> Result<String, DownloadError>;
}

pub struct HttpPlaylistFetcher {
    client: Client,
}

impl HttpPlaylistFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PlaylistFetcher for HttpPlaylistFetcher {
    async fn fetch_text(&self, url: &str, headers: &Headers) -> Result<String, DownloadError> {
        let response = self
            .client
            .get(url)
            .headers(header_map(headers)?)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(status, url, "playlist fetch"));
        }
        Ok(response.text().await?)
    }
}

pub struct PlanBuilder {
    fetcher: Arc<dyn PlaylistFetcher>,
    options: PlanOptions,
}

impl PlanBuilder {
    pub fn new(fetcher: Arc<dyn PlaylistFetcher>) -> Self {
        Self {
            fetcher,
            options: PlanOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PlanOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &PlanOptions {
        &self.options
    }

    /// Fetch the master playlist, select tracks and resolve every selected
    /// track to a finite segment list.
    #[instrument(skip_all, fields(job_id = %request.id))]
    pub async fn build(&self, request: &PlanRequest) -> Result<DownloadPlan, DownloadError> {
        let headers = request.merged_headers();
        let master_uri = request.master_playlist_uri.as_str();

        debug!(url = master_uri, "Fetching master playlist");
        let content = self.fetcher.fetch_text(master_uri, &headers).await?;
        reject_drm(&content, master_uri)?;
        let master = parse_master_playlist(&content, master_uri)?;
        let tracks = select_tracks(&master)?;
        info!(
            video = %tracks.video.uri,
            audio = tracks.audio.as_ref().map(|t| t.uri.as_str()),
            subtitle = tracks.subtitle.as_ref().map(|t| t.uri.as_str()),
            "Selected tracks"
        );

        let video = self
            .build_track(TrackKind::Video, &tracks.video.uri, &headers)
            .await?;
        let audio = match &tracks.audio {
            Some(track) => Some(self.build_track(TrackKind::Audio, &track.uri, &headers).await?),
            None => None,
        };
        let subtitles = match &tracks.subtitle {
            Some(track) => Some(
                self.build_track(TrackKind::Subtitle, &track.uri, &headers)
                    .await?,
            ),
            None => None,
        };

        let plan = DownloadPlan {
            id: request.id.clone(),
            master_playlist_uri: request.master_playlist_uri.clone(),
            tracks,
            video,
            audio,
            subtitles,
            headers,
            constraints: request.constraints.clone(),
            cleanup_policy: request.cleanup_policy.clone(),
            export_destination: request.export_destination.clone(),
        };
        info!(segments = plan.segment_count(), "Download plan built");
        Ok(plan)
    }

    async fn fetch_media(
        &self,
        uri: &str,
        headers: &Headers,
    ) -> Result<MediaPlaylist, DownloadError> {
        let content = self.fetcher.fetch_text(uri, headers).await?;
        reject_drm(&content, uri)?;
        parse_media_playlist(&content, uri)
    }

    async fn build_track(
        &self,
        kind: TrackKind,
        uri: &str,
        headers: &Headers,
    ) -> Result<TrackPlan, DownloadError> {
        let mut playlist = self.fetch_media(uri, headers).await?;

        if playlist.is_live {
            let started = Instant::now();
            let mut refreshes = 0u32;
            while playlist.is_live && refreshes < self.options.live_refresh_limit {
                let delay = next_reload_delay(&playlist, &self.options);
                if let Some(bound) = self.options.max_live_wait
                    && started.elapsed() + delay > bound
                {
                    debug!(track = %kind, "Live wait bound reached");
                    break;
                }
                tokio::time::sleep(delay).await;

                let refreshed = self.fetch_media(uri, headers).await?;
                playlist = merge_live_playlist(&playlist, &refreshed);
                refreshes += 1;
                debug!(
                    track = %kind,
                    refreshes,
                    segments = playlist.segments.len(),
                    ended = !playlist.is_live,
                    "Reloaded live playlist"
                );
            }
            if playlist.is_live {
                warn!(
                    track = %kind,
                    refreshes,
                    segments = playlist.segments.len(),
                    "Live playlist did not end, planning the segments seen so far"
                );
            }
        }

        Ok(TrackPlan {
            playlist_uri: uri.to_string(),
            segments: playlist.segments,
        })
    }
}

fn reject_drm(content: &str, uri: &str) -> Result<(), DownloadError> {
    let drm = detect_drm(content);
    if drm.is_protected() {
        warn!(url = uri, systems = %drm.describe(), "Playlist is DRM protected");
        return Err(DownloadError::DrmProtected {
            systems: drm.describe(),
        });
    }
    Ok(())
}
