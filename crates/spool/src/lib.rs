//! Spool: a resumable HLS download engine.
//!
//! The engine turns an HLS master playlist into a [`DownloadPlan`], then
//! drives the plan's segments to local files through the [`JobDownloader`],
//! persisting per-segment state so interrupted jobs pick up where they left
//! off. Assembling the downloaded segments into a container is left to an
//! external muxer, which consumes the concat lists written on completion.

pub mod client;
pub mod config;
pub mod download;
pub mod error;
pub mod hls;
pub mod proxy;
pub mod state;

pub use client::{create_client, install_rustls_provider};
pub use config::{DownloaderConfig, EngineConfig, RetryConfig};
pub use download::{
    ChannelListener, CleanupPolicy, ConstraintChecker, DiskSpaceProbe, DownloadOutcome,
    DownloadRequest, DownloadSegment, Headers, HttpSegmentFetcher, JobConstraints,
    JobDownloader, JobError, JobEvent, JobListener, JobProgress, NoopConstraintChecker,
    RetryPolicy, SegmentFetcher, SysinfoDiskProbe,
};
pub use error::{DownloadError, ErrorCode};
pub use hls::{
    DownloadPlan, HttpPlaylistFetcher, MasterPlaylist, MediaPlaylist, PlanBuilder, PlanOptions,
    PlanRequest, PlaylistFetcher, SelectedTracks,
};
pub use proxy::{ProxyAuth, ProxyConfig, ProxyType};
pub use state::{
    DownloadJobState, FileStateStore, JobState, LastError, MemoryStateStore, SegmentState,
    SegmentStatus, StateStore,
};
