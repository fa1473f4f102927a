mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use common::{Route, TestServer, client, encrypt, payload};
use spool_engine::download::{
    concat_list_path, segment_complete_path, segment_file_key, segment_partial_path, sequence_iv,
};
use spool_engine::hls::{KeyInfo, TrackKind};
use spool_engine::{
    ChannelListener, CleanupPolicy, DiskSpaceProbe, DownloadError, DownloadJobState,
    DownloadOutcome, DownloadRequest, DownloadSegment, EngineConfig, ErrorCode, FileStateStore,
    HttpPlaylistFetcher, JobDownloader, JobEvent, JobState, PlanBuilder, PlanRequest, RetryConfig,
    SegmentStatus, StateStore,
};
use tokio::sync::mpsc::UnboundedReceiver;

struct PlentyOfSpace;

impl DiskSpaceProbe for PlentyOfSpace {
    fn available_bytes(&self, _: &Path) -> Option<u64> {
        Some(u64::MAX)
    }
}

fn config() -> EngineConfig {
    EngineConfig {
        progress_interval: Duration::from_millis(20),
        ..EngineConfig::default()
    }
    .with_retry(RetryConfig {
        max_attempts: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter_ratio: 0.0,
        seed: Some(7),
    })
}

struct Harness {
    downloader: JobDownloader,
    store: Arc<FileStateStore>,
    events: UnboundedReceiver<JobEvent>,
    _state_dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let state_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStateStore::new(state_dir.path()));
    let (listener, events) = ChannelListener::channel();
    let downloader = JobDownloader::with_http(client(), config(), store.clone())
        .with_disk_probe(Arc::new(PlentyOfSpace))
        .with_listener(Arc::new(listener));
    Harness {
        downloader,
        store,
        events,
        _state_dir: state_dir,
    }
}

fn drain(events: &mut UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn segment(uri: String, sequence: u64) -> DownloadSegment {
    DownloadSegment {
        track: TrackKind::Video,
        uri,
        duration: 4.0,
        sequence,
        file_key: segment_file_key(TrackKind::Video, sequence),
        byte_range: None,
        key: None,
        map: None,
    }
}

fn request(id: &str, dir: &Path) -> DownloadRequest {
    DownloadRequest {
        id: id.to_string(),
        playlist_uri: "http://origin.invalid/master.m3u8".to_string(),
        output_dir: dir.to_path_buf(),
        cleanup_policy: CleanupPolicy {
            delete_on_failure: false,
            ..CleanupPolicy::default()
        },
        ..DownloadRequest::default()
    }
}

#[tokio::test]
async fn failed_segment_fails_job_and_restart_fetches_only_the_rest() {
    let server = TestServer::start().await;
    let bodies: Vec<_> = (0..3).map(|n| payload(1500, n)).collect();
    server.body("/s0.ts", bodies[0].clone());
    server.route("/s1.ts", Route::Status(StatusCode::INTERNAL_SERVER_ERROR));
    server.body("/s2.ts", bodies[2].clone());

    let out = tempfile::tempdir().unwrap();
    let segments: Vec<_> = (0..3u64)
        .map(|n| segment(server.url(&format!("/s{n}.ts")), n))
        .collect();
    let mut h = harness();

    let outcome = h
        .downloader
        .start(request("job-a", out.path()), segments.clone())
        .await
        .unwrap();
    assert_eq!(outcome, DownloadOutcome::Failed);

    let state = h.store.get("job-a").await.unwrap().unwrap();
    assert_eq!(state.state, JobState::Failed);
    let statuses: Vec<_> = state.segments.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![
            SegmentStatus::Completed,
            SegmentStatus::Failed,
            SegmentStatus::Completed
        ]
    );
    let last = state.last_error.unwrap();
    assert_eq!(last.code, ErrorCode::Network);
    assert!(last.detail.unwrap().starts_with("HTTP 500"));
    assert_eq!(server.hits("/s1.ts"), 2);

    let events = drain(&mut h.events);
    let errors = events
        .iter()
        .filter(|e| matches!(e, JobEvent::Error(_)))
        .count();
    assert_eq!(errors, 1);
    assert!(matches!(
        events.last(),
        Some(JobEvent::Completed { state: JobState::Failed, .. })
    ));

    // The origin recovers; a restart only fetches the missing segment.
    server.body("/s1.ts", bodies[1].clone());
    let outcome = h
        .downloader
        .start(request("job-a", out.path()), segments)
        .await
        .unwrap();
    assert_eq!(outcome, DownloadOutcome::Completed);
    assert_eq!(server.hits("/s0.ts"), 1);
    assert_eq!(server.hits("/s1.ts"), 3);
    assert_eq!(server.hits("/s2.ts"), 1);

    for (n, body) in bodies.iter().enumerate() {
        let key = segment_file_key(TrackKind::Video, n as u64);
        assert_eq!(
            &tokio::fs::read(segment_complete_path(out.path(), &key))
                .await
                .unwrap(),
            body
        );
    }
    let state = h.store.get("job-a").await.unwrap().unwrap();
    assert_eq!(state.state, JobState::Completed);
    assert_eq!(state.bytes_downloaded(), 4500);
    assert_eq!(state.total_bytes(), Some(4500));
}

#[tokio::test]
async fn starting_a_finished_job_again_fetches_nothing() {
    let server = TestServer::start().await;
    for n in 0..4u8 {
        server.body(&format!("/v{n}.ts"), payload(700, n));
    }
    let out = tempfile::tempdir().unwrap();
    let segments: Vec<_> = (0..4u64)
        .map(|n| segment(server.url(&format!("/v{n}.ts")), n))
        .collect();
    let h = harness();

    let first = h
        .downloader
        .start(request("job-b", out.path()), segments.clone())
        .await
        .unwrap();
    assert_eq!(first, DownloadOutcome::Completed);
    let hits = server.total_hits();
    assert_eq!(hits, 4);

    let second = h
        .downloader
        .start(request("job-b", out.path()), segments)
        .await
        .unwrap();
    assert_eq!(second, DownloadOutcome::Completed);
    assert_eq!(server.total_hits(), hits);

    let list = tokio::fs::read_to_string(concat_list_path(out.path(), TrackKind::Video))
        .await
        .unwrap();
    let lines: Vec<_> = list.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with("file '") && lines[0].ends_with("segment_video_0.bin'"));
    assert!(lines[3].ends_with("segment_video_3.bin'"));
}

#[tokio::test]
async fn interrupted_plain_segment_resumes_from_partial_file() {
    let server = TestServer::start().await;
    let body = payload(5000, 11);
    server.body("/long.ts", body.clone());
    let out = tempfile::tempdir().unwrap();
    let key = segment_file_key(TrackKind::Video, 0);
    tokio::fs::write(segment_partial_path(out.path(), &key), &body[..1200])
        .await
        .unwrap();

    let h = harness();
    let outcome = h
        .downloader
        .start(
            request("job-c", out.path()),
            vec![segment(server.url("/long.ts"), 0)],
        )
        .await
        .unwrap();

    assert_eq!(outcome, DownloadOutcome::Completed);
    assert_eq!(
        server.header_values("/long.ts", "range"),
        vec![Some("bytes=1200-".to_string())]
    );
    assert_eq!(
        tokio::fs::read(segment_complete_path(out.path(), &key))
            .await
            .unwrap(),
        body
    );
    assert!(
        !tokio::fs::try_exists(segment_partial_path(out.path(), &key))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn encrypted_job_discards_partials_and_fetches_key_once() {
    let server = TestServer::start().await;
    let key = [0x42u8; 16];
    server.body("/k", key.to_vec());
    let plain: Vec<_> = (0..3u8).map(|n| payload(2000 + n as usize, n)).collect();
    for (n, p) in plain.iter().enumerate() {
        server.body(&format!("/e{n}.ts"), encrypt(p, &key, &sequence_iv(n as u64)));
    }

    let out = tempfile::tempdir().unwrap();
    let segments: Vec<_> = (0..3u64)
        .map(|n| {
            let mut s = segment(server.url(&format!("/e{n}.ts")), n);
            s.key = Some(KeyInfo {
                method: KeyInfo::AES_128.to_string(),
                uri: Some(server.url("/k")),
                iv: None,
                key_format: None,
                key_format_versions: None,
            });
            s
        })
        .collect();
    tokio::fs::write(
        segment_partial_path(out.path(), &segments[0].file_key),
        b"stale ciphertext",
    )
    .await
    .unwrap();

    let h = harness();
    let outcome = h
        .downloader
        .start(request("job-d", out.path()), segments.clone())
        .await
        .unwrap();

    assert_eq!(outcome, DownloadOutcome::Completed);
    assert_eq!(server.hits("/k"), 1);
    assert_eq!(server.header_values("/e0.ts", "range"), vec![None]);
    for (s, p) in segments.iter().zip(&plain) {
        assert_eq!(
            &tokio::fs::read(segment_complete_path(out.path(), &s.file_key))
                .await
                .unwrap(),
            p
        );
    }
}

const MASTER: &str = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=1280x720
video/index.m3u8
";

const MEDIA: &str = "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:6
#EXT-X-MEDIA-SEQUENCE:10
#EXTINF:6.0,
seg10.ts
#EXTINF:6.0,
seg11.ts
#EXTINF:3.5,
seg12.ts
#EXT-X-ENDLIST
";

#[tokio::test]
async fn plan_built_job_resumes_from_stored_plan() {
    let server = TestServer::start().await;
    server.text("/show/master.m3u8", MASTER);
    server.text("/show/video/index.m3u8", MEDIA);
    for n in 10..13u8 {
        server.body(&format!("/show/video/seg{n}.ts"), payload(900, n));
    }

    let builder = PlanBuilder::new(Arc::new(HttpPlaylistFetcher::new(client())));
    let mut plan_request = PlanRequest::new("job-e", server.url("/show/master.m3u8"));
    plan_request.cleanup_policy = Some(CleanupPolicy {
        delete_on_failure: false,
        ..CleanupPolicy::default()
    });
    let plan = builder.build(&plan_request).await.unwrap();
    assert_eq!(plan.segment_count(), 3);

    let out = tempfile::tempdir().unwrap();
    let (req, segments) = DownloadRequest::from_plan(&plan, out.path()).unwrap();
    assert_eq!(segments[0].file_key, "video_10");

    let h = harness();
    h.downloader.start(req, segments).await.unwrap();

    // Lose the last segment, then resume from the persisted record alone.
    tokio::fs::remove_file(segment_complete_path(out.path(), "video_12"))
        .await
        .unwrap();
    let stored = h.store.get("job-e").await.unwrap().unwrap();
    assert!(stored.plan_metadata.is_some());

    let outcome = h.downloader.resume("job-e", out.path()).await.unwrap();
    assert_eq!(outcome, DownloadOutcome::Completed);
    assert_eq!(server.hits("/show/video/seg10.ts"), 1);
    assert_eq!(server.hits("/show/video/seg12.ts"), 2);
    assert_eq!(server.hits("/show/master.m3u8"), 1);

    let state = h.store.get("job-e").await.unwrap().unwrap();
    assert_eq!(state.created_at, stored.created_at);
    assert!(state.updated_at >= stored.updated_at);
}

#[tokio::test]
async fn canceled_job_cannot_be_resumed_but_can_be_removed() {
    let server = TestServer::start().await;
    server.body("/c0.ts", payload(300, 0));
    let out = tempfile::tempdir().unwrap();
    let h = harness();

    h.downloader
        .start(
            request("job-f", out.path()),
            vec![segment(server.url("/c0.ts"), 0)],
        )
        .await
        .unwrap();
    // Completed jobs are terminal and ignore cancel.
    assert!(
        !h.downloader
            .cancel("job-f", out.path(), &CleanupPolicy::default())
            .await
            .unwrap()
    );

    let paused = DownloadJobState::new(
        "job-g",
        "http://origin.invalid/master.m3u8",
        JobState::Paused,
        Vec::new(),
    );
    h.store.save(&paused).await.unwrap();
    assert!(
        h.downloader
            .cancel("job-g", out.path(), &CleanupPolicy::default())
            .await
            .unwrap()
    );
    let err = h.downloader.resume("job-g", out.path()).await.unwrap_err();
    assert!(matches!(err, DownloadError::State { .. }));
    assert!(h.downloader.remove("job-g").await.unwrap());
    assert!(h.store.get("job-g").await.unwrap().is_none());
}
