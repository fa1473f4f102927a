mod common;

use axum::http::StatusCode;
use common::{Route, TestServer, client, encrypt, payload};
use spool_engine::download::{SegmentMap, segment_file_key, sequence_iv};
use spool_engine::hls::{ByteRange, KeyInfo, TrackKind};
use spool_engine::{
    DownloadError, DownloadSegment, EngineConfig, Headers, HttpSegmentFetcher, SegmentFetcher,
};

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

fn aes_key(uri: String, iv: Option<&str>) -> KeyInfo {
    KeyInfo {
        method: KeyInfo::AES_128.to_string(),
        uri: Some(uri),
        iv: iv.map(str::to_string),
        key_format: None,
        key_format_versions: None,
    }
}

fn fetcher() -> HttpSegmentFetcher {
    HttpSegmentFetcher::new(client(), &EngineConfig::default())
}

#[tokio::test]
async fn downloads_whole_segment() {
    let server = TestServer::start().await;
    let body = payload(4096, 1);
    server.body("/seg0.ts", body.clone());
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("segment_video_0.partial");

    let len = fetcher()
        .fetch(&segment(server.url("/seg0.ts"), 0), &dest, &Headers::new(), 0)
        .await
        .unwrap();

    assert_eq!(len, 4096);
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), body);
    assert_eq!(server.header_values("/seg0.ts", "range"), vec![None]);
}

#[tokio::test]
async fn resumes_unranged_segment_by_appending() {
    let server = TestServer::start().await;
    let body = payload(1000, 2);
    server.body("/seg1.ts", body.clone());
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("segment_video_1.partial");
    tokio::fs::write(&dest, &body[..400]).await.unwrap();

    let len = fetcher()
        .fetch(&segment(server.url("/seg1.ts"), 1), &dest, &Headers::new(), 400)
        .await
        .unwrap();

    assert_eq!(len, 1000);
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), body);
    assert_eq!(
        server.header_values("/seg1.ts", "range"),
        vec![Some("bytes=400-".to_string())]
    );
}

#[tokio::test]
async fn full_partial_of_unranged_segment_is_accepted_on_416() {
    let server = TestServer::start().await;
    let body = payload(256, 3);
    server.body("/seg2.ts", body.clone());
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("segment_video_2.partial");
    tokio::fs::write(&dest, &body).await.unwrap();

    let len = fetcher()
        .fetch(&segment(server.url("/seg2.ts"), 2), &dest, &Headers::new(), 256)
        .await
        .unwrap();

    assert_eq!(len, 256);
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), body);
}

#[tokio::test]
async fn byte_range_segment_holds_exactly_its_window() {
    let server = TestServer::start().await;
    let body = payload(1000, 4);
    server.body("/muxed.ts", body.clone());
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("segment_video_3.partial");

    let mut ranged = segment(server.url("/muxed.ts"), 3);
    ranged.byte_range = Some(ByteRange {
        length: 100,
        offset: Some(200),
    });

    let len = fetcher()
        .fetch(&ranged, &dest, &Headers::new(), 0)
        .await
        .unwrap();
    assert_eq!(len, 100);
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), &body[200..300]);
    assert_eq!(
        server.header_values("/muxed.ts", "range"),
        vec![Some("bytes=200-299".to_string())]
    );

    // Resume inside the window.
    tokio::fs::write(&dest, &body[200..250]).await.unwrap();
    let len = fetcher()
        .fetch(&ranged, &dest, &Headers::new(), 50)
        .await
        .unwrap();
    assert_eq!(len, 100);
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), &body[200..300]);
}

#[tokio::test]
async fn range_ignoring_server_still_yields_exact_window() {
    let server = TestServer::start().await;
    let body = payload(1000, 5);
    server.route("/norange.ts", Route::IgnoreRange(body.clone().into()));
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("segment_video_4.partial");

    let mut ranged = segment(server.url("/norange.ts"), 4);
    ranged.byte_range = Some(ByteRange {
        length: 100,
        offset: Some(200),
    });

    // A stale partial must be rewritten, not appended to.
    tokio::fs::write(&dest, &body[200..250]).await.unwrap();
    let len = fetcher()
        .fetch(&ranged, &dest, &Headers::new(), 50)
        .await
        .unwrap();

    assert_eq!(len, 100);
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), &body[200..300]);
}

#[tokio::test]
async fn encrypted_segment_restarts_from_zero_and_shares_key() {
    let server = TestServer::start().await;
    let key = [0x2au8; 16];
    server.body("/key.bin", key.to_vec());

    let first = payload(3000, 6);
    let second = payload(1500, 7);
    server.body("/enc42.ts", encrypt(&first, &key, &sequence_iv(42)));
    let explicit_iv = [0x11u8; 16];
    server.body("/enc43.ts", encrypt(&second, &key, &explicit_iv));

    let dir = tempfile::tempdir().unwrap();
    let fetcher = fetcher();

    let mut seg42 = segment(server.url("/enc42.ts"), 42);
    seg42.key = Some(aes_key(server.url("/key.bin"), None));
    let dest42 = dir.path().join("segment_video_42.partial");
    tokio::fs::write(&dest42, b"garbage from an interrupted attempt")
        .await
        .unwrap();

    let len = fetcher
        .fetch(&seg42, &dest42, &Headers::new(), 35)
        .await
        .unwrap();
    assert_eq!(len, first.len() as u64);
    assert_eq!(tokio::fs::read(&dest42).await.unwrap(), first);
    assert_eq!(server.header_values("/enc42.ts", "range"), vec![None]);

    let mut seg43 = segment(server.url("/enc43.ts"), 43);
    seg43.key = Some(aes_key(
        server.url("/key.bin"),
        Some("0x11111111111111111111111111111111"),
    ));
    let dest43 = dir.path().join("segment_video_43.partial");
    fetcher
        .fetch(&seg43, &dest43, &Headers::new(), 0)
        .await
        .unwrap();
    assert_eq!(tokio::fs::read(&dest43).await.unwrap(), second);

    assert_eq!(server.hits("/key.bin"), 1);
    assert!(fetcher.key_cache().get(&server.url("/key.bin")).await.is_some());
}

#[tokio::test]
async fn concurrent_segments_fetch_a_shared_key_once() {
    let server = TestServer::start().await;
    let key = [0x5cu8; 16];
    server.body("/shared.key", key.to_vec());
    let plaintexts: Vec<_> = (0..6).map(|n| payload(2048, n as u8)).collect();
    for (n, plain) in plaintexts.iter().enumerate() {
        server.body(&format!("/c{n}.ts"), encrypt(plain, &key, &sequence_iv(n as u64)));
    }

    let dir = tempfile::tempdir().unwrap();
    let fetcher = fetcher();
    let segments: Vec<_> = (0..6u64)
        .map(|n| {
            let mut s = segment(server.url(&format!("/c{n}.ts")), n);
            s.key = Some(aes_key(server.url("/shared.key"), None));
            s
        })
        .collect();

    let fetches = segments.iter().map(|s| {
        let dest = dir.path().join(format!("segment_{}.partial", s.file_key));
        let fetcher = &fetcher;
        async move {
            fetcher.fetch(s, &dest, &Headers::new(), 0).await?;
            Ok::<_, DownloadError>(tokio::fs::read(&dest).await?)
        }
    });
    let results = futures::future::join_all(fetches).await;

    for (result, expected) in results.into_iter().zip(&plaintexts) {
        assert_eq!(&result.unwrap(), expected);
    }
    assert_eq!(server.hits("/shared.key"), 1);
}

#[tokio::test]
async fn http_failures_are_classified() {
    let server = TestServer::start().await;
    server.route("/boom.ts", Route::Status(StatusCode::INTERNAL_SERVER_ERROR));
    server.route("/gone.ts", Route::Status(StatusCode::NOT_FOUND));
    server.body("/empty.ts", Vec::new());
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("x.partial");
    let fetcher = fetcher();

    let err = fetcher
        .fetch(&segment(server.url("/boom.ts"), 0), &dest, &Headers::new(), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, DownloadError::HttpStatus { status, .. } if status == 500));
    assert!(err.is_retryable());

    let err = fetcher
        .fetch(&segment(server.url("/gone.ts"), 0), &dest, &Headers::new(), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, DownloadError::HttpStatus { status, .. } if status == 404));
    assert!(err.is_retryable());

    let err = fetcher
        .fetch(&segment(server.url("/empty.ts"), 0), &dest, &Headers::new(), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, DownloadError::EmptyBody { .. }));
}

#[tokio::test]
async fn key_of_wrong_length_is_a_decryption_error() {
    let server = TestServer::start().await;
    server.body("/short.key", vec![1u8; 8]);
    server.body("/e.ts", vec![0u8; 32]);
    let dir = tempfile::tempdir().unwrap();

    let mut s = segment(server.url("/e.ts"), 0);
    s.key = Some(aes_key(server.url("/short.key"), None));
    let err = fetcher()
        .fetch(&s, &dir.path().join("e.partial"), &Headers::new(), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, DownloadError::Decryption { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn ranged_init_map_is_fetched_as_plain_segment() {
    let server = TestServer::start().await;
    let body = payload(800, 9);
    server.body("/media.mp4", body.clone());
    let dir = tempfile::tempdir().unwrap();

    let map = SegmentMap {
        uri: server.url("/media.mp4"),
        byte_range: Some(ByteRange {
            length: 64,
            offset: None,
        }),
        file_key: "video_init".to_string(),
    };
    let as_segment = DownloadSegment {
        uri: map.uri.clone(),
        byte_range: map.byte_range,
        file_key: map.file_key.clone(),
        ..segment(map.uri.clone(), 0)
    };
    let dest = dir.path().join("map_video_init.partial");
    let len = fetcher()
        .fetch(&as_segment, &dest, &Headers::new(), 0)
        .await
        .unwrap();
    assert_eq!(len, 64);
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), &body[..64]);
}

#[tokio::test]
async fn job_headers_are_sent() {
    let server = TestServer::start().await;
    server.body("/auth.ts", payload(10, 0));
    let dir = tempfile::tempdir().unwrap();
    let mut headers = Headers::new();
    headers.insert("Cookie".to_string(), "session=abc".to_string());
    headers.insert("Referer".to_string(), "https://player.example.com/".to_string());

    fetcher()
        .fetch(
            &segment(server.url("/auth.ts"), 0),
            &dir.path().join("a.partial"),
            &headers,
            0,
        )
        .await
        .unwrap();

    assert_eq!(
        server.header_values("/auth.ts", "cookie"),
        vec![Some("session=abc".to_string())]
    );
    assert_eq!(
        server.header_values("/auth.ts", "referer"),
        vec![Some("https://player.example.com/".to_string())]
    );
}
