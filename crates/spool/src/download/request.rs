use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;
use url::Url;

use crate::error::DownloadError;
use crate::hls::{ByteRange, DownloadPlan, KeyInfo, Segment, TrackKind};

/// Request headers applied to every playlist, key and segment request of a job.
pub type Headers = BTreeMap<String, String>;

/// External conditions a job must satisfy before it is started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobConstraints {
    pub requires_unmetered: bool,
    pub requires_charging: bool,
    pub requires_idle: bool,
    pub requires_storage_not_low: bool,
}

impl JobConstraints {
    pub fn is_unconstrained(&self) -> bool {
        *self == Self::default()
    }
}

/// Which files to remove when a job reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CleanupPolicy {
    pub delete_on_failure: bool,
    pub delete_on_cancel: bool,
    pub delete_on_success: bool,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            delete_on_failure: true,
            delete_on_cancel: true,
            delete_on_success: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentMap {
    pub uri: String,
    pub byte_range: Option<ByteRange>,
    pub file_key: String,
}

/// A media segment scheduled for download, with its on-disk identity.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadSegment {
    pub track: TrackKind,
    pub uri: String,
    pub duration: f64,
    pub sequence: u64,
    pub file_key: String,
    pub byte_range: Option<ByteRange>,
    pub key: Option<KeyInfo>,
    pub map: Option<SegmentMap>,
}

impl DownloadSegment {
    pub fn from_playlist(track: TrackKind, segment: &Segment) -> Self {
        Self {
            track,
            uri: segment.uri.clone(),
            duration: segment.duration,
            sequence: segment.sequence,
            file_key: segment_file_key(track, segment.sequence),
            byte_range: segment.byte_range,
            key: segment.key.clone(),
            map: segment.map.as_ref().map(|map| SegmentMap {
                uri: map.uri.clone(),
                byte_range: map.byte_range,
                file_key: map_file_key(track, &map.uri),
            }),
        }
    }

    /// Encrypted segments are always fetched whole and cannot be resumed.
    pub fn is_encrypted(&self) -> bool {
        self.key.as_ref().is_some_and(KeyInfo::requires_key)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DownloadRequest {
    pub id: String,
    pub playlist_uri: String,
    pub output_dir: PathBuf,
    pub headers: Headers,
    /// Expected download size, when known up front
    pub required_bytes: Option<u64>,
    /// Serialized [`DownloadPlan`], persisted with the job for resume
    pub plan_metadata: Option<String>,
    pub export_destination: Option<String>,
    pub constraints: JobConstraints,
    pub cleanup_policy: CleanupPolicy,
}

impl DownloadRequest {
    /// Flatten a plan into a request and its segments, in track order.
    pub fn from_plan(
        plan: &DownloadPlan,
        output_dir: impl Into<PathBuf>,
    ) -> Result<(Self, Vec<DownloadSegment>), DownloadError> {
        let segments = plan
            .track_plans()
            .flat_map(|(kind, track)| {
                track
                    .segments
                    .iter()
                    .map(move |segment| DownloadSegment::from_playlist(kind, segment))
            })
            .collect();

        let request = Self {
            id: plan.id.clone(),
            playlist_uri: plan.master_playlist_uri.clone(),
            output_dir: output_dir.into(),
            headers: plan.headers.clone(),
            required_bytes: None,
            plan_metadata: Some(serde_json::to_string(plan)?),
            export_destination: plan.export_destination.clone(),
            constraints: plan.constraints.clone().unwrap_or_default(),
            cleanup_policy: plan.cleanup_policy.clone().unwrap_or_default(),
        };
        Ok((request, segments))
    }
}

pub fn segment_file_key(track: TrackKind, sequence: u64) -> String {
    format!("{track}_{sequence}")
}

/// Init maps are keyed by a digest of their URI, so maps shared by many
/// segments resolve to one file.
pub fn map_file_key(track: TrackKind, uri: &str) -> String {
    let digest = Sha256::digest(uri.as_bytes());
    format!("{track}_{}", hex::encode(&digest[..8]))
}

fn validate_file_key(key: &str) -> Result<(), DownloadError> {
    if key.is_empty() || key.contains("..") || key.contains('/') || key.contains('\\') {
        return Err(DownloadError::validation(format!(
            "unsafe file key `{key}`"
        )));
    }
    Ok(())
}

fn validate_uri(uri: &str, what: &str) -> Result<(), DownloadError> {
    let parsed = Url::parse(uri)
        .map_err(|e| DownloadError::validation(format!("malformed {what} URI `{uri}`: {e}")))?;
    match parsed.scheme() {
        "https" => Ok(()),
        "http" => {
            warn!(uri, "{what} is fetched over plain HTTP");
            Ok(())
        }
        other => Err(DownloadError::validation(format!(
            "unsupported scheme `{other}` for {what} URI `{uri}`"
        ))),
    }
}

fn validate_range(range: Option<&ByteRange>, what: &str) -> Result<(), DownloadError> {
    if range.is_some_and(|r| r.length == 0) {
        return Err(DownloadError::validation(format!(
            "zero-length byte range on {what}"
        )));
    }
    Ok(())
}

/// Reject a segment that could escape the output directory or that cannot be
/// fetched over HTTP.
pub fn validate_segment(segment: &DownloadSegment) -> Result<(), DownloadError> {
    validate_file_key(&segment.file_key)?;
    validate_uri(&segment.uri, "segment")?;
    validate_range(segment.byte_range.as_ref(), "segment")?;

    if let Some(map) = &segment.map {
        validate_file_key(&map.file_key)?;
        validate_uri(&map.uri, "init map")?;
        validate_range(map.byte_range.as_ref(), "init map")?;
    }
    Ok(())
}

/// Validate every segment and the uniqueness of their file keys.
pub fn validate_segments(segments: &[DownloadSegment]) -> Result<(), DownloadError> {
    let mut seen = HashSet::with_capacity(segments.len());
    for segment in segments {
        validate_segment(segment)?;
        if !seen.insert(segment.file_key.as_str()) {
            return Err(DownloadError::validation(format!(
                "duplicate file key `{}`",
                segment.file_key
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::MapInfo;

    fn segment(uri: &str, sequence: u64) -> DownloadSegment {
        DownloadSegment {
            track: TrackKind::Video,
            uri: uri.to_string(),
            duration: 4.0,
            sequence,
            file_key: segment_file_key(TrackKind::Video, sequence),
            byte_range: None,
            key: None,
            map: None,
        }
    }

    #[test]
    fn file_keys_are_deterministic_and_safe() {
        assert_eq!(segment_file_key(TrackKind::Audio, 7), "audio_7");
        let a = map_file_key(TrackKind::Video, "https://example.com/init.mp4");
        let b = map_file_key(TrackKind::Video, "https://example.com/init.mp4");
        assert_eq!(a, b);
        assert!(a.starts_with("video_"));
        assert_eq!(a.len(), "video_".len() + 16);
        assert_ne!(a, map_file_key(TrackKind::Video, "https://example.com/other.mp4"));
    }

    #[test]
    fn rejects_path_traversal_in_file_keys() {
        for bad in ["../etc", "a/b", "a\\b", ""] {
            let mut s = segment("https://example.com/a.ts", 1);
            s.file_key = bad.to_string();
            let err = validate_segment(&s).unwrap_err();
            assert!(matches!(err, DownloadError::Validation { .. }), "{bad}");
        }
    }

    #[test]
    fn rejects_unsupported_schemes_and_empty_ranges() {
        assert!(validate_segment(&segment("file:///etc/passwd", 1)).is_err());
        assert!(validate_segment(&segment("not a uri", 1)).is_err());
        assert!(validate_segment(&segment("http://example.com/a.ts", 1)).is_ok());

        let mut ranged = segment("https://example.com/a.ts", 1);
        ranged.byte_range = Some(ByteRange {
            length: 0,
            offset: Some(10),
        });
        assert!(validate_segment(&ranged).is_err());

        let mut mapped = segment("https://example.com/a.ts", 1);
        mapped.map = Some(SegmentMap {
            uri: "ftp://example.com/init.mp4".to_string(),
            byte_range: None,
            file_key: "video_init".to_string(),
        });
        assert!(validate_segment(&mapped).is_err());
    }

    #[test]
    fn duplicate_file_keys_are_rejected() {
        let segments = vec![
            segment("https://example.com/a.ts", 1),
            segment("https://example.com/b.ts", 1),
        ];
        assert!(validate_segments(&segments).is_err());
    }

    #[test]
    fn cleanup_policy_fills_missing_fields_with_defaults() {
        let policy: CleanupPolicy = serde_json::from_str("{\"deleteOnSuccess\":true}").unwrap();
        assert!(policy.delete_on_failure);
        assert!(policy.delete_on_cancel);
        assert!(policy.delete_on_success);
    }

    #[test]
    fn from_playlist_derives_map_key() {
        let playlist_segment = Segment {
            uri: "https://example.com/s.m4s".to_string(),
            duration: 2.0,
            title: None,
            sequence: 3,
            byte_range: None,
            key: None,
            map: Some(MapInfo {
                uri: "https://example.com/init.mp4".to_string(),
                byte_range: None,
            }),
        };
        let s = DownloadSegment::from_playlist(TrackKind::Audio, &playlist_segment);
        assert_eq!(s.file_key, "audio_3");
        assert_eq!(
            s.map.as_ref().unwrap().file_key,
            map_file_key(TrackKind::Audio, "https://example.com/init.mp4")
        );
        assert!(!s.is_encrypted());
    }
}
