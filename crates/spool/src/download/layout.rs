//! On-disk naming of segment files and the concat lists handed to the
//! assembler.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::request::DownloadSegment;
use crate::error::DownloadError;
use crate::hls::TrackKind;

const PARTIAL_EXT: &str = "partial";
const COMPLETE_EXT: &str = "bin";
const CONCAT_SUFFIX: &str = ".concat.txt";

pub fn segment_partial_path(dir: &Path, file_key: &str) -> PathBuf {
    dir.join(format!("segment_{file_key}.{PARTIAL_EXT}"))
}

pub fn segment_complete_path(dir: &Path, file_key: &str) -> PathBuf {
    dir.join(format!("segment_{file_key}.{COMPLETE_EXT}"))
}

pub fn map_partial_path(dir: &Path, file_key: &str) -> PathBuf {
    dir.join(format!("map_{file_key}.{PARTIAL_EXT}"))
}

pub fn map_complete_path(dir: &Path, file_key: &str) -> PathBuf {
    dir.join(format!("map_{file_key}.{COMPLETE_EXT}"))
}

pub fn concat_list_path(dir: &Path, track: TrackKind) -> PathBuf {
    dir.join(format!("{track}{CONCAT_SUFFIX}"))
}

/// Length of the file at `path`, 0 when it does not exist.
pub async fn file_len(path: &Path) -> Result<u64, DownloadError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

fn is_engine_file(name: &str, delete_completed: bool) -> bool {
    if name.ends_with(&format!(".{PARTIAL_EXT}")) {
        return true;
    }
    delete_completed
        && ((name.starts_with("segment_") || name.starts_with("map_"))
            && name.ends_with(&format!(".{COMPLETE_EXT}"))
            || name.ends_with(CONCAT_SUFFIX))
}

/// Remove partial files from `dir`, and completed segment, map and concat
/// files too when `delete_completed` is set. Returns the number of files
/// removed. Files the engine did not create are left alone.
pub async fn cleanup_files(dir: &Path, delete_completed: bool) -> Result<usize, DownloadError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !is_engine_file(name, delete_completed) {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(file = name, error = %e, "Failed to remove file"),
        }
    }
    debug!(dir = %dir.display(), removed, delete_completed, "Cleaned up job files");
    Ok(removed)
}

fn concat_line(path: &Path) -> String {
    let escaped = path.to_string_lossy().replace('\'', "'\\''");
    format!("file '{escaped}'\n")
}

/// Write `{track}.concat.txt` for every track in `segments`, listing the
/// completed files in playlist order. An init map is listed before the first
/// segment that uses it. Returns the written list paths.
pub async fn write_concat_lists(
    dir: &Path,
    segments: &[DownloadSegment],
) -> Result<Vec<PathBuf>, DownloadError> {
    let dir = std::path::absolute(dir)?;
    let mut lists: Vec<(TrackKind, String)> = Vec::new();
    let mut current_map: Option<(TrackKind, &str)> = None;

    for segment in segments {
        let idx = match lists.iter().position(|(track, _)| *track == segment.track) {
            Some(idx) => idx,
            None => {
                lists.push((segment.track, String::new()));
                lists.len() - 1
            }
        };
        let body = &mut lists[idx].1;

        if let Some(map) = &segment.map
            && current_map != Some((segment.track, map.file_key.as_str()))
        {
            body.push_str(&concat_line(&map_complete_path(&dir, &map.file_key)));
            current_map = Some((segment.track, map.file_key.as_str()));
        }
        body.push_str(&concat_line(&segment_complete_path(&dir, &segment.file_key)));
    }

    let mut written = Vec::with_capacity(lists.len());
    for (track, body) in lists {
        let path = concat_list_path(&dir, track);
        tokio::fs::write(&path, body).await?;
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::request::{SegmentMap, segment_file_key};

    fn segment(track: TrackKind, sequence: u64, map: Option<&str>) -> DownloadSegment {
        DownloadSegment {
            track,
            uri: format!("https://cdn.example.com/{track}/{sequence}.m4s"),
            duration: 4.0,
            sequence,
            file_key: segment_file_key(track, sequence),
            byte_range: None,
            key: None,
            map: map.map(|key| SegmentMap {
                uri: format!("https://cdn.example.com/{key}.mp4"),
                byte_range: None,
                file_key: key.to_string(),
            }),
        }
    }

    #[test]
    fn paths_follow_file_keys() {
        let dir = Path::new("/data/job");
        assert_eq!(
            segment_partial_path(dir, "video_3"),
            Path::new("/data/job/segment_video_3.partial")
        );
        assert_eq!(
            segment_complete_path(dir, "video_3"),
            Path::new("/data/job/segment_video_3.bin")
        );
        assert_eq!(map_complete_path(dir, "audio_ab"), Path::new("/data/job/map_audio_ab.bin"));
        assert_eq!(
            concat_list_path(dir, TrackKind::Subtitle),
            Path::new("/data/job/subtitle.concat.txt")
        );
    }

    #[tokio::test]
    async fn cleanup_respects_delete_completed() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "segment_video_0.bin",
            "segment_video_1.partial",
            "map_video_aa.bin",
            "map_video_bb.partial",
            "video.concat.txt",
            "notes.txt",
        ] {
            tokio::fs::write(dir.path().join(name), b"x").await.unwrap();
        }

        assert_eq!(cleanup_files(dir.path(), false).await.unwrap(), 2);
        assert!(dir.path().join("segment_video_0.bin").exists());
        assert!(!dir.path().join("segment_video_1.partial").exists());

        assert_eq!(cleanup_files(dir.path(), true).await.unwrap(), 3);
        assert!(!dir.path().join("map_video_aa.bin").exists());
        assert!(dir.path().join("notes.txt").exists());

        assert_eq!(cleanup_files(&dir.path().join("missing"), true).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concat_lists_put_maps_first_per_track() {
        let dir = tempfile::tempdir().unwrap();
        let segments = vec![
            segment(TrackKind::Video, 0, Some("video_init")),
            segment(TrackKind::Video, 1, Some("video_init")),
            segment(TrackKind::Audio, 0, Some("audio_init")),
            segment(TrackKind::Audio, 1, Some("audio_init")),
        ];

        let written = write_concat_lists(dir.path(), &segments).await.unwrap();
        assert_eq!(written.len(), 2);

        let video = tokio::fs::read_to_string(dir.path().join("video.concat.txt"))
            .await
            .unwrap();
        let lines: Vec<_> = video.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("map_video_init.bin'"));
        assert!(lines[1].ends_with("segment_video_0.bin'"));
        assert!(lines[2].ends_with("segment_video_1.bin'"));
        assert!(lines.iter().all(|l| l.starts_with("file '/")));
    }

    #[test]
    fn concat_line_escapes_quotes() {
        assert_eq!(
            concat_line(Path::new("/tmp/it's/a.bin")),
            "file '/tmp/it'\\''s/a.bin'\n"
        );
    }
}
