use std::collections::BTreeMap;
use std::time::Duration;

use super::manifest::{MediaPlaylist, Segment};
use super::plan::PlanOptions;

/// Merge a refreshed live playlist into the previously accumulated one.
///
/// Segments are keyed by sequence number; when both playlists carry the same
/// sequence the copy from `next` wins. Segments that fell out of the refreshed
/// window (sequence below `next.media_sequence`) are dropped. The result takes
/// the playlist-level fields of `next` and lists segments in strictly
/// increasing sequence order.
pub fn merge_live_playlist(prev: &MediaPlaylist, next: &MediaPlaylist) -> MediaPlaylist {
    let floor = next.media_sequence;
    let mut by_sequence: BTreeMap<u64, Segment> = BTreeMap::new();

    for segment in prev.segments.iter().chain(next.segments.iter()) {
        if segment.sequence >= floor {
            by_sequence.insert(segment.sequence, segment.clone());
        }
    }

    MediaPlaylist {
        base_uri: next.base_uri.clone(),
        target_duration: next.target_duration,
        media_sequence: next.media_sequence,
        segments: by_sequence.into_values().collect(),
        is_live: next.is_live,
    }
}

fn seconds(value: f64) -> Option<Duration> {
    (value.is_finite() && value > 0.0).then(|| Duration::from_secs_f64(value))
}

/// How long to wait before reloading `playlist`. Zero when it has ended.
pub fn next_reload_delay(playlist: &MediaPlaylist, options: &PlanOptions) -> Duration {
    if !playlist.is_live {
        return Duration::ZERO;
    }

    let target = playlist.target_duration.and_then(seconds);
    let last = playlist.segments.last().and_then(|s| seconds(s.duration));

    let base = match (target, last) {
        (None, None) => options.default_reload_delay,
        (a, b) => a.unwrap_or_default().max(b.unwrap_or_default()),
    };
    base.max(options.reload_floor)
}
