use serde::{Deserialize, Serialize};
use tracing::debug;

use super::manifest::{MasterPlaylist, MediaTrack, Variant};
use crate::error::DownloadError;

/// Audio languages preferred in order, as canonical codes.
const AUDIO_LANGUAGE_PRIORITY: [&str; 2] = ["eng", "spa"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedTracks {
    pub video: Variant,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<MediaTrack>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<MediaTrack>,
}

/// Canonical form of a language tag: `en`, `eng` and `en-*` become `eng`;
/// `es`, `spa`, `esp` and `es-*` become `spa`. Other tags are lowercased.
pub fn canonical_language(lang: &str) -> Option<String> {
    let normalized = lang.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return None;
    }
    let canonical = match normalized.as_str() {
        "en" | "eng" => "eng".to_string(),
        "es" | "spa" | "esp" => "spa".to_string(),
        n if n.starts_with("en-") => "eng".to_string(),
        n if n.starts_with("es-") => "spa".to_string(),
        _ => normalized,
    };
    Some(canonical)
}

fn track_language(track: &MediaTrack) -> Option<String> {
    track.language.as_deref().and_then(canonical_language)
}

/// Lowest vertical resolution wins; a missing resolution sorts last. Ties go
/// to the lowest bandwidth, then to the earliest declaration.
fn pick_lowest_variant(variants: &[Variant]) -> Option<&Variant> {
    variants.iter().min_by_key(|v| {
        (
            v.resolution.map_or(u64::MAX, |r| u64::from(r.height)),
            v.bandwidth.unwrap_or(u64::MAX),
        )
    })
}

/// Members of `group_id`, or every track when the group is unset or empty.
fn filter_by_group<'a>(tracks: &'a [MediaTrack], group_id: Option<&str>) -> Vec<&'a MediaTrack> {
    if let Some(group) = group_id {
        let grouped: Vec<&MediaTrack> = tracks.iter().filter(|t| t.group_id == group).collect();
        if !grouped.is_empty() {
            return grouped;
        }
        debug!(group, "Rendition group has no members, falling back to all tracks");
    }
    tracks.iter().collect()
}

fn pick_audio<'a>(tracks: &'a [MediaTrack], group_id: Option<&str>) -> Option<&'a MediaTrack> {
    let candidates = filter_by_group(tracks, group_id);
    AUDIO_LANGUAGE_PRIORITY
        .iter()
        .find_map(|preferred| {
            candidates
                .iter()
                .find(|t| track_language(t).as_deref() == Some(*preferred))
        })
        .or_else(|| candidates.first())
        .copied()
}

fn pick_subtitle<'a>(
    tracks: &'a [MediaTrack],
    group_id: Option<&str>,
    audio: Option<&MediaTrack>,
) -> Option<&'a MediaTrack> {
    let audio_language = audio.and_then(track_language)?;
    filter_by_group(tracks, group_id)
        .into_iter()
        .find(|t| track_language(t).as_deref() == Some(audio_language.as_str()))
}

/// Pick one variant, audio track and subtitle track from a master playlist.
pub fn select_tracks(master: &MasterPlaylist) -> Result<SelectedTracks, DownloadError> {
    let video = pick_lowest_variant(&master.variants).ok_or(DownloadError::NoVariants)?;
    let audio = pick_audio(&master.audios, video.audio_group_id.as_deref());
    let subtitle = pick_subtitle(
        &master.subtitles,
        video.subtitle_group_id.as_deref(),
        audio,
    );

    Ok(SelectedTracks {
        video: video.clone(),
        audio: audio.cloned(),
        subtitle: subtitle.cloned(),
    })
}
