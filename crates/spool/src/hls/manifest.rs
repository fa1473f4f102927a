//! Line-oriented M3U8 parsing for master and media playlists.
//!
//! The parser is deliberately lenient: numeric attributes that fail to parse
//! leave the corresponding field unset instead of failing the whole playlist,
//! since servers frequently emit slightly non-conformant manifests.
//!
//! `EXT-X-BYTERANGE` values are emitted exactly as written. When the offset is
//! omitted the range is *not* chained to the previous byte-ranged segment; the
//! fetcher then treats it as starting at offset zero.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};
use url::Url;

use crate::error::DownloadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub length: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

impl ByteRange {
    /// First byte of the range, with an omitted offset meaning zero.
    pub fn start(&self) -> u64 {
        self.offset.unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyInfo {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_format_versions: Option<String>,
}

impl KeyInfo {
    pub const AES_128: &'static str = "AES-128";

    /// True when segments under this key must be decrypted with a fetched key.
    pub fn requires_key(&self) -> bool {
        self.method.eq_ignore_ascii_case(Self::AES_128) && self.uri.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapInfo {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_range: Option<ByteRange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub uri: String,
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_range: Option<ByteRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<KeyInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<MapInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaPlaylist {
    pub base_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_duration: Option<f64>,
    pub media_sequence: u64,
    pub segments: Vec<Segment>,
    pub is_live: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codecs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle_group_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaTrack {
    pub group_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub uri: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub is_auto_select: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterPlaylist {
    pub base_uri: String,
    pub variants: Vec<Variant>,
    pub audios: Vec<MediaTrack>,
    pub subtitles: Vec<MediaTrack>,
}

/// Split an attribute list on commas, keeping quoted values intact.
fn split_attributes(raw: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0usize;
    for (idx, ch) in raw.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(raw[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    if start < raw.len() {
        parts.push(raw[start..].trim());
    }
    parts
}

/// Parse `KEY=VALUE,KEY="QUOTED"` into a map. Entries without `=` are dropped.
pub(crate) fn parse_attributes(raw: &str) -> HashMap<&str, &str> {
    let mut attrs = HashMap::new();
    for part in split_attributes(raw).into_iter().filter(|p| !p.is_empty()) {
        let Some((k, v)) = part.split_once('=') else {
            continue;
        };
        let mut val = v.trim();
        if let Some(stripped) = val.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
            val = stripped;
        }
        attrs.insert(k.trim(), val);
    }
    attrs
}

/// Non-empty, trimmed lines of a manifest.
pub(crate) fn manifest_lines(content: &str) -> impl Iterator<Item = &str> {
    content.lines().map(str::trim).filter(|line| !line.is_empty())
}

fn parse_resolution(value: Option<&str>) -> Option<Resolution> {
    let (w, h) = value?.split_once(['x', 'X'])?;
    Some(Resolution {
        width: w.trim().parse().ok()?,
        height: h.trim().parse().ok()?,
    })
}

fn parse_byte_range(raw: Option<&str>) -> Option<ByteRange> {
    let raw = raw?.trim();
    let (len_str, offset_str) = match raw.split_once('@') {
        Some((len, offset)) => (len, Some(offset)),
        None => (raw, None),
    };
    let length = len_str.trim().parse::<u64>().ok()?;
    let offset = offset_str.and_then(|o| o.trim().parse::<u64>().ok());
    Some(ByteRange { length, offset })
}

fn parse_extinf(raw: &str) -> Option<(f64, Option<String>)> {
    let (duration_text, title) = match raw.split_once(',') {
        Some((d, t)) => (d, Some(t.trim())),
        None => (raw, None),
    };
    let duration = duration_text.trim().parse::<f64>().ok()?;
    if !duration.is_finite() || duration <= 0.0 {
        return None;
    }
    let title = title.filter(|t| !t.is_empty()).map(str::to_string);
    Some((duration, title))
}

fn parse_base(playlist_uri: &str) -> Result<Url, DownloadError> {
    Url::parse(playlist_uri).map_err(|e| DownloadError::invalid_url(playlist_uri, e.to_string()))
}

/// Resolve a (possibly relative) reference against a playlist URI.
pub fn resolve_uri(base: &str, reference: &str) -> Result<String, DownloadError> {
    let base = parse_base(base)?;
    join(&base, reference)
}

fn join(base: &Url, reference: &str) -> Result<String, DownloadError> {
    base.join(reference)
        .map(|u| u.to_string())
        .map_err(|e| DownloadError::invalid_url(reference, e.to_string()))
}

fn yes(value: Option<&&str>) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case("YES"))
}

pub fn parse_master_playlist(
    content: &str,
    playlist_uri: &str,
) -> Result<MasterPlaylist, DownloadError> {
    let base = parse_base(playlist_uri)?;
    let mut variants = Vec::new();
    let mut audios = Vec::new();
    let mut subtitles = Vec::new();
    let mut pending_variant: Option<HashMap<&str, &str>> = None;

    for line in manifest_lines(content) {
        if let Some(rest) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            pending_variant = Some(parse_attributes(rest));
            continue;
        }

        if !line.starts_with('#') {
            let Some(attrs) = pending_variant.take() else {
                continue;
            };
            let uri = match join(&base, line) {
                Ok(uri) => uri,
                Err(e) => {
                    warn!(error = %e, "Skipping variant with unresolvable URI");
                    continue;
                }
            };
            variants.push(Variant {
                uri,
                bandwidth: attrs.get("BANDWIDTH").and_then(|v| v.parse().ok()),
                resolution: parse_resolution(attrs.get("RESOLUTION").copied()),
                codecs: attrs.get("CODECS").map(|v| v.to_string()),
                audio_group_id: attrs.get("AUDIO").map(|v| v.to_string()),
                subtitle_group_id: attrs.get("SUBTITLES").map(|v| v.to_string()),
            });
            continue;
        }

        if let Some(rest) = line.strip_prefix("#EXT-X-MEDIA:") {
            let attrs = parse_attributes(rest);
            let (Some(kind), Some(uri)) = (attrs.get("TYPE"), attrs.get("URI")) else {
                continue;
            };
            let uri = match join(&base, uri) {
                Ok(uri) => uri,
                Err(e) => {
                    warn!(error = %e, "Skipping rendition with unresolvable URI");
                    continue;
                }
            };
            let track = MediaTrack {
                group_id: attrs.get("GROUP-ID").unwrap_or(&"").to_string(),
                name: attrs.get("NAME").map(|v| v.to_string()),
                language: attrs.get("LANGUAGE").map(|v| v.to_string()),
                uri,
                is_default: yes(attrs.get("DEFAULT")),
                is_auto_select: yes(attrs.get("AUTOSELECT")),
            };
            match *kind {
                "AUDIO" => audios.push(track),
                "SUBTITLES" => subtitles.push(track),
                other => trace!(kind = other, "Ignoring rendition type"),
            }
        }
    }

    Ok(MasterPlaylist {
        base_uri: playlist_uri.to_string(),
        variants,
        audios,
        subtitles,
    })
}

pub fn parse_media_playlist(
    content: &str,
    playlist_uri: &str,
) -> Result<MediaPlaylist, DownloadError> {
    let base = parse_base(playlist_uri)?;
    let mut segments = Vec::new();

    let mut target_duration: Option<f64> = None;
    let mut media_sequence = 0u64;
    let mut is_live = true;

    let mut current_key: Option<KeyInfo> = None;
    let mut current_map: Option<MapInfo> = None;
    let mut pending_byte_range: Option<ByteRange> = None;
    // Outer Option: an EXTINF was seen. Inner Option: it parsed.
    let mut pending_extinf: Option<Option<(f64, Option<String>)>> = None;
    let mut sequence = 0u64;

    for line in manifest_lines(content) {
        if let Some(rest) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            if let Ok(value) = rest.trim().parse::<f64>()
                && value.is_finite()
                && value >= 0.0
            {
                target_duration = Some(value);
            }
        } else if let Some(rest) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            if let Ok(value) = rest.trim().parse::<u64>() {
                media_sequence = value;
                sequence = value;
            }
        } else if let Some(rest) = line.strip_prefix("#EXT-X-KEY:") {
            let attrs = parse_attributes(rest);
            let method = attrs.get("METHOD").copied().unwrap_or_default();
            current_key = if method.eq_ignore_ascii_case("NONE") {
                None
            } else {
                Some(KeyInfo {
                    method: method.to_string(),
                    uri: attrs.get("URI").and_then(|u| join(&base, u).ok()),
                    iv: attrs.get("IV").map(|v| v.to_string()),
                    key_format: attrs.get("KEYFORMAT").map(|v| v.to_string()),
                    key_format_versions: attrs.get("KEYFORMATVERSIONS").map(|v| v.to_string()),
                })
            };
        } else if let Some(rest) = line.strip_prefix("#EXT-X-MAP:") {
            let attrs = parse_attributes(rest);
            if let Some(uri) = attrs.get("URI").and_then(|u| join(&base, u).ok()) {
                current_map = Some(MapInfo {
                    uri,
                    byte_range: parse_byte_range(attrs.get("BYTERANGE").copied()),
                });
            }
        } else if let Some(rest) = line.strip_prefix("#EXT-X-BYTERANGE:") {
            pending_byte_range = parse_byte_range(Some(rest));
        } else if let Some(rest) = line.strip_prefix("#EXTINF:") {
            pending_extinf = Some(parse_extinf(rest));
        } else if line.starts_with("#EXT-X-ENDLIST") {
            is_live = false;
        } else if line.starts_with('#') {
            continue;
        } else if let Some(extinf) = pending_extinf.take() {
            let byte_range = pending_byte_range.take();
            match (extinf, join(&base, line)) {
                (Some((duration, title)), Ok(uri)) => segments.push(Segment {
                    uri,
                    duration,
                    title,
                    sequence,
                    byte_range,
                    key: current_key.clone(),
                    map: current_map.clone(),
                }),
                (None, _) => warn!(sequence, uri = line, "Skipping segment with malformed EXTINF"),
                (_, Err(e)) => warn!(sequence, error = %e, "Skipping segment with unresolvable URI"),
            }
            sequence += 1;
        }
    }

    Ok(MediaPlaylist {
        base_uri: playlist_uri.to_string(),
        target_duration,
        media_sequence,
        segments,
        is_live,
    })
}
