//! Detection of DRM-protected playlists.
//!
//! Only presence is detected. Protected content cannot be downloaded by this
//! engine, so the plan builder refuses such tracks up front instead of
//! producing segment files that can never be decrypted.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::manifest::{manifest_lines, parse_attributes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DrmSystem {
    SampleAes,
    Widevine,
    PlayReady,
    FairPlay,
    Unknown,
}

impl DrmSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SampleAes => "sample-aes",
            Self::Widevine => "widevine",
            Self::PlayReady => "playready",
            Self::FairPlay => "fairplay",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DrmSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const KEYFORMAT_IDENTITY: &str = "identity";

const KEYFORMAT_SYSTEMS: [(&str, DrmSystem); 3] = [
    ("com.widevine", DrmSystem::Widevine),
    ("com.microsoft.playready", DrmSystem::PlayReady),
    ("com.apple.fps", DrmSystem::FairPlay),
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrmInfo {
    pub systems: BTreeSet<DrmSystem>,
}

impl DrmInfo {
    pub fn is_protected(&self) -> bool {
        !self.systems.is_empty()
    }

    /// Comma separated list of detected systems, for error messages.
    pub fn describe(&self) -> String {
        self.systems
            .iter()
            .map(DrmSystem::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Scan `EXT-X-KEY` and `EXT-X-SESSION-KEY` tags for DRM key methods and
/// key formats other than `identity`.
pub fn detect_drm(content: &str) -> DrmInfo {
    let mut info = DrmInfo::default();

    for line in manifest_lines(content) {
        let Some(raw) = line
            .strip_prefix("#EXT-X-KEY:")
            .or_else(|| line.strip_prefix("#EXT-X-SESSION-KEY:"))
        else {
            continue;
        };
        let attrs = parse_attributes(raw);

        if let Some(method) = attrs.get("METHOD") {
            let method = method.to_ascii_uppercase();
            if method == "SAMPLE-AES" || method == "SAMPLE-AES-CTR" {
                info.systems.insert(DrmSystem::SampleAes);
            }
        }

        let Some(key_format) = attrs.get("KEYFORMAT").map(|f| f.trim().to_ascii_lowercase())
        else {
            continue;
        };
        if key_format.is_empty() || key_format == KEYFORMAT_IDENTITY {
            continue;
        }
        let mut matched = false;
        for (prefix, system) in KEYFORMAT_SYSTEMS {
            if key_format.contains(prefix) {
                info.systems.insert(system);
                matched = true;
            }
        }
        if !matched {
            info.systems.insert(DrmSystem::Unknown);
        }
    }

    info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes_128_with_identity_format_is_not_drm() {
        let content = "#EXTM3U\n#EXT-X-KEY:METHOD=AES-128,URI=\"k\",KEYFORMAT=\"identity\"\n";
        assert!(!detect_drm(content).is_protected());
    }

    #[test]
    fn detects_sample_aes_and_known_key_formats() {
        let content = "#EXTM3U
#EXT-X-SESSION-KEY:METHOD=SAMPLE-AES,URI=\"skd://abc\",KEYFORMAT=\"com.apple.streamingkeydelivery\"
#EXT-X-KEY:METHOD=SAMPLE-AES-CTR,KEYFORMAT=\"urn:uuid:edef8ba9-79d6-4ace-a3c8-27dcd51d21ed\"
#EXT-X-KEY:METHOD=SAMPLE-AES,URI=\"data:...\",KEYFORMAT=\"com.widevine.alpha\"
";
        let info = detect_drm(content);
        assert!(info.is_protected());
        assert!(info.systems.contains(&DrmSystem::SampleAes));
        assert!(info.systems.contains(&DrmSystem::Widevine));
        assert!(info.systems.contains(&DrmSystem::Unknown));
        assert!(!info.systems.contains(&DrmSystem::PlayReady));
        assert_eq!(info.describe(), "sample-aes, widevine, unknown");
    }

    #[test]
    fn detects_fairplay_key_format() {
        let content = "#EXT-X-KEY:METHOD=SAMPLE-AES,URI=\"skd://x\",KEYFORMAT=\"COM.APPLE.FPS.1_0\"";
        let info = detect_drm(content);
        assert!(info.systems.contains(&DrmSystem::FairPlay));
    }
}
