// Playlist handling: parsing, live reload, DRM detection, track selection and
// plan building.

pub mod drm;
pub mod live;
pub mod manifest;
pub mod plan;
pub mod selection;

pub use drm::{DrmInfo, DrmSystem, detect_drm};
pub use live::{merge_live_playlist, next_reload_delay};
pub use manifest::{
    ByteRange, KeyInfo, MapInfo, MasterPlaylist, MediaPlaylist, MediaTrack, Resolution, Segment,
    Variant, parse_master_playlist, parse_media_playlist, resolve_uri,
};
pub use plan::{
    CookieInput, DownloadPlan, HttpPlaylistFetcher, PlanBuilder, PlanOptions, PlanRequest,
    PlaylistFetcher, TrackKind, TrackPlan,
};
pub use selection::{SelectedTracks, canonical_language, select_tracks};
