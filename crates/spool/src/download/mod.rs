//! Segment download pipeline: fetching, decryption, retries and the job
//! scheduler that ties them to the state store.

mod constraints;
mod decryption;
mod events;
mod fetcher;
mod job;
mod layout;
mod request;
mod retry;

pub use constraints::{
    ConstraintChecker, ConstraintResult, DiskSpaceProbe, HostConstraintChecker,
    NoopConstraintChecker, SysinfoDiskProbe,
};
pub use decryption::{KeyCache, decrypt_aes128_cbc, parse_iv, sequence_iv};
pub use events::{ChannelListener, JobError, JobEvent, JobListener, JobProgress};
pub use fetcher::{HttpSegmentFetcher, SegmentFetcher};
pub use job::{DownloadOutcome, JobDownloader};
pub use layout::{
    cleanup_files, concat_list_path, map_complete_path, segment_complete_path,
    segment_partial_path,
};
pub use request::{
    CleanupPolicy, DownloadRequest, DownloadSegment, Headers, JobConstraints, SegmentMap,
    map_file_key, segment_file_key, validate_segment, validate_segments,
};
pub use retry::RetryPolicy;
