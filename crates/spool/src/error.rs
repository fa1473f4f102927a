use std::fmt;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

/// Error classes surfaced to the application in error events and in the
/// persisted `last_error` of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCode {
    Network,
    Storage,
    Decryption,
    Validation,
    Constraints,
    Unexpected,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Storage => "storage",
            Self::Decryption => "decryption",
            Self::Validation => "validation",
            Self::Constraints => "constraints",
            Self::Unexpected => "unexpected",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("proxy configuration error: {reason}")]
    ProxyConfiguration { reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("empty response body during {operation} for {url}")]
    EmptyBody {
        url: String,
        operation: &'static str,
    },

    #[error("key fetch failed for {url}: {reason}")]
    KeyFetch { url: String, reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("insufficient disk space: {available} bytes available, {required} bytes required")]
    InsufficientSpace { available: u64, required: u64 },

    #[error("state store error: {reason}")]
    State { reason: String },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("master playlist has no variants")]
    NoVariants,

    #[error("content is DRM protected ({systems})")]
    DrmProtected { systems: String },

    #[error("decryption error: {reason}")]
    Decryption { reason: String },

    #[error("invalid segment: {reason}")]
    Validation { reason: String },

    #[error("job constraints not met: {reason}")]
    Constraints { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl DownloadError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    pub fn decryption(reason: impl Into<String>) -> Self {
        Self::Decryption {
            reason: reason.into(),
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub fn state(reason: impl Into<String>) -> Self {
        Self::State {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Error class reported to listeners and persisted with the job.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Network { .. }
            | Self::HttpStatus { .. }
            | Self::EmptyBody { .. }
            | Self::KeyFetch { .. }
            | Self::Playlist { .. } => ErrorCode::Network,
            Self::Io { .. } | Self::InsufficientSpace { .. } | Self::State { .. } => {
                ErrorCode::Storage
            }
            Self::Decryption { .. } => ErrorCode::Decryption,
            Self::InvalidUrl { .. }
            | Self::NoVariants
            | Self::DrmProtected { .. }
            | Self::Validation { .. }
            | Self::ProxyConfiguration { .. }
            | Self::Configuration { .. } => ErrorCode::Validation,
            Self::Constraints { .. } => ErrorCode::Constraints,
            Self::Cancelled | Self::Serialization { .. } | Self::Internal { .. } => {
                ErrorCode::Unexpected
            }
        }
    }

    /// Whether a segment attempt that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { source } => is_retryable_reqwest_error(source),
            Self::HttpStatus { .. }
            | Self::EmptyBody { .. } | Self::KeyFetch { .. } | Self::Playlist { .. } => true,
            Self::Cancelled
            | Self::InvalidUrl { .. }
            | Self::ProxyConfiguration { .. }
            | Self::Io { .. }
            | Self::InsufficientSpace { .. }
            | Self::State { .. }
            | Self::NoVariants
            | Self::DrmProtected { .. }
            | Self::Decryption { .. }
            | Self::Validation { .. }
            | Self::Constraints { .. }
            | Self::Configuration { .. }
            | Self::Serialization { .. }
            | Self::Internal { .. } => false,
        }
    }
}

/// Transport failures are retried; a request that could not be built fails
/// the same way on every attempt.
pub fn is_retryable_reqwest_error(e: &reqwest::Error) -> bool {
    !e.is_builder()
}
