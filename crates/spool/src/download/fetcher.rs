use std::io::ErrorKind;
use std::path::Path;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode, header};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, trace, warn};

use super::decryption::{DecryptionOffloader, KEY_LEN, KeyCache, segment_iv};
use super::request::{DownloadSegment, Headers};
use crate::client::header_map;
use crate::config::EngineConfig;
use crate::error::DownloadError;
use crate::hls::{ByteRange, KeyInfo};

/// Fetches one segment into `destination` and returns the file length once
/// the segment is complete.
///
/// `resume_bytes` is the length of a partial file left by an earlier attempt.
/// Implementations append to it for plain segments and restart from zero for
/// encrypted ones.
#[async_trait]
pub trait SegmentFetcher: Send + Sync {
    async fn fetch(
        &self,
        segment: &DownloadSegment,
        destination: &Path,
        headers: &Headers,
        resume_bytes: u64,
    ) -> Result<u64, DownloadError>;
}

/// Byte window of the response stream that belongs in the output file.
struct StreamWindow {
    skip: u64,
    remaining: Option<u64>,
}

impl StreamWindow {
    fn all() -> Self {
        Self {
            skip: 0,
            remaining: None,
        }
    }

    fn of(range: Option<&ByteRange>) -> Self {
        match range {
            Some(r) => Self {
                skip: r.start(),
                remaining: Some(r.length),
            },
            None => Self::all(),
        }
    }

    fn is_exhausted(&self) -> bool {
        self.remaining == Some(0)
    }

    fn take<'a>(&mut self, chunk: &'a [u8]) -> &'a [u8] {
        let skipped = (self.skip.min(chunk.len() as u64)) as usize;
        self.skip -= skipped as u64;
        let rest = &chunk[skipped..];
        match self.remaining.as_mut() {
            Some(remaining) => {
                let n = (*remaining).min(rest.len() as u64) as usize;
                *remaining -= n as u64;
                &rest[..n]
            }
            None => rest,
        }
    }
}

pub struct HttpSegmentFetcher {
    client: Client,
    keys: KeyCache,
    offloader: DecryptionOffloader,
}

impl HttpSegmentFetcher {
    pub fn new(client: Client, config: &EngineConfig) -> Self {
        Self {
            client,
            keys: KeyCache::new(config.key_cache_capacity),
            offloader: DecryptionOffloader::new(config.decryption_offload),
        }
    }

    pub fn key_cache(&self) -> &KeyCache {
        &self.keys
    }

    fn range_header(range: Option<&ByteRange>, resume: u64) -> Option<String> {
        match range {
            Some(r) => {
                let start = r.start() + resume;
                let end = r.start() + r.length - 1;
                Some(format!("bytes={start}-{end}"))
            }
            None if resume > 0 => Some(format!("bytes={resume}-")),
            None => None,
        }
    }

    async fn send(
        &self,
        url: &str,
        headers: &Headers,
        range: Option<&str>,
    ) -> Result<reqwest::Response, DownloadError> {
        let mut request = self.client.get(url).headers(header_map(headers)?);
        if let Some(range) = range {
            request = request.header(header::RANGE, range);
        }
        let response = request.send().await?;
        trace!(url, status = %response.status(), version = ?response.version(), "Response received");
        Ok(response)
    }

    async fn fetch_key(&self, uri: &str, headers: &Headers) -> Result<[u8; 16], DownloadError> {
        self.keys
            .get_or_fetch(uri, async {
                let response = self.send(uri, headers, None).await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(DownloadError::http_status(status, uri, "key fetch"));
                }
                let body = response.bytes().await?;
                if body.is_empty() {
                    return Err(DownloadError::EmptyBody {
                        url: uri.to_string(),
                        operation: "key fetch",
                    });
                }
                <[u8; KEY_LEN]>::try_from(body.as_ref()).map_err(|_| {
                    DownloadError::decryption(format!(
                        "key from {uri} has {} bytes, expected {KEY_LEN}",
                        body.len()
                    ))
                })
            })
            .await
    }

    async fn fetch_encrypted(
        &self,
        segment: &DownloadSegment,
        key: &KeyInfo,
        key_uri: &str,
        destination: &Path,
        headers: &Headers,
        resume_bytes: u64,
    ) -> Result<u64, DownloadError> {
        if resume_bytes > 0 {
            debug!(
                sequence = segment.sequence,
                resume_bytes, "Discarding partial file of encrypted segment"
            );
        }
        match tokio::fs::remove_file(destination).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let range = Self::range_header(segment.byte_range.as_ref(), 0);
        let response = self
            .send(&segment.uri, headers, range.as_deref())
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(status, &segment.uri, "segment fetch"));
        }

        let mut window = if range.is_some() && status == StatusCode::OK {
            warn!(url = %segment.uri, "Server ignored Range header, slicing full body");
            StreamWindow::of(segment.byte_range.as_ref())
        } else {
            StreamWindow::all()
        };
        let body = response.bytes().await?;
        let ciphertext = window.take(&body).to_vec();
        if ciphertext.is_empty() {
            return Err(DownloadError::EmptyBody {
                url: segment.uri.clone(),
                operation: "segment fetch",
            });
        }

        let key_bytes = self.fetch_key(key_uri, headers).await?;
        let iv = segment_iv(key, segment.sequence)?;
        let plaintext = self.offloader.decrypt(ciphertext, &key_bytes, &iv).await?;

        tokio::fs::write(destination, &plaintext).await?;
        Ok(plaintext.len() as u64)
    }

    async fn fetch_plain(
        &self,
        segment: &DownloadSegment,
        destination: &Path,
        headers: &Headers,
        resume_bytes: u64,
    ) -> Result<u64, DownloadError> {
        let byte_range = segment.byte_range.as_ref();
        if let Some(r) = byte_range
            && resume_bytes >= r.length
        {
            return Ok(resume_bytes);
        }

        let range = Self::range_header(byte_range, resume_bytes);
        let response = self
            .send(&segment.uri, headers, range.as_deref())
            .await?;
        let status = response.status();

        if status == StatusCode::RANGE_NOT_SATISFIABLE && byte_range.is_none() && resume_bytes > 0
        {
            debug!(
                sequence = segment.sequence,
                resume_bytes, "Partial file already holds the full segment"
            );
            return Ok(resume_bytes);
        }
        if !status.is_success() {
            return Err(DownloadError::http_status(status, &segment.uri, "segment fetch"));
        }

        // A 200 answer to a ranged request carries the whole resource: rewrite
        // the file from the start of the segment's window.
        let (mut window, append) = if range.is_some() && status == StatusCode::OK {
            warn!(url = %segment.uri, resume_bytes, "Server ignored Range header, rewriting segment");
            (StreamWindow::of(byte_range), false)
        } else {
            (StreamWindow::all(), resume_bytes > 0)
        };

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(destination)
            .await?;

        let mut written = 0u64;
        let mut received = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            received += chunk.len() as u64;
            let data = window.take(&chunk);
            if !data.is_empty() {
                file.write_all(data).await?;
                written += data.len() as u64;
            }
            if window.is_exhausted() {
                break;
            }
        }
        file.flush().await?;

        if received == 0 {
            return Err(DownloadError::EmptyBody {
                url: segment.uri.clone(),
                operation: "segment fetch",
            });
        }

        Ok(if append { resume_bytes + written } else { written })
    }
}

#[async_trait]
impl SegmentFetcher for HttpSegmentFetcher {
    #[instrument(skip_all, fields(sequence = segment.sequence, file_key = %segment.file_key))]
    async fn fetch(
        &self,
        segment: &DownloadSegment,
        destination: &Path,
        headers: &Headers,
        resume_bytes: u64,
    ) -> Result<u64, DownloadError> {
        match &segment.key {
            Some(key) if key.requires_key() => {
                let key_uri = key.uri.as_deref().unwrap_or_default();
                self.fetch_encrypted(segment, key, key_uri, destination, headers, resume_bytes)
                    .await
            }
            Some(key) if key.method.eq_ignore_ascii_case(KeyInfo::AES_128) => Err(
                DownloadError::decryption("AES-128 key tag without a key URI"),
            ),
            Some(key) => Err(DownloadError::decryption(format!(
                "unsupported encryption method `{}`",
                key.method
            ))),
            None => {
                self.fetch_plain(segment, destination, headers, resume_bytes)
                    .await
            }
        }
    }
}
