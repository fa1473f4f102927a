// AES-128 segment decryption and the shared key cache.

use std::future::Future;
use std::sync::Arc;

use aes::Aes128;
use cipher::{BlockModeDecrypt, KeyIvInit, block_padding::Pkcs7};
use moka::future::Cache;
use moka::policy::EvictionPolicy;
use tracing::debug;

use crate::error::DownloadError;
use crate::hls::KeyInfo;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

pub const KEY_LEN: usize = 16;

/// Parse a hex IV as written in `EXT-X-KEY` (`0x` prefix optional).
pub fn parse_iv(iv_hex: &str) -> Result<[u8; 16], DownloadError> {
    let trimmed = iv_hex.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let mut iv = [0u8; 16];
    hex::decode_to_slice(digits, &mut iv)
        .map_err(|e| DownloadError::decryption(format!("malformed IV `{iv_hex}`: {e}")))?;
    Ok(iv)
}

/// IV used when the key tag carries none: the media sequence number as a
/// 16-byte big-endian integer.
pub fn sequence_iv(sequence: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&sequence.to_be_bytes());
    iv
}

pub fn segment_iv(key: &KeyInfo, sequence: u64) -> Result<[u8; 16], DownloadError> {
    match &key.iv {
        Some(iv) => parse_iv(iv),
        None => Ok(sequence_iv(sequence)),
    }
}

/// Decrypt AES-128-CBC with PKCS#7 padding in place.
pub fn decrypt_aes128_cbc(
    mut data: Vec<u8>,
    key: &[u8; 16],
    iv: &[u8; 16],
) -> Result<Vec<u8>, DownloadError> {
    let cipher = Aes128CbcDec::new_from_slices(key, iv).map_err(|e| {
        DownloadError::decryption(format!("failed to initialize AES decryptor: {e}"))
    })?;
    let plain_len = cipher
        .decrypt_padded::<Pkcs7>(&mut data)
        .map_err(|e| DownloadError::decryption(format!("decryption failed: {e}")))?
        .len();
    data.truncate(plain_len);
    Ok(data)
}

/// Runs decryption inline or on tokio's blocking pool.
#[derive(Debug, Clone, Copy)]
pub struct DecryptionOffloader {
    enabled: bool,
}

impl DecryptionOffloader {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub async fn decrypt(
        &self,
        data: Vec<u8>,
        key: &[u8; 16],
        iv: &[u8; 16],
    ) -> Result<Vec<u8>, DownloadError> {
        if !self.enabled {
            return decrypt_aes128_cbc(data, key, iv);
        }
        let key = *key;
        let iv = *iv;
        tokio::task::spawn_blocking(move || decrypt_aes128_cbc(data, &key, &iv))
            .await
            .map_err(|e| DownloadError::decryption(format!("decryption task failed: {e}")))?
    }
}

/// Bounded LRU of decryption keys by key URI.
///
/// Concurrent lookups of a missing key are coalesced: exactly one caller runs
/// the fetch and every waiter receives its result. Failed fetches are not
/// cached.
#[derive(Clone)]
pub struct KeyCache {
    keys: Cache<String, [u8; 16]>,
}

impl KeyCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            keys: Cache::builder()
                .max_capacity(capacity.max(1))
                .eviction_policy(EvictionPolicy::lru())
                .build(),
        }
    }

    pub async fn get_or_fetch<F>(&self, uri: &str, fetch: F) -> Result<[u8; 16], DownloadError>
    where
        F: Future<Output = Result<[u8; 16], DownloadError>>,
    {
        self.keys
            .try_get_with(uri.to_string(), async {
                debug!(url = uri, "Fetching decryption key");
                fetch.await
            })
            .await
            .map_err(|shared| unshare_error(uri, shared))
    }

    pub async fn get(&self, uri: &str) -> Option<[u8; 16]> {
        self.keys.get(uri).await
    }

    pub async fn clear(&self) {
        self.keys.invalidate_all();
        self.keys.run_pending_tasks().await;
    }
}

/// Recover an owned error from a coalesced key fetch. Waiters that share the
/// error get an equivalent copy with the same classification.
fn unshare_error(uri: &str, shared: Arc<DownloadError>) -> DownloadError {
    match Arc::try_unwrap(shared) {
        Ok(owned) => owned,
        Err(shared) => match shared.as_ref() {
            DownloadError::HttpStatus {
                status,
                url,
                operation,
            } => DownloadError::http_status(*status, url.clone(), *operation),
            DownloadError::EmptyBody { url, operation } => DownloadError::EmptyBody {
                url: url.clone(),
                operation: *operation,
            },
            DownloadError::Decryption { reason } => DownloadError::decryption(reason.clone()),
            DownloadError::Cancelled => DownloadError::Cancelled,
            other => DownloadError::KeyFetch {
                url: uri.to_string(),
                reason: other.to_string(),
            },
        },
    }
}
