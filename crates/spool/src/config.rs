use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::proxy::ProxyConfig;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// HTTP client options shared by playlist, key and segment requests.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Overall timeout for a single HTTP request (zero disables it)
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Read timeout (maximum time between receiving data chunks)
    pub read_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// Headers sent with every request, before per-job headers are applied
    pub headers: HeaderMap,

    /// Proxy configuration (optional)
    pub proxy: Option<ProxyConfig>,

    /// Whether to use system proxy settings if available
    pub use_system_proxy: bool,

    /// Maximum idle connections to keep per host
    pub pool_max_idle_per_host: usize,

    /// Duration to keep idle connections alive before closing
    pub pool_idle_timeout: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(0),
            connect_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: DownloaderConfig::get_default_headers(),
            proxy: None,
            use_system_proxy: true,
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl DownloaderConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));

        default_headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5"),
        );
        default_headers
    }
}

/// Backoff parameters for segment retries.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts allowed per segment, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry. Actual delay = base * 2^attempt + jitter.
    pub base_delay: Duration,
    /// Hard cap on the computed delay.
    pub max_delay: Duration,
    /// Jitter is drawn uniformly from [0, ratio * unjittered delay].
    pub jitter_ratio: f64,
    /// Fixed seed for the jitter source; `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter_ratio: 0.2,
            seed: None,
        }
    }
}

/// Scheduling and resource options of the job downloader.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Segment fetches allowed in flight per job
    pub max_parallel: usize,
    /// Permanently failed segments tolerated before the whole job is failed
    pub failure_budget: u32,
    /// Fail the job on the first permanently failed segment
    pub strict_failures: bool,
    /// Interval of the background progress publisher
    pub progress_interval: Duration,
    /// Free space required when the download size is unknown (live streams)
    pub unknown_size_min_free_bytes: u64,
    /// Maximum number of decryption keys kept in memory
    pub key_cache_capacity: u64,
    /// Run AES decryption on the blocking thread pool
    pub decryption_offload: bool,
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: 3,
            failure_budget: 5,
            strict_failures: false,
            progress_interval: Duration::from_secs(1),
            unknown_size_min_free_bytes: 1024 * 1024 * 1024,
            key_cache_capacity: 100,
            decryption_offload: true,
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_failure_budget(mut self, budget: u32, strict: bool) -> Self {
        self.failure_budget = budget.max(1);
        self.strict_failures = strict;
        self
    }
}
