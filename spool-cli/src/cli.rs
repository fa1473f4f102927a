use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};
use spool_engine::ProxyType;

#[derive(Parser, Debug)]
#[command(
    name = "spool",
    author,
    version,
    about = "Resumable HLS downloader",
    long_about = "Downloads the lowest-resolution rendition of an HLS stream, with the preferred \
                  audio and subtitle tracks, into per-segment files that survive interruption."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory holding persisted job records
    #[arg(long, global = true, env = "SPOOL_STATE_DIR", default_value = ".spool")]
    pub state_dir: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only print errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(flatten)]
    pub http: HttpArgs,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct HttpArgs {
    /// Connection timeout in seconds
    #[arg(long, global = true, default_value_t = 15)]
    pub connect_timeout: u64,

    /// Read timeout in seconds (maximum idle time between chunks)
    #[arg(long, global = true, default_value_t = 30)]
    pub read_timeout: u64,

    /// Custom user agent
    #[arg(long, global = true)]
    pub user_agent: Option<String>,

    /// Proxy server URL
    #[arg(long, global = true)]
    pub proxy: Option<String>,

    /// Proxy protocol
    #[arg(long, global = true, value_enum, default_value = "http")]
    pub proxy_type: ProxyType,

    /// Proxy username
    #[arg(long, global = true, requires = "proxy")]
    pub proxy_user: Option<String>,

    /// Proxy password
    #[arg(long, global = true, requires = "proxy_user")]
    pub proxy_pass: Option<String>,

    /// Ignore proxy settings from the environment
    #[arg(long, global = true)]
    pub no_system_proxy: bool,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct SourceArgs {
    /// Master playlist URL
    pub url: String,

    /// Extra request header as `Name: value` (repeatable)
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Cookie header value, e.g. "session=abc; region=us"
    #[arg(long)]
    pub cookies: Option<String>,

    /// Reloads allowed per live track before the plan is cut off
    #[arg(long, default_value_t = 5)]
    pub live_refresh_limit: u32,

    /// Upper bound in seconds on waiting for a live track to end
    #[arg(long)]
    pub max_live_wait: Option<u64>,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct EngineArgs {
    /// Segment fetches in flight per job
    #[arg(short = 'j', long, default_value_t = 3)]
    pub max_parallel: usize,

    /// Attempts per segment, including the first one
    #[arg(long, default_value_t = 5)]
    pub max_attempts: u32,

    /// Permanently failed segments tolerated before the job is failed
    #[arg(long, default_value_t = 5)]
    pub failure_budget: u32,

    /// Fail the job on the first permanently failed segment
    #[arg(long)]
    pub strict: bool,

    /// Free space in MiB required when the download size is unknown
    #[arg(long, default_value_t = 1024)]
    pub min_free_mb: u64,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resolve a master playlist into a download plan and print it as JSON
    Plan {
        #[command(flatten)]
        source: SourceArgs,
    },

    /// Plan and download a stream
    Download {
        #[command(flatten)]
        source: SourceArgs,

        #[command(flatten)]
        engine: EngineArgs,

        /// Parent directory of job output directories
        #[arg(short, long, env = "SPOOL_OUTPUT_DIR", default_value = "downloads")]
        output_dir: PathBuf,

        /// Job id (random when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Keep downloaded segments when the job fails
        #[arg(long)]
        keep_on_failure: bool,

        /// Keep downloaded segments when the job is canceled
        #[arg(long)]
        keep_on_cancel: bool,
    },

    /// Continue a paused or failed job from its stored plan
    Resume {
        id: String,

        #[command(flatten)]
        engine: EngineArgs,

        #[arg(short, long, env = "SPOOL_OUTPUT_DIR", default_value = "downloads")]
        output_dir: PathBuf,
    },

    /// Show persisted jobs
    List,

    /// Cancel a job, or remove a finished job's record and files
    Clean {
        id: String,

        #[arg(short, long, env = "SPOOL_OUTPUT_DIR", default_value = "downloads")]
        output_dir: PathBuf,

        /// Also delete completed segment files and concat lists
        #[arg(long)]
        all: bool,
    },
}
