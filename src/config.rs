use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::Dispatch;
use tracing_subscriber::EnvFilter;

/// Count page views and unique visitors from the dig beacons in an access log.
#[derive(Debug, Clone, Parser)]
#[command(name = "dig-cruncher", version)]
pub struct Config {
    /// Access log to follow.
    #[arg(long, default_value = "/usr/local/var/logs/nginx/dig.log")]
    pub log_file_path: PathBuf,

    /// Number of parse/classify workers.
    #[arg(long, default_value_t = 5)]
    pub workers: usize,

    /// File to append diagnostics to. Defaults to stderr.
    #[arg(long)]
    pub run_log: Option<PathBuf>,

    /// Logging filter (trace, debug, info, warn, error, or a directive).
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// SQLite database holding the counters. Ignored with `--redis-url`.
    #[arg(long, default_value = "dig-counters.db")]
    pub store_path: PathBuf,

    /// Keep the counters in this Redis server instead of SQLite.
    #[arg(long, env = "DIG_CRUNCHER_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Read the log from the beginning instead of its current end.
    #[arg(long)]
    pub from_start: bool,

    /// How long to wait at end of file before reading again.
    #[arg(long, default_value_t = 3000)]
    pub poll_interval_ms: u64,

    /// Lifetime of each day's unique-visitor set.
    #[arg(long, default_value_t = 86_400)]
    pub uv_ttl_secs: u64,

    /// Period of the counting-store keep-alive ping.
    #[arg(long, default_value_t = 3)]
    pub keepalive_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_from(["dig-cruncher"])
    }
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.workers >= 1, "--workers must be at least 1");
        anyhow::ensure!(
            self.poll_interval_ms > 0,
            "--poll-interval-ms must be positive"
        );
        anyhow::ensure!(self.keepalive_secs > 0, "--keepalive-secs must be positive");
        anyhow::ensure!(self.uv_ttl_secs > 0, "--uv-ttl-secs must be positive");
        Ok(())
    }

    /// Capacity of the raw-line queue.
    pub fn line_queue(&self) -> usize {
        3 * self.workers
    }

    /// Capacity of the PV, UV and storage queues.
    pub fn count_queue(&self) -> usize {
        self.workers
    }

    pub fn store_connections(&self) -> usize {
        2 * self.workers
    }

    pub fn progress_every(&self) -> u64 {
        1000 * self.workers as u64
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn uv_ttl(&self) -> Duration {
        Duration::from_secs(self.uv_ttl_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    /// Build the diagnostics sink the pipeline logs through.
    ///
    /// The run-log file, if any, stays open until the returned dispatch and
    /// every clone of it are dropped.
    pub fn diagnostics(&self) -> anyhow::Result<Dispatch> {
        let filter = EnvFilter::try_new(&self.log_level)
            .with_context(|| format!("invalid log level: {}", self.log_level))?;
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true);
        let dispatch = match &self.run_log {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("can't open run log {}", path.display()))?;
                Dispatch::new(builder.with_ansi(false).with_writer(Mutex::new(file)).finish())
            }
            None => Dispatch::new(builder.with_writer(std::io::stderr).finish()),
        };
        Ok(dispatch)
    }
}
