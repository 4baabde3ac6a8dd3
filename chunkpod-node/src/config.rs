//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chunkpod_core::scheduler::MAX_SHARING_PEERS;
use chunkpod_core::Node;
use serde::Deserialize;

/// Node configuration. File: ~/.config/chunkpod/config.toml or /etc/chunkpod/config.toml.
/// Env overrides: CHUNKPOD_PORT, CHUNKPOD_DB, CHUNKPOD_WORKERS, CHUNKPOD_SCAN_PREFIX, CHUNKPOD_OUTPUT_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP port every node listens on (default 3000).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Prefix length of the discovery scan around the local address (default 24).
    #[serde(default = "default_scan_prefix_len")]
    pub scan_prefix_len: u8,
    /// Per-attempt connect timeout (default 5s).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Server closes a connection idle this long (default 30s).
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Server worker pool size (default 3).
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// SQLite chunk store path.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Directory reconstructed downloads are written to.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Cap on peers receiving chunks of one upload (default 4).
    #[serde(default = "default_max_sharing_peers")]
    pub max_sharing_peers: usize,
    #[serde(default = "default_retry_backoff_min_ms")]
    pub retry_backoff_min_ms: u64,
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
    /// Peers seeded into the registry at startup ("a.b.c.d:port").
    #[serde(default)]
    pub peers: Vec<Node>,
}

fn default_port() -> u16 {
    3000
}
fn default_scan_prefix_len() -> u8 {
    24
}
fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_idle_timeout_secs() -> u64 {
    30
}
fn default_workers() -> usize {
    3
}
fn default_db_path() -> PathBuf {
    PathBuf::from("file_chunks.db")
}
fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_max_sharing_peers() -> usize {
    MAX_SHARING_PEERS
}
fn default_retry_backoff_min_ms() -> u64 {
    500
}
fn default_retry_backoff_max_ms() -> u64 {
    1500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            scan_prefix_len: default_scan_prefix_len(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            workers: default_workers(),
            db_path: default_db_path(),
            output_dir: default_output_dir(),
            max_sharing_peers: default_max_sharing_peers(),
            retry_backoff_min_ms: default_retry_backoff_min_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
            peers: Vec::new(),
        }
    }
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Randomized backoff range before the single upload retry.
    pub fn retry_backoff(&self) -> (Duration, Duration) {
        let min = self.retry_backoff_min_ms.min(self.retry_backoff_max_ms);
        (
            Duration::from_millis(min),
            Duration::from_millis(self.retry_backoff_max_ms),
        )
    }

    fn apply_env(&mut self) {
        if let Some(p) = env_parse::<u16>("CHUNKPOD_PORT") {
            self.port = p;
        }
        if let Ok(s) = std::env::var("CHUNKPOD_DB") {
            self.db_path = PathBuf::from(s);
        }
        if let Some(n) = env_parse::<usize>("CHUNKPOD_WORKERS") {
            self.workers = n;
        }
        if let Some(n) = env_parse::<u8>("CHUNKPOD_SCAN_PREFIX") {
            self.scan_prefix_len = n;
        }
        if let Ok(s) = std::env::var("CHUNKPOD_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(s);
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// Load config: an explicit path must exist and parse. Otherwise merge default, then the
/// first config file found (if any), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => parse_file(path)?,
        None => load_file().unwrap_or_default(),
    };
    c.apply_env();
    if c.workers == 0 {
        c.workers = 1;
    }
    Ok(c)
}

pub fn parse_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str::<Config>(&s).with_context(|| format!("parsing config {}", path.display()))
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/chunkpod/config.toml"));
    }
    out.push(PathBuf::from("/etc/chunkpod/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match parse_file(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "ignoring config file");
            None
        }
    }
}
