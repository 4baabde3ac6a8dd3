//! Client role: the state shared by discovery, upload and download.

use std::path::PathBuf;
use std::time::Duration;

use chunkpod_core::scheduler::MAX_SHARING_PEERS;
use chunkpod_core::Node;

use crate::config::Config;
use crate::registry::PeerRegistry;

/// Tunables for the client-side pipelines.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub connect_timeout: Duration,
    pub max_sharing_peers: usize,
    pub retry_backoff: (Duration, Duration),
    pub output_dir: PathBuf,
}

impl ClientSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            connect_timeout: cfg.connect_timeout(),
            max_sharing_peers: cfg.max_sharing_peers.max(1),
            retry_backoff: cfg.retry_backoff(),
            output_dir: cfg.output_dir.clone(),
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            max_sharing_peers: MAX_SHARING_PEERS,
            retry_backoff: (Duration::from_millis(500), Duration::from_millis(1500)),
            output_dir: PathBuf::from("."),
        }
    }
}

/// Owns a handle to the node's peer registry; discovery fills it, upload and download read it.
#[derive(Debug, Clone)]
pub struct Client {
    pub(crate) registry: PeerRegistry,
    pub(crate) settings: ClientSettings,
}

impl Client {
    pub fn new(registry: PeerRegistry, settings: ClientSettings) -> Self {
        Self { registry, settings }
    }

    pub fn local(&self) -> Node {
        self.registry.local()
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }
}
