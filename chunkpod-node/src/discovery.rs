//! Subnet discovery: probe every host in the configured range with a CONNECT handshake,
//! concurrently and each under its own timeout; responders join the peer registry.

use std::net::{IpAddr, Ipv4Addr};

use chunkpod_core::{Message, Node};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::transport::{Connection, TransportError};

/// Shortest prefix accepted for a scan (/16 = 65 534 hosts).
pub const MIN_SCAN_PREFIX: u8 = 16;

/// First non-loopback interface with an IPv4 address.
pub fn usable_interface() -> Result<(String, Ipv4Addr), DiscoveryError> {
    let interfaces = local_ip_address::list_afinet_netifas()
        .map_err(|e| DiscoveryError::Interfaces(e.to_string()))?;
    interfaces
        .into_iter()
        .find_map(|(name, ip)| match ip {
            IpAddr::V4(v4) if name != "lo" && !v4.is_loopback() => Some((name, v4)),
            _ => None,
        })
        .ok_or(DiscoveryError::NoUsableInterface)
}

/// This node's address on the first usable interface. Scanning needs a real interface,
/// so its absence is an error then; otherwise the node falls back to loopback.
pub fn local_node(port: u16, scanning: bool) -> Result<Node, DiscoveryError> {
    resolve_local(usable_interface(), port, scanning)
}

fn resolve_local(
    found: Result<(String, Ipv4Addr), DiscoveryError>,
    port: u16,
    scanning: bool,
) -> Result<Node, DiscoveryError> {
    match found {
        Ok((name, ip)) => {
            info!(interface = %name, %ip, "using interface");
            Ok(Node::new(ip, port))
        }
        Err(e) if !scanning => {
            warn!(error = %e, "no usable interface, using loopback");
            Ok(Node::new(Ipv4Addr::LOCALHOST, port))
        }
        Err(e) => Err(e),
    }
}

/// Host addresses of the `/prefix_len` network containing `addr`: network and broadcast
/// addresses, the 240.0.0.0/4 reserved block and `addr` itself are excluded.
pub fn scan_range(addr: Ipv4Addr, prefix_len: u8) -> Result<Vec<Ipv4Addr>, DiscoveryError> {
    if !(MIN_SCAN_PREFIX..=32).contains(&prefix_len) {
        return Err(DiscoveryError::Prefix(prefix_len));
    }
    let mask = if prefix_len == 32 {
        u32::MAX
    } else {
        !(u32::MAX >> prefix_len)
    };
    let network = u32::from(addr) & mask;
    let broadcast = network | !mask;
    if broadcast - network < 2 {
        return Ok(Vec::new());
    }
    Ok((network + 1..broadcast)
        .map(Ipv4Addr::from)
        .filter(|ip| *ip != addr && !is_reserved(*ip))
        .collect())
}

fn is_reserved(ip: Ipv4Addr) -> bool {
    ip.octets()[0] >= 240
}

impl Client {
    /// Connect to `node`, announce ourselves with CONNECT and consume the PEER list up to
    /// TERMINATE. On success the node joins the registry; returns the peers it advertised.
    /// The whole attempt is bounded by the connect timeout.
    pub async fn attempt_connection(&self, node: Node) -> Result<Vec<Node>, TransportError> {
        let timeout = self.settings.connect_timeout;
        let local = self.local();
        let advertised = tokio::time::timeout(timeout, async move {
            let mut conn = Connection::connect(node, timeout).await?;
            conn.send(&Message::Connect { node: local }).await?;
            let replies = conn.recv_until_terminate().await?;
            conn.close().await;
            Ok::<_, TransportError>(
                replies
                    .into_iter()
                    .filter_map(|m| match m {
                        Message::Peer { node } => Some(node),
                        _ => None,
                    })
                    .collect::<Vec<_>>(),
            )
        })
        .await
        .map_err(|_| TransportError::Timeout)??;

        if self.registry.insert(node).await {
            info!(peer = %node, "unrecognized peer, updating entries");
        }
        Ok(advertised)
    }

    /// Probe every address on `port` concurrently. A failed or timed-out attempt means
    /// "peer absent". Returns the number of peers that answered.
    pub async fn attempt_connections(
        &self,
        hosts: impl IntoIterator<Item = Ipv4Addr>,
        port: u16,
    ) -> usize {
        let mut tasks = JoinSet::new();
        for host in hosts {
            let client = self.clone();
            let node = Node::new(host, port);
            tasks.spawn(async move { (node, client.attempt_connection(node).await) });
        }
        let mut found = 0;
        while let Some(joined) = tasks.join_next().await {
            let Ok((node, result)) = joined else {
                continue;
            };
            match result {
                Ok(advertised) => {
                    found += 1;
                    if !advertised.is_empty() {
                        debug!(peer = %node, advertised = ?advertised, "peer list received");
                    }
                }
                Err(e) => debug!(peer = %node, error = %e, "no peer"),
            }
        }
        let total = self.registry.len().await;
        info!(responded = found, total, "discovery finished");
        found
    }

    /// Scan the `/prefix_len` network around the local address on `port`.
    pub async fn discover(&self, prefix_len: u8, port: u16) -> Result<usize, DiscoveryError> {
        let local = self.local().ip;
        if local.is_loopback() || local.is_unspecified() {
            return Err(DiscoveryError::NoUsableInterface);
        }
        let hosts = scan_range(local, prefix_len)?;
        info!(hosts = hosts.len(), prefix = prefix_len, "scanning subnet");
        Ok(self.attempt_connections(hosts, port).await)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("listing network interfaces: {0}")]
    Interfaces(String),
    #[error("no usable network interface")]
    NoUsableInterface,
    #[error("scan prefix /{0} out of range (/16../32)")]
    Prefix(u8),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientSettings;
    use crate::registry::PeerRegistry;
    use std::time::{Duration, Instant};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn client() -> Client {
        let settings = ClientSettings {
            connect_timeout: Duration::from_millis(500),
            ..ClientSettings::default()
        };
        Client::new(
            PeerRegistry::new(Node::new(Ipv4Addr::new(127, 0, 0, 2), 1)),
            settings,
        )
    }

    #[test]
    fn slash_24_has_253_candidates() {
        let local = Ipv4Addr::new(192, 168, 77, 23);
        let hosts = scan_range(local, 24).unwrap();
        assert_eq!(hosts.len(), 253);
        assert_eq!(hosts[0], Ipv4Addr::new(192, 168, 77, 1));
        assert_eq!(*hosts.last().unwrap(), Ipv4Addr::new(192, 168, 77, 254));
        assert!(!hosts.contains(&local));
    }

    #[test]
    fn reserved_and_bad_prefixes() {
        assert!(scan_range(Ipv4Addr::new(250, 0, 0, 1), 24).unwrap().is_empty());
        assert!(matches!(
            scan_range(Ipv4Addr::new(10, 0, 0, 1), 8),
            Err(DiscoveryError::Prefix(8))
        ));
        assert!(scan_range(Ipv4Addr::new(10, 0, 0, 1), 31).unwrap().is_empty());
        assert_eq!(scan_range(Ipv4Addr::new(10, 0, 0, 1), 30).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn handshake_adds_peer_and_returns_list() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let advertised = Node::new(Ipv4Addr::new(10, 0, 0, 10), 3000);
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (r, mut w) = stream.split();
            let mut reader = crate::transport::FrameReader::new(r);
            let msg = reader.read_message().await.unwrap();
            assert!(matches!(msg, Message::Connect { .. }));
            w.write_all(&Message::Peer { node: advertised }.encode().unwrap())
                .await
                .unwrap();
            w.write_all(b"TER:\n").await.unwrap();
        });

        let client = client();
        let node = Node::new(Ipv4Addr::LOCALHOST, port);
        let peers = client.attempt_connection(node).await.unwrap();
        assert_eq!(peers, vec![advertised]);
        assert!(client.registry().contains(&node).await);
        assert!(!client.registry().contains(&advertised).await);
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accepts but never answers.
        let _hold = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        let client = client();
        let started = Instant::now();
        let err = client
            .attempt_connection(Node::new(Ipv4Addr::LOCALHOST, port))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(client.registry().len().await, 0);
    }

    #[tokio::test]
    async fn fan_out_counts_only_responders() {
        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = live.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = live.accept().await.unwrap();
            let (r, mut w) = stream.split();
            let mut reader = crate::transport::FrameReader::new(r);
            let _ = reader.read_message().await;
            w.write_all(b"TER:\n").await.unwrap();
        });
        let client = client();
        let hosts = [Ipv4Addr::LOCALHOST, Ipv4Addr::new(127, 0, 0, 3)];
        let found = client.attempt_connections(hosts, port).await;
        assert_eq!(found, 1);
        assert_eq!(
            client.registry().snapshot().await,
            vec![Node::new(Ipv4Addr::LOCALHOST, port)]
        );
    }

    #[test]
    fn local_node_needs_interface_only_for_scanning() {
        let found = Ok(("eth0".to_string(), Ipv4Addr::new(192, 168, 1, 20)));
        assert_eq!(
            resolve_local(found, 3000, true).unwrap(),
            Node::new(Ipv4Addr::new(192, 168, 1, 20), 3000)
        );
        assert_eq!(
            resolve_local(Err(DiscoveryError::NoUsableInterface), 3000, false).unwrap(),
            Node::new(Ipv4Addr::LOCALHOST, 3000)
        );
        assert!(matches!(
            resolve_local(Err(DiscoveryError::NoUsableInterface), 3000, true),
            Err(DiscoveryError::NoUsableInterface)
        ));
    }

    #[tokio::test]
    async fn discover_from_loopback_is_refused() {
        let client = client();
        let task = tokio::spawn(async move { client.discover(24, 3000).await });
        assert!(matches!(
            task.await.unwrap(),
            Err(DiscoveryError::NoUsableInterface)
        ));
    }
}
