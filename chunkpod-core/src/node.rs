//! Node identity: an IPv4 address and port with a fixed 6-byte wire encoding.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Encoded length: 4 bytes address + 2 bytes port, both big-endian.
pub const NODE_LEN: usize = 6;

/// A peer address. Used as Peer Registry key and as the `next_node` chunk field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Node {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Node {
    /// `0.0.0.0:0`, marks "no successor" in chained-distribution metadata.
    pub const NULL: Node = Node {
        ip: Ipv4Addr::UNSPECIFIED,
        port: 0,
    };

    pub const fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    pub fn encode(&self) -> [u8; NODE_LEN] {
        let mut out = [0u8; NODE_LEN];
        out[..4].copy_from_slice(&self.ip.octets());
        out[4..].copy_from_slice(&self.port.to_be_bytes());
        out
    }

    /// Decode from exactly [`NODE_LEN`] bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, NodeDecodeError> {
        if bytes.len() != NODE_LEN {
            return Err(NodeDecodeError::Length(bytes.len()));
        }
        let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        let port = u16::from_be_bytes([bytes[4], bytes[5]]);
        Ok(Self { ip, port })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl From<SocketAddrV4> for Node {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for Node {
    type Err = NodeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr: SocketAddrV4 = s
            .trim()
            .parse()
            .map_err(|_| NodeParseError(s.to_string()))?;
        Ok(addr.into())
    }
}

// Config files list peers as "a.b.c.d:port" strings.
impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NodeDecodeError {
    #[error("node encoding must be 6 bytes, got {0}")]
    Length(usize),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid peer address {0:?}, expected a.b.c.d:port")]
pub struct NodeParseError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_is_big_endian() {
        let node = Node::new(Ipv4Addr::new(10, 0, 0, 7), 3000);
        assert_eq!(node.encode(), [10, 0, 0, 7, 0x0b, 0xb8]);
    }

    #[test]
    fn roundtrip() {
        let node = Node::new(Ipv4Addr::new(192, 168, 77, 23), 12345);
        assert_eq!(Node::decode(&node.encode()).unwrap(), node);
        assert_eq!(Node::decode(&Node::NULL.encode()).unwrap(), Node::NULL);
    }

    #[test]
    fn decode_rejects_wrong_length() {
        assert_eq!(Node::decode(&[1, 2, 3]), Err(NodeDecodeError::Length(3)));
        assert_eq!(Node::decode(&[0; 7]), Err(NodeDecodeError::Length(7)));
    }

    #[test]
    fn null_node() {
        assert!(Node::NULL.is_null());
        assert_eq!(Node::NULL.encode(), [0; NODE_LEN]);
        assert!(!Node::new(Ipv4Addr::LOCALHOST, 0).is_null());
    }

    #[test]
    fn parse_and_display() {
        let node: Node = "127.0.0.1:3000".parse().unwrap();
        assert_eq!(node, Node::new(Ipv4Addr::LOCALHOST, 3000));
        assert_eq!(node.to_string(), "127.0.0.1:3000");
        assert!("127.0.0.1".parse::<Node>().is_err());
        assert!("localhost:3000".parse::<Node>().is_err());
    }

    #[test]
    fn deserialize_from_config_string() {
        #[derive(serde::Deserialize)]
        struct Peers {
            peers: Vec<Node>,
        }
        let parsed: Peers = toml::from_str(r#"peers = ["10.0.0.2:3000", "10.0.0.3:4000"]"#).unwrap();
        assert_eq!(parsed.peers[1], Node::new(Ipv4Addr::new(10, 0, 0, 3), 4000));
        assert!(toml::from_str::<Peers>(r#"peers = ["10.0.0.2"]"#).is_err());
    }

    #[test]
    fn structural_equality_and_hash() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(Node::new(Ipv4Addr::new(10, 0, 0, 1), 3000));
        set.insert(Node::new(Ipv4Addr::new(10, 0, 0, 1), 3000));
        set.insert(Node::new(Ipv4Addr::new(10, 0, 0, 1), 3001));
        assert_eq!(set.len(), 2);
    }
}
