//! Peer model and the peer directory the propagation layer reads from

use crate::error::{LedgerError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub address: String,
    /// Overrides the configured peer port for this peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl Peer {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port: None,
        }
    }

    pub fn with_port(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port: Some(port),
        }
    }

    /// Accepts `host` or `host:port`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(LedgerError::Config("empty peer address".to_string()));
        }
        match raw.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port
                    .parse::<u16>()
                    .map_err(|e| LedgerError::Config(format!("bad port in peer {}: {}", raw, e)))?;
                Ok(Self::with_port(host, port))
            }
            _ => Ok(Self::new(raw)),
        }
    }

    pub fn base_url(&self, default_port: u16) -> String {
        format!("http://{}:{}", self.address, self.port.unwrap_or(default_port))
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.address, port),
            None => write!(f, "{}", self.address),
        }
    }
}

/// Source of the currently known peer set.
pub trait PeerDirectory: Send + Sync {
    fn get_peers(&self) -> Result<Vec<Peer>>;
}

/// In-memory peer directory seeded from configuration.
#[derive(Debug, Default)]
pub struct PeerBook {
    peers: RwLock<Vec<Peer>>,
}

impl PeerBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bootstrap(entries: &[String]) -> Result<Self> {
        let book = Self::new();
        for entry in entries {
            book.add_peer(Peer::parse(entry)?);
        }
        Ok(book)
    }

    /// Returns `false` when the peer was already known.
    pub fn add_peer(&self, peer: Peer) -> bool {
        let mut peers = self.peers.write();
        if peers.contains(&peer) {
            return false;
        }
        peers.push(peer);
        true
    }

    pub fn remove_peer(&self, peer: &Peer) -> bool {
        let mut peers = self.peers.write();
        let before = peers.len();
        peers.retain(|p| p != peer);
        peers.len() != before
    }

    pub fn clear(&self) {
        self.peers.write().clear();
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PeerDirectory for PeerBook {
    fn get_peers(&self) -> Result<Vec<Peer>> {
        Ok(self.peers.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peer() {
        assert_eq!(Peer::parse("10.0.0.5").unwrap(), Peer::new("10.0.0.5"));
        assert_eq!(
            Peer::parse("10.0.0.5:9000").unwrap(),
            Peer::with_port("10.0.0.5", 9000)
        );
        assert!(Peer::parse("10.0.0.5:http").is_err());
        assert!(Peer::parse("  ").is_err());
    }

    #[test]
    fn test_base_url() {
        assert_eq!(Peer::new("node-a").base_url(8090), "http://node-a:8090");
        assert_eq!(Peer::with_port("node-a", 1).base_url(8090), "http://node-a:1");
    }

    #[test]
    fn test_peer_book_dedups() {
        let book = PeerBook::from_bootstrap(&["a".to_string(), "b:1".to_string()]).unwrap();
        assert_eq!(book.len(), 2);
        assert!(!book.add_peer(Peer::new("a")));
        assert!(book.add_peer(Peer::with_port("a", 2)));
        assert!(book.remove_peer(&Peer::new("a")));
        assert_eq!(book.get_peers().unwrap().len(), 2);

        book.clear();
        assert!(book.is_empty());
    }
}
