//! Peer roster for the table server
//!
//! This module tracks every transport connection the server has accepted:
//! - Client id assignment (first free id in `[0, 255)`)
//! - Handshake progress and nick registration
//! - Admin rights granted through `Login`
//! - The unreliable stream address and last measured round trip
//!
//! A client id belongs to exactly one live peer. When a peer leaves, its id
//! returns to the pool and may be handed to the next connection; the peer
//! record itself is never reused.

use log::info;
use shared::{ClientId, IdPool, RosterEntry, RttEntry, CLIENT_CAPACITY, MAX_NICK_LEN};
use std::collections::HashMap;
use std::net::SocketAddr;
use thiserror::Error;

/// Where a peer is in its connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Transport is up, no successful handshake yet
    AwaitingHandshake,
    /// Handshake accepted; the peer sees and may change the table
    Joined,
    /// Disconnected; kept only in records handed back to the caller
    Left,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("client {0} is not connected")]
    UnknownClient(ClientId),
    #[error("client {0} has already joined")]
    AlreadyJoined(ClientId),
    #[error("nick {0:?} is not allowed")]
    InvalidNick(String),
    #[error("nick {0:?} is already taken")]
    NickTaken(String),
}

/// A connected peer and its session metadata
#[derive(Debug, Clone)]
pub struct Peer {
    /// Client id assigned at connect time
    pub id: ClientId,
    /// Remote address of the reliable connection
    pub addr: SocketAddr,
    /// Nick, set once the handshake succeeds
    pub nick: Option<String>,
    pub state: PeerState,
    pub is_admin: bool,
    /// Last round trip measured on the stream channel
    pub rtt_ms: u16,
    /// Address the peer's stream datagrams come from
    pub stream_addr: Option<SocketAddr>,
}

impl Peer {
    pub fn new(id: ClientId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            nick: None,
            state: PeerState::AwaitingHandshake,
            is_admin: false,
            rtt_ms: 0,
            stream_addr: None,
        }
    }

    pub fn is_joined(&self) -> bool {
        self.state == PeerState::Joined
    }
}

/// Checks a nick for length and printable content
///
/// Nicks must be 1 to 16 bytes, contain no control characters and not start
/// or end with whitespace.
pub fn validate_nick(nick: &str) -> bool {
    !nick.is_empty()
        && nick.len() <= MAX_NICK_LEN
        && nick.trim() == nick
        && !nick.chars().any(char::is_control)
}

/// Manages all connected peers
///
/// Joined peers are the broadcast audience; peers still awaiting their
/// handshake hold a client id but receive nothing except direct replies.
pub struct ClientManager {
    /// Live peers indexed by client id
    peers: HashMap<ClientId, Peer>,
    /// Client id allocator
    ids: IdPool<ClientId>,
}

impl Default for ClientManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientManager {
    pub fn new() -> Self {
        Self::with_capacity(CLIENT_CAPACITY)
    }

    /// Creates a roster holding at most `capacity` peers (never more than 255)
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            peers: HashMap::new(),
            ids: IdPool::new(capacity.min(CLIENT_CAPACITY)),
        }
    }

    /// Registers a new transport connection
    ///
    /// Returns the assigned client id, or None when every id is in use.
    pub fn add_client(&mut self, addr: SocketAddr) -> Option<ClientId> {
        let id = self.ids.allocate()?;
        info!("Client {} connected from {}", id, addr);
        self.peers.insert(id, Peer::new(id, addr));
        Some(id)
    }

    /// Completes the handshake of `id` under `nick`
    ///
    /// Nicks are unique among joined peers only; a peer still awaiting its
    /// handshake does not reserve anything.
    pub fn join(&mut self, id: ClientId, nick: &str) -> Result<(), JoinError> {
        match self.peers.get(&id) {
            None => return Err(JoinError::UnknownClient(id)),
            Some(peer) if peer.is_joined() => return Err(JoinError::AlreadyJoined(id)),
            Some(_) => {}
        }
        if !validate_nick(nick) {
            return Err(JoinError::InvalidNick(nick.to_string()));
        }
        if self.find_by_nick(nick).is_some() {
            return Err(JoinError::NickTaken(nick.to_string()));
        }

        if let Some(peer) = self.peers.get_mut(&id) {
            peer.nick = Some(nick.to_string());
            peer.state = PeerState::Joined;
            info!("Client {} joined as {:?}", id, nick);
        }
        Ok(())
    }

    /// Drops a peer and frees its id
    ///
    /// Returns the peer record marked as `Left`, or None if the id was not
    /// connected.
    pub fn remove_client(&mut self, id: ClientId) -> Option<Peer> {
        let mut peer = self.peers.remove(&id)?;
        self.ids.release(id);
        peer.state = PeerState::Left;
        info!("Client {} disconnected", id);
        Some(peer)
    }

    pub fn get(&self, id: ClientId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    pub fn is_joined(&self, id: ClientId) -> bool {
        self.peers.get(&id).map_or(false, Peer::is_joined)
    }

    pub fn find_by_nick(&self, nick: &str) -> Option<ClientId> {
        self.peers
            .values()
            .find(|peer| peer.is_joined() && peer.nick.as_deref() == Some(nick))
            .map(|peer| peer.id)
    }

    /// Ids of joined peers in ascending order
    pub fn joined_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self
            .peers
            .values()
            .filter(|peer| peer.is_joined())
            .map(|peer| peer.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Every joined peer with its nick, ascending by id
    pub fn roster(&self) -> Vec<RosterEntry> {
        self.joined_ids()
            .into_iter()
            .filter_map(|id| {
                let nick = self.peers.get(&id)?.nick.clone()?;
                Some(RosterEntry { id, nick })
            })
            .collect()
    }

    /// Associates a stream address with a joined peer
    ///
    /// The first datagram binds the address, provided it comes from the same
    /// host as the peer's reliable connection. Later datagrams are only
    /// accepted from that exact address.
    pub fn bind_stream(&mut self, id: ClientId, addr: SocketAddr) -> bool {
        match self.peers.get_mut(&id) {
            Some(peer) if peer.is_joined() => match peer.stream_addr {
                None if peer.addr.ip().to_canonical() != addr.ip().to_canonical() => false,
                None => {
                    peer.stream_addr = Some(addr);
                    true
                }
                Some(bound) => bound == addr,
            },
            _ => false,
        }
    }

    /// Updates the round trip of a peer
    pub fn record_rtt(&mut self, id: ClientId, rtt_ms: u16) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.rtt_ms = rtt_ms;
        }
    }

    /// Stream destinations of joined peers
    pub fn stream_addrs(&self) -> Vec<(ClientId, SocketAddr)> {
        let mut addrs: Vec<_> = self
            .peers
            .values()
            .filter(|peer| peer.is_joined())
            .filter_map(|peer| peer.stream_addr.map(|addr| (peer.id, addr)))
            .collect();
        addrs.sort_unstable_by_key(|(id, _)| *id);
        addrs
    }

    /// Latest round trips of joined peers, ascending by id
    pub fn rtts(&self) -> Vec<RttEntry> {
        self.joined_ids()
            .into_iter()
            .filter_map(|id| {
                self.peers.get(&id).map(|peer| RttEntry {
                    id,
                    rtt_ms: peer.rtt_ms,
                })
            })
            .collect()
    }

    /// Number of connected peers, joined or not
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn joined_count(&self) -> usize {
        self.peers.values().filter(|peer| peer.is_joined()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:4890".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "127.0.0.1:4891".parse().unwrap()
    }

    #[test]
    fn test_client_manager_creation() {
        let manager = ClientManager::new();
        assert!(manager.is_empty());
        assert_eq!(manager.len(), 0);
        assert!(manager.joined_ids().is_empty());
    }

    #[test]
    fn test_add_client_assigns_first_free_id() {
        let mut manager = ClientManager::new();
        assert_eq!(manager.add_client(test_addr()), Some(0));
        assert_eq!(manager.add_client(test_addr2()), Some(1));
        assert_eq!(manager.len(), 2);

        let peer = manager.get(0).unwrap();
        assert_eq!(peer.state, PeerState::AwaitingHandshake);
        assert_eq!(peer.addr, test_addr());
        assert!(!peer.is_admin);
    }

    #[test]
    fn test_add_client_max_capacity() {
        let mut manager = ClientManager::with_capacity(1);
        assert!(manager.add_client(test_addr()).is_some());
        assert!(manager.add_client(test_addr2()).is_none());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_full_roster_refuses_256th_peer() {
        let mut manager = ClientManager::new();
        for _ in 0..CLIENT_CAPACITY {
            assert!(manager.add_client(test_addr()).is_some());
        }
        assert!(manager.add_client(test_addr()).is_none());
    }

    #[test]
    fn test_remove_client_recycles_id() {
        let mut manager = ClientManager::new();
        manager.add_client(test_addr());
        manager.add_client(test_addr());
        manager.join(0, "Alice").unwrap();

        let peer = manager.remove_client(0).unwrap();
        assert_eq!(peer.state, PeerState::Left);
        assert_eq!(peer.nick.as_deref(), Some("Alice"));
        assert!(manager.remove_client(0).is_none());

        assert_eq!(manager.add_client(test_addr2()), Some(0));
        let fresh = manager.get(0).unwrap();
        assert_eq!(fresh.state, PeerState::AwaitingHandshake);
        assert_eq!(fresh.nick, None);
    }

    #[test]
    fn test_join_rules() {
        let mut manager = ClientManager::new();
        manager.add_client(test_addr());
        manager.add_client(test_addr2());

        assert_eq!(manager.join(0, "Alice"), Ok(()));
        assert_eq!(manager.join(0, "Again"), Err(JoinError::AlreadyJoined(0)));
        assert_eq!(
            manager.join(1, "Alice"),
            Err(JoinError::NickTaken("Alice".to_string()))
        );
        assert_eq!(manager.join(1, ""), Err(JoinError::InvalidNick(String::new())));
        assert_eq!(manager.join(9, "Bob"), Err(JoinError::UnknownClient(9)));
        assert_eq!(manager.join(1, "Bob"), Ok(()));
        assert_eq!(manager.joined_ids(), vec![0, 1]);
    }

    #[test]
    fn test_validate_nick() {
        assert!(validate_nick("Alice"));
        assert!(validate_nick(&"a".repeat(16)));
        assert!(!validate_nick(&"a".repeat(17)));
        assert!(!validate_nick(""));
        assert!(!validate_nick(" padded "));
        assert!(!validate_nick("tab\there"));
    }

    #[test]
    fn test_nick_freed_on_leave() {
        let mut manager = ClientManager::new();
        manager.add_client(test_addr());
        manager.join(0, "Alice").unwrap();
        manager.remove_client(0);

        manager.add_client(test_addr2());
        assert_eq!(manager.join(0, "Alice"), Ok(()));
    }

    #[test]
    fn test_roster_lists_joined_only() {
        let mut manager = ClientManager::new();
        manager.add_client(test_addr());
        manager.add_client(test_addr());
        manager.add_client(test_addr());
        manager.join(2, "Carol").unwrap();
        manager.join(0, "Alice").unwrap();

        let roster = manager.roster();
        assert_eq!(
            roster,
            vec![
                RosterEntry {
                    id: 0,
                    nick: "Alice".to_string()
                },
                RosterEntry {
                    id: 2,
                    nick: "Carol".to_string()
                },
            ]
        );
        assert_eq!(manager.joined_count(), 2);
        assert_eq!(manager.len(), 3);
    }

    #[test]
    fn test_bind_stream() {
        let mut manager = ClientManager::new();
        manager.add_client(test_addr());
        assert!(!manager.bind_stream(0, test_addr()));

        manager.join(0, "Alice").unwrap();
        assert!(manager.bind_stream(0, test_addr()));
        assert!(manager.bind_stream(0, test_addr()));
        assert!(!manager.bind_stream(0, test_addr2()));
        assert_eq!(manager.stream_addrs(), vec![(0, test_addr())]);
    }

    #[test]
    fn test_bind_stream_requires_peer_host() {
        let mut manager = ClientManager::new();
        manager.add_client(test_addr());
        manager.join(0, "Alice").unwrap();

        let stranger: SocketAddr = "10.0.0.7:4890".parse().unwrap();
        assert!(!manager.bind_stream(0, stranger));
        assert!(manager.stream_addrs().is_empty());

        // Another port on the peer's own host is fine
        let ephemeral: SocketAddr = "127.0.0.1:50123".parse().unwrap();
        assert!(manager.bind_stream(0, ephemeral));
        assert!(!manager.bind_stream(0, stranger));
        assert_eq!(manager.stream_addrs(), vec![(0, ephemeral)]);
    }

    #[test]
    fn test_rtts() {
        let mut manager = ClientManager::new();
        manager.add_client(test_addr());
        manager.join(0, "Alice").unwrap();
        manager.record_rtt(0, 42);
        assert_eq!(manager.rtts(), vec![RttEntry { id: 0, rtt_ms: 42 }]);
    }
}
