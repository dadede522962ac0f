use std::collections::{BTreeMap, BTreeSet};
use std::net;

use crate::service::message::Nickname;

/// A chat participant, reachable at an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub addr: net::SocketAddr,
    pub nickname: Nickname,
}

/// The live peer set. Addresses are the identity key: inserting a peer
/// under a known address replaces the previous entry. The local node is
/// never a member of its own set.
#[derive(Debug, Clone, Default)]
pub struct Membership {
    peers: BTreeMap<net::SocketAddr, Nickname>,
    /// Peers found unreachable during the current fan-out. Drained by
    /// [`Membership::reap`] once the fan-out completes.
    inactive: BTreeSet<net::SocketAddr>,
}

impl Membership {
    /// Create a peer set from a bootstrap list. Bootstrap peers are known
    /// by address only; the address doubles as a display name until
    /// discovery replaces the entry.
    pub fn new(bootstrap: impl IntoIterator<Item = net::SocketAddr>) -> Self {
        Self {
            peers: bootstrap.into_iter().map(|a| (a, a.to_string())).collect(),
            inactive: BTreeSet::new(),
        }
    }

    /// Insert a peer, replacing any entry with the same address.
    /// Returns `true` if the set changed.
    pub fn insert(&mut self, addr: net::SocketAddr, nickname: Nickname) -> bool {
        self.peers
            .insert(addr, nickname.clone())
            .map_or(true, |old| old != nickname)
    }

    /// Remove a peer by address.
    pub fn remove(&mut self, addr: &net::SocketAddr) -> Option<Nickname> {
        self.inactive.remove(addr);
        self.peers.remove(addr)
    }

    /// Adopt a wholesale new view of the network, as handed out by the
    /// bootstrap. Pending reap bookkeeping is discarded with the old view.
    pub fn replace(&mut self, entries: impl IntoIterator<Item = (net::SocketAddr, Nickname)>) {
        self.peers = entries.into_iter().collect();
        self.inactive.clear();
    }

    pub fn contains(&self, addr: &net::SocketAddr) -> bool {
        self.peers.contains_key(addr)
    }

    /// Look a peer up by nickname. Addresses are the identity; this exists
    /// for messages that name only their sender.
    pub fn find(&self, nickname: &str) -> Option<net::SocketAddr> {
        self.peers
            .iter()
            .find(|(_, n)| n.as_str() == nickname)
            .map(|(a, _)| *a)
    }

    /// Snapshot of all peer addresses, for fan-outs.
    pub fn addrs(&self) -> Vec<net::SocketAddr> {
        self.peers.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = Peer> + '_ {
        self.peers.iter().map(|(addr, nickname)| Peer {
            addr: *addr,
            nickname: nickname.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Note a peer as unreachable. It stays in the set, and keeps receiving
    /// no traffic, until the fan-out completes and [`Membership::reap`] runs.
    pub fn mark_inactive(&mut self, addr: net::SocketAddr) {
        self.inactive.insert(addr);
    }

    /// Drop the peers found unreachable during the last fan-out, returning
    /// them for departure notices.
    pub fn reap(&mut self) -> Vec<Peer> {
        let mut dropped = Vec::new();
        for addr in std::mem::take(&mut self.inactive) {
            if let Some(nickname) = self.peers.remove(&addr) {
                dropped.push(Peer { addr, nickname });
            }
        }
        dropped
    }
}
