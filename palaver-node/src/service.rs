#![warn(clippy::unwrap_used)]
pub mod events;
pub mod membership;
pub mod message;

use std::collections::VecDeque;
use std::fmt;
use std::net;

use crossbeam_channel as chan;
use localtime::{LocalDuration, LocalTime};
use log::*;

use crate::client;
use crate::service::events::{Emitter, Event};
use crate::service::membership::{Membership, Peer};
use crate::service::message::{Entry, Nickname, NodeList, Reply, Request, Response, Vote};

/// Well-known application port.
pub const DEFAULT_PORT: u16 = 65412;
/// How long an acked foreign proposal may reserve our next slot. A crashed
/// proposer must not wedge the slot forever.
pub const RESERVATION_TIMEOUT: LocalDuration = LocalDuration::from_secs(3);
/// Bounds of the randomized delay before a failed proposal is retried.
/// Independent jitter is what breaks ties between competing proposers.
pub const MIN_RETRY_DELAY: LocalDuration = LocalDuration::from_millis(100);
pub const MAX_RETRY_DELAY: LocalDuration = LocalDuration::from_millis(300);

/// Commands sent to the service by the operator.
pub enum Command {
    /// Queue a chat line for replication.
    Submit(String),
    /// Query the committed log.
    History(chan::Sender<Vec<Entry>>),
    /// Query the live peer set.
    Peers(chan::Sender<Vec<Peer>>),
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submit(line) => write!(f, "Submit({line:?})"),
            Self::History(_) => write!(f, "History"),
            Self::Peers(_) => write!(f, "Peers"),
        }
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Our display name.
    pub nickname: Nickname,
    /// Bootstrap peers to join through. Empty for the first node of a
    /// network.
    pub connect: Vec<net::SocketAddr>,
    /// Address to bind the listener to.
    pub listen: net::SocketAddr,
    /// Address peers should use to reach us. Discovered when unset.
    pub external: Option<net::SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nickname: "anonymous".to_owned(),
            connect: vec![],
            listen: (net::Ipv4Addr::UNSPECIFIED, DEFAULT_PORT).into(),
            external: None,
        }
    }
}

/// A foreign proposal we have acked. While held, it reserves our next
/// slot: further proposals for it are rejected until the matching commit
/// arrives or the reservation expires.
#[derive(Debug, Clone)]
struct Reservation {
    slot: u64,
    message: String,
    expires: LocalTime,
}

/// The node state machine. Owns every piece of mutable state; the runtime
/// drives it from a single thread, feeding it decoded requests, operator
/// commands and wakeups.
#[derive(Debug)]
pub struct Service {
    /// Service configuration.
    config: Config,
    /// The address we advertise to other nodes.
    addr: net::SocketAddr,
    /// Live peer set.
    peers: Membership,
    /// The committed log. Entry `i` sits at position `i`.
    history: Vec<Entry>,
    /// The next free slot in the log. Always `history.len()`.
    next_index: u64,
    /// The message we are currently trying to commit.
    pending_own: Option<String>,
    /// Submitted lines awaiting their turn as the pending message.
    queue: VecDeque<String>,
    /// A foreign proposal holding our next slot.
    reserved: Option<Reservation>,
    /// When to retry a proposal that fell short of a majority.
    retry_at: Option<LocalTime>,
    /// Vote tallies for the round in flight.
    acks: usize,
    rejects: usize,
    /// Clock. Updated by the runtime before every activation.
    clock: LocalTime,
    /// Source of retry jitter.
    rng: fastrand::Rng,
    /// Event bridge to the UI collaborator.
    emitter: Emitter,
}

impl Service {
    pub fn new(
        config: Config,
        addr: net::SocketAddr,
        clock: LocalTime,
        rng: fastrand::Rng,
        emitter: Emitter,
    ) -> Self {
        let peers = Membership::new(config.connect.iter().copied());

        Self {
            config,
            addr,
            peers,
            history: Vec::new(),
            next_index: 0,
            pending_own: None,
            queue: VecDeque::new(),
            reserved: None,
            retry_at: None,
            acks: 0,
            rejects: 0,
            clock,
            rng,
            emitter,
        }
    }

    /// Update the service clock.
    pub fn tick(&mut self, now: LocalTime) {
        self.clock = now;
    }

    /// Join the network: adopt the bootstrap's peer list, announce
    /// ourselves to everyone, and catch up on the committed log.
    pub fn initialize(&mut self) {
        let Some(&bootstrap) = self.config.connect.first() else {
            info!(target: "service", "No bootstrap peer configured; waiting for joiners");
            return;
        };
        info!(target: "service", "Joining the network via {bootstrap}..");

        match client::get_nodes(bootstrap, &self.config.nickname, self.addr.port()) {
            Ok(list) => {
                let mut entries = Vec::new();
                for (addr, nickname) in list.nodes {
                    match addr.parse::<net::SocketAddr>() {
                        Ok(addr) => entries.push((addr, nickname)),
                        Err(e) => {
                            warn!(target: "service", "Discarding unparseable peer address {addr:?}: {e}")
                        }
                    }
                }
                self.peers
                    .replace(entries.into_iter().filter(|(addr, _)| *addr != self.addr));
                // The bootstrap never lists itself. Keep it, by address,
                // until discovery hands us its nickname.
                if !self.peers.contains(&bootstrap) {
                    self.peers.insert(bootstrap, bootstrap.to_string());
                }
            }
            Err(e) => {
                error!(target: "service", "Bootstrap {bootstrap} could not be reached: {e}");
                self.emitter
                    .error(format!("couldn't reach bootstrap {bootstrap}: {e}"));
                return;
            }
        }
        self.announce();

        if let Err(e) = self.fetch_history(bootstrap) {
            warn!(target: "service", "History fetch from {bootstrap} failed: {e}");
        }
    }

    /// Dispatch an operator command.
    pub fn command(&mut self, cmd: Command) {
        debug!(target: "service", "Command {:?}", cmd);

        match cmd {
            Command::Submit(line) => self.submit(line),
            Command::History(resp) => {
                resp.send(self.history.clone()).ok();
            }
            Command::Peers(resp) => {
                resp.send(self.peers.iter().collect()).ok();
            }
        }
    }

    /// Queue a chat line for replication, starting a proposal round if
    /// none is in flight.
    pub fn submit(&mut self, line: String) {
        self.queue.push_back(line);

        if self.pending_own.is_none() {
            self.promote();
        }
    }

    /// Handle an inbound request. `remote` is the caller's source address;
    /// combined with the advertised port it identifies the peer.
    pub fn received(&mut self, remote: net::IpAddr, request: Request) -> Option<Reply> {
        debug!(target: "service", "Received {:?} from {}", request, remote);

        match request {
            Request::GetNodes { nickname, port } => {
                // Snapshot the reply before registering the caller, so a
                // node never discovers itself.
                let nodes = NodeList {
                    nodes: self
                        .peers
                        .iter()
                        .map(|p| (p.addr.to_string(), p.nickname))
                        .collect(),
                };
                let addr = net::SocketAddr::new(remote, port.unwrap_or(DEFAULT_PORT));
                self.peers.insert(addr, nickname.clone());
                self.emitter.info(format!("{nickname} is looking for peers."));

                Some(Reply::Nodes(nodes))
            }
            Request::NewNode { nickname, port } => {
                let addr = net::SocketAddr::new(remote, port.unwrap_or(DEFAULT_PORT));
                self.peers.insert(addr, nickname.clone());
                self.emitter.info(format!("{nickname} has joined."));

                Some(Reply::Response(Response::SystemIndex {
                    index: self.next_index,
                }))
            }
            Request::GetHistory => Some(Reply::Response(Response::History {
                history: self.history.clone(),
            })),
            Request::Propose {
                index,
                message,
                sender,
            } => {
                // Ack iff the slot is the next one and nobody reserved it
                // yet. A proposal of our own is no ground for rejection:
                // two contending proposers must be able to ack each other,
                // or neither would ever reach a majority.
                let value = if self.reserved.is_none() && index == self.next_index {
                    self.reserved = Some(Reservation {
                        slot: index,
                        message,
                        expires: self.clock + RESERVATION_TIMEOUT,
                    });
                    Vote::Ack
                } else {
                    Vote::Reject
                };
                debug!(
                    target: "service",
                    "{value:?} proposal by {sender} for slot {index} (expecting {})", self.next_index
                );

                Some(Reply::Response(Response::Vote {
                    value,
                    index,
                    sender: self.config.nickname.clone(),
                }))
            }
            Request::Commit {
                index,
                message,
                sender,
            } => {
                if index > self.next_index {
                    // We missed commits; catch up from the committer
                    // before appending.
                    let source = self
                        .peers
                        .find(&sender)
                        .unwrap_or_else(|| net::SocketAddr::new(remote, DEFAULT_PORT));
                    debug!(
                        target: "service",
                        "Commit for slot {index} while expecting {}; fetching history from {source}",
                        self.next_index
                    );
                    if let Err(e) = self.fetch_history(source) {
                        error!(target: "service", "History fetch from {source} failed: {e}");
                        self.emitter.error(format!(
                            "couldn't recover missed messages from {source}: {e}"
                        ));
                    }
                }
                if index == self.next_index {
                    self.append(index, &sender, &message);
                } else if index > self.next_index {
                    // Recovery fell short. Append anyway; the next commit
                    // triggers another fetch and a wholesale replace.
                    self.emitter.error(format!(
                        "message log has a gap: slots {}..{} are missing",
                        self.next_index, index
                    ));
                    self.append(index, &sender, &message);
                } else {
                    debug!(
                        target: "service",
                        "Ignoring stale commit for slot {index} (already at {})", self.next_index
                    );
                }
                self.reserved = None;

                Some(Reply::Response(Response::AckCommit {
                    message,
                    sender: self.config.nickname.clone(),
                }))
            }
            Request::Unknown => {
                warn!(target: "service", "Ignoring request of unknown type from {remote}");
                None
            }
        }
    }

    /// Fire any due deadlines: expired slot reservations and scheduled
    /// proposal retries.
    pub fn wake(&mut self) {
        if let Some(reservation) = &self.reserved {
            if self.clock >= reservation.expires {
                debug!(
                    target: "service",
                    "Releasing slot {} reserved for {:?}: proposer never committed",
                    reservation.slot, reservation.message
                );
                self.reserved = None;
            }
        }
        if let Some(at) = self.retry_at {
            if self.clock >= at {
                self.retry_at = None;
                self.propose();
            }
        }
    }

    /// The earliest time [`Service::wake`] has something to do.
    pub fn next_wakeup(&self) -> Option<LocalTime> {
        match (self.reserved.as_ref().map(|r| r.expires), self.retry_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// The committed log, in order.
    pub fn history(&self) -> &[Entry] {
        &self.history
    }

    /// The next free slot index.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// The live peer set.
    pub fn peers(&self) -> &Membership {
        &self.peers
    }

    /// The slot currently reserved for a foreign proposal, if any.
    pub fn reserved_slot(&self) -> Option<u64> {
        self.reserved.as_ref().map(|r| r.slot)
    }

    /// Our display name.
    pub fn nickname(&self) -> &str {
        &self.config.nickname
    }

    ////////////////////////////////////////////////////////////////////////
    // Replication
    ////////////////////////////////////////////////////////////////////////

    /// Promote the next queued line to the in-flight proposal.
    fn promote(&mut self) {
        if let Some(message) = self.queue.pop_front() {
            self.pending_own = Some(message);
            self.propose();
        }
    }

    /// Run one proposal round for the in-flight message at the current
    /// slot.
    fn propose(&mut self) {
        let Some(message) = self.pending_own.clone() else {
            return;
        };
        let slot = self.next_index;
        self.retry_at = None;
        self.acks = 0;
        self.rejects = 0;

        debug!(target: "service", "Proposing {:?} for slot {}", message, slot);

        let request = Request::Propose {
            index: slot,
            message: message.clone(),
            sender: self.config.nickname.clone(),
        };
        if !self.broadcast(&request) {
            // The round was abandoned and the pending message dropped;
            // queued lines still get their turn.
            self.promote();
            return;
        }

        // Strict majority over the live peer count; a node with no peers
        // left is a quorum of one.
        let live = self.peers.len();
        if live == 0 || self.acks > live / 2 {
            self.commit(message);
        } else {
            let millis = self.rng.u64(
                MIN_RETRY_DELAY.as_millis() as u64..=MAX_RETRY_DELAY.as_millis() as u64,
            );
            debug!(
                target: "service",
                "Slot {} got {} acks, {} rejects from {} peers; retrying in {}ms",
                slot, self.acks, self.rejects, live, millis
            );
            self.acks = 0;
            self.rejects = 0;
            self.retry_at = Some(self.clock + LocalDuration::from_millis(millis.into()));
        }
    }

    /// Commit the decided message: broadcast the commit, append locally,
    /// and advance to the next slot.
    fn commit(&mut self, message: String) {
        let slot = self.next_index;

        debug!(target: "service", "Committing {:?} at slot {}", message, slot);

        let request = Request::Commit {
            index: slot,
            message: message.clone(),
            sender: self.config.nickname.clone(),
        };
        // The slot is decided; peers that miss the commit will recover the
        // entry from history on the next one.
        self.broadcast(&request);

        self.history.push(Entry {
            index: slot,
            sender: self.config.nickname.clone(),
            message: message.clone(),
        });
        self.next_index = slot + 1;
        self.emitter.emit(Event::Message {
            sender: self.config.nickname.clone(),
            content: message,
        });
        // A reservation for the slot we just filled lost the race.
        self.reserved = None;
        self.pending_own = None;
        self.acks = 0;
        self.rejects = 0;

        self.promote();
    }

    /// Send a request to every live peer, one connection each, folding
    /// replies into the round tallies. Unreachable peers are reaped after
    /// the fan-out; an unresponsive peer just loses its vote. Returns
    /// `false` if a peer replied with garbage, which fails the round.
    fn broadcast(&mut self, request: &Request) -> bool {
        for addr in self.peers.addrs() {
            match client::call::<Response>(addr, request) {
                Ok(Response::Vote {
                    value,
                    index,
                    sender,
                }) => {
                    trace!(target: "service", "{sender} voted {value:?} on slot {index}");
                    match value {
                        Vote::Ack => self.acks += 1,
                        Vote::Reject => self.rejects += 1,
                    }
                }
                Ok(Response::AckCommit { message, sender }) => {
                    self.emitter.emit(Event::Ack { sender, message });
                }
                Ok(reply) => {
                    error!(target: "service", "Unexpected reply from {addr}: {reply:?}");
                    self.fail_round(format!("unexpected reply from {addr}"));
                    return false;
                }
                Err(e) if e.is_timeout() => {
                    debug!(target: "client", "{addr} did not answer in time: {e}");
                }
                Err(e) if e.is_unreachable() => {
                    debug!(target: "client", "{addr} is unreachable: {e}");
                    self.peers.mark_inactive(addr);
                }
                Err(e) => {
                    error!(target: "client", "Invalid response from {addr}: {e}");
                    self.fail_round(format!("invalid response from {addr}: {e}"));
                    return false;
                }
            }
        }
        self.reap();

        true
    }

    /// Abandon the round in flight. The user may retype the lost line.
    fn fail_round(&mut self, reason: String) {
        self.emitter.error(reason);
        self.pending_own = None;
        self.retry_at = None;
        self.acks = 0;
        self.rejects = 0;
    }

    /// Drop peers that refused connections during the last fan-out.
    fn reap(&mut self) {
        for peer in self.peers.reap() {
            info!(target: "service", "{} ({}) has left", peer.nickname, peer.addr);
            self.emitter.info(format!("{} has left.", peer.nickname));
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Discovery and catch-up
    ////////////////////////////////////////////////////////////////////////

    /// Announce ourselves to every peer and adopt the highest next slot
    /// index reported back.
    fn announce(&mut self) {
        let mut highest = 0;
        for addr in self.peers.addrs() {
            match client::new_node(addr, &self.config.nickname, self.addr.port()) {
                Ok(index) => highest = highest.max(index),
                Err(e) if e.is_unreachable() && !e.is_timeout() => {
                    debug!(target: "client", "{addr} is unreachable: {e}");
                    self.peers.mark_inactive(addr);
                }
                Err(e) => warn!(target: "client", "Announce to {addr} failed: {e}"),
            }
        }
        self.reap();
        self.next_index = highest;
    }

    /// Replace the local log with the one committed at `addr`, surfacing
    /// any entries we had not seen.
    fn fetch_history(&mut self, addr: net::SocketAddr) -> Result<(), client::Error> {
        let history = client::get_history(addr)?;

        debug!(
            target: "service",
            "Fetched {} log entries from {addr} (had {})", history.len(), self.history.len()
        );
        for entry in history.iter().skip(self.history.len()) {
            self.emitter.emit(Event::Message {
                sender: entry.sender.clone(),
                content: entry.message.clone(),
            });
        }
        self.history = history;
        self.next_index = self.history.len() as u64;

        Ok(())
    }

    /// Append an entry and advance the slot. Events are emitted for other
    /// participants' messages; our own were surfaced when we committed.
    fn append(&mut self, index: u64, sender: &Nickname, message: &str) {
        self.history.push(Entry {
            index,
            sender: sender.clone(),
            message: message.to_owned(),
        });
        self.next_index = index + 1;

        if *sender != self.config.nickname {
            self.emitter.emit(Event::Message {
                sender: sender.clone(),
                content: message.to_owned(),
            });
        }
    }
}
