//! Per-neighbor link state and the bounded neighbor table.

use crate::net::Message;
use crate::types::NodeId;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;

/// Liveness phase of an open link. DEAD is not represented here: a dead
/// neighbor leaves the table atomically with its escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Healthy,
    Suspect,
}

/// One open neighbor link.
pub struct Neighbor {
    /// Frame channel into the link's writer task.
    pub tx: mpsc::Sender<Message>,
    /// Degree the neighbor last reported, used for attachment weighting.
    pub degree_hint: u32,
    /// Whether we dialed this link (outbound selections are capped).
    pub outbound: bool,
    pub state: LinkState,
    pub missed_pings: u32,
    /// Nonce of the ping still awaiting its pong, if any.
    pub pending_nonce: Option<u64>,
}

impl Neighbor {
    pub fn new(tx: mpsc::Sender<Message>, degree_hint: u32, outbound: bool) -> Self {
        Self {
            tx,
            degree_hint,
            outbound,
            state: LinkState::Healthy,
            missed_pings: 0,
            pending_nonce: None,
        }
    }
}

/// Why an insert was refused.
#[derive(Debug, PartialEq, Eq)]
pub enum InsertError {
    /// A link to this peer already exists; the first one wins.
    Duplicate,
    /// The peer was confirmed dead on this node; re-admission requires a
    /// fresh registration and a new connection from their side.
    KnownDead,
    /// Outbound attachment cap reached.
    CapReached,
}

/// All open links of one peer, plus the memory of confirmed-dead peers.
pub struct NeighborTable {
    attach_cap: usize,
    inner: HashMap<NodeId, Neighbor>,
    dead: HashSet<NodeId>,
}

impl NeighborTable {
    pub fn new(attach_cap: usize) -> Self {
        Self {
            attach_cap,
            inner: HashMap::new(),
            dead: HashSet::new(),
        }
    }

    pub fn degree(&self) -> usize {
        self.inner.len()
    }

    pub fn outbound_count(&self) -> usize {
        self.inner.values().filter(|n| n.outbound).count()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.inner.contains_key(id)
    }

    pub fn is_dead(&self, id: &NodeId) -> bool {
        self.dead.contains(id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut Neighbor> {
        self.inner.get_mut(id)
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.inner.keys().copied().collect()
    }

    pub fn sender(&self, id: &NodeId) -> Option<mpsc::Sender<Message>> {
        self.inner.get(id).map(|n| n.tx.clone())
    }

    pub fn insert(&mut self, id: NodeId, neighbor: Neighbor) -> Result<(), InsertError> {
        if self.dead.contains(&id) {
            return Err(InsertError::KnownDead);
        }
        if self.inner.contains_key(&id) {
            return Err(InsertError::Duplicate);
        }
        if neighbor.outbound && self.outbound_count() >= self.attach_cap {
            return Err(InsertError::CapReached);
        }
        self.inner.insert(id, neighbor);
        Ok(())
    }

    /// Remove a link without prejudice (connection closed).
    pub fn remove(&mut self, id: &NodeId) -> Option<Neighbor> {
        self.inner.remove(id)
    }

    /// Remove a link and remember the peer as dead; stale frames about it
    /// are ignored from now on.
    pub fn remove_dead(&mut self, id: &NodeId) -> Option<Neighbor> {
        self.dead.insert(*id);
        self.inner.remove(id)
    }

    /// Writer channels of every neighbor except `skip`, for gossip fan-out.
    pub fn fanout_except(&self, skip: Option<&NodeId>) -> Vec<(NodeId, mpsc::Sender<Message>)> {
        self.inner
            .iter()
            .filter(|(id, _)| Some(*id) != skip)
            .map(|(id, n)| (*id, n.tx.clone()))
            .collect()
    }
}
