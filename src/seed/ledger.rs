//! Authoritative membership state and its quorum arithmetic.
//!
//! The ledger is a plain struct with no locking of its own; the seed node
//! owns it behind a single mutex and drives it from the frame handlers.
//! Everything here is synchronous and deterministic, which is what makes
//! the consensus rules unit-testable without sockets.

use crate::types::{majority, NodeId};
use std::collections::{HashMap, HashSet};

/// Result of counting one ADD vote.
#[derive(Debug, PartialEq, Eq)]
pub enum VoteOutcome {
    /// The subject is already live; the vote is ignored.
    AlreadyLive,
    /// This voter was already counted for this round.
    Duplicate,
    /// Vote counted; the round now holds this many distinct voters.
    Counted(usize),
    /// The vote reached quorum and the subject was committed live.
    Committed,
}

/// Result of counting one dead-node report.
#[derive(Debug, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Reporter is neither a live peer nor a seed; the report is ignored.
    UnknownReporter,
    /// This reporter was already counted for this subject.
    Duplicate,
    /// Report counted; this many distinct reporters so far.
    Counted(usize),
    /// Reports reached quorum and the subject was removed.
    Removed,
}

/// One seed's view of overlay membership.
pub struct Ledger {
    seeds: Vec<NodeId>,
    live: HashSet<NodeId>,
    pending_add: HashMap<NodeId, HashSet<NodeId>>,
    pending_remove: HashMap<NodeId, HashSet<NodeId>>,
}

impl Ledger {
    pub fn new(seeds: Vec<NodeId>) -> Self {
        Self {
            seeds,
            live: HashSet::new(),
            pending_add: HashMap::new(),
            pending_remove: HashMap::new(),
        }
    }

    /// Votes (or reports) required to commit: a majority of the seed group.
    pub fn quorum(&self) -> usize {
        majority(self.seeds.len())
    }

    pub fn is_seed(&self, id: &NodeId) -> bool {
        self.seeds.contains(id)
    }

    pub fn is_live(&self, id: &NodeId) -> bool {
        self.live.contains(id)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn live_snapshot(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self.live.iter().copied().collect();
        peers.sort();
        peers
    }

    /// The list a registering peer receives: everyone live except itself.
    pub fn peer_list_for(&self, peer: &NodeId) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self.live.iter().filter(|p| *p != peer).copied().collect();
        peers.sort();
        peers
    }

    pub fn has_voted(&self, peer: &NodeId, voter: &NodeId) -> bool {
        self.pending_add
            .get(peer)
            .is_some_and(|votes| votes.contains(voter))
    }

    /// Count one distinct seed vote toward adding `peer`. Opens the round if
    /// it does not exist yet: votes can legitimately arrive before the
    /// proposal, since ordering across connections is not guaranteed.
    pub fn record_vote(&mut self, peer: NodeId, voter: NodeId) -> VoteOutcome {
        if self.live.contains(&peer) {
            return VoteOutcome::AlreadyLive;
        }
        let votes = self.pending_add.entry(peer).or_default();
        if !votes.insert(voter) {
            return VoteOutcome::Duplicate;
        }
        let count = votes.len();
        if count >= self.quorum() {
            self.apply_add(peer);
            VoteOutcome::Committed
        } else {
            VoteOutcome::Counted(count)
        }
    }

    /// Apply a commit observed elsewhere. Returns false when already live.
    pub fn commit_add(&mut self, peer: NodeId) -> bool {
        if self.live.contains(&peer) {
            self.pending_add.remove(&peer);
            return false;
        }
        self.apply_add(peer);
        true
    }

    fn apply_add(&mut self, peer: NodeId) {
        self.pending_add.remove(&peer);
        // A fresh admission wipes stale failure reports against the peer.
        self.pending_remove.remove(&peer);
        self.live.insert(peer);
    }

    /// Count one distinct failure report against `dead`. Only live peers and
    /// seeds may report; anything else is ignored by the caller's policy.
    pub fn record_report(&mut self, dead: NodeId, reporter: NodeId) -> ReportOutcome {
        if !self.live.contains(&reporter) && !self.is_seed(&reporter) {
            return ReportOutcome::UnknownReporter;
        }
        let reports = self.pending_remove.entry(dead).or_default();
        if !reports.insert(reporter) {
            return ReportOutcome::Duplicate;
        }
        let count = reports.len();
        if count >= self.quorum() {
            self.apply_remove(&dead);
            ReportOutcome::Removed
        } else {
            ReportOutcome::Counted(count)
        }
    }

    /// Apply a remove decided elsewhere. Returns whether the peer was live.
    pub fn commit_remove(&mut self, dead: &NodeId) -> bool {
        let was_live = self.live.contains(dead);
        self.apply_remove(dead);
        was_live
    }

    fn apply_remove(&mut self, dead: &NodeId) {
        self.pending_remove.remove(dead);
        self.pending_add.remove(dead);
        self.live.remove(dead);
    }
}
