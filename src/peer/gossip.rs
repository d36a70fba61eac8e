//! Flooded gossip with bounded dedup.
//!
//! The dedup key is the SHA3-256 digest of the payload string. Seen hashes
//! live in a FIFO log capped well above anything a message can reach while
//! it still propagates, so a frame is forwarded at most once per neighbor
//! and replays die on arrival.

use super::PeerShared;
use crate::net::Message;
use crate::types::{now, NodeId};
use sha3::{Digest, Sha3_256};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info};

pub type GossipHash = [u8; 32];

/// Digest of a gossip payload.
pub fn payload_hash(payload: &str) -> GossipHash {
    let mut hasher = Sha3_256::new();
    hasher.update(payload.as_bytes());
    hasher.finalize().into()
}

fn short(hash: &GossipHash) -> String {
    hex::encode(&hash[..4])
}

/// One remembered gossip sighting.
pub struct LogEntry {
    pub hash: GossipHash,
    pub first_seen: u64,
    pub originator: NodeId,
}

/// Bounded FIFO of seen gossip hashes, evicting the oldest sighting first.
pub struct MessageLog {
    cap: usize,
    seen: HashSet<GossipHash>,
    order: VecDeque<LogEntry>,
}

impl MessageLog {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            seen: HashSet::with_capacity(cap),
            order: VecDeque::with_capacity(cap),
        }
    }

    /// Record a first sighting. Returns false when the hash is already
    /// known, in which case nothing changes.
    pub fn insert(&mut self, hash: GossipHash, first_seen: u64, originator: NodeId) -> bool {
        if self.seen.contains(&hash) {
            return false;
        }
        while self.order.len() >= self.cap {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old.hash);
            }
        }
        self.seen.insert(hash);
        self.order.push_back(LogEntry {
            hash,
            first_seen,
            originator,
        });
        true
    }

    pub fn contains(&self, hash: &GossipHash) -> bool {
        self.seen.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Originate one message and flood it to every neighbor.
pub async fn originate(shared: &PeerShared, seq: u64) {
    let timestamp = now();
    let payload = format!("{timestamp}:{}:{seq}", shared.id);
    let hash = payload_hash(&payload);
    if !shared
        .log
        .write()
        .await
        .insert(hash, timestamp, shared.id)
    {
        return;
    }
    info!("GOSSIP SEND {} seq {seq}", short(&hash));
    let msg = Message::Gossip {
        originator: shared.id,
        seq,
        timestamp,
        payload,
    };
    fan_out(shared, msg, None).await;
}

/// Receive a gossip frame from neighbor `from`: drop replays, otherwise
/// record and forward the identical frame to everyone else.
pub async fn handle_gossip(
    shared: &PeerShared,
    from: NodeId,
    originator: NodeId,
    seq: u64,
    timestamp: u64,
    payload: String,
) {
    let hash = payload_hash(&payload);
    if !shared.log.write().await.insert(hash, now(), originator) {
        debug!("GOSSIP DROP duplicate {} from {from}", short(&hash));
        return;
    }
    info!(
        "GOSSIP RECEIVE {} from {from} (origin {originator} seq {seq})",
        short(&hash)
    );
    let msg = Message::Gossip {
        originator,
        seq,
        timestamp,
        payload,
    };
    fan_out(shared, msg, Some(&from)).await;
}

/// Best-effort flood: one failed neighbor never aborts the rest.
async fn fan_out(shared: &PeerShared, msg: Message, skip: Option<&NodeId>) {
    let targets = shared.neighbors.read().await.fanout_except(skip);
    for (id, tx) in targets {
        super::send_to_neighbor(shared, &id, &tx, msg.clone()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use tokio::sync::mpsc;

    fn id(s: &str) -> NodeId {
        s.parse().unwrap()
    }

    #[test]
    fn hash_is_deterministic() {
        let a = payload_hash("1700000000:127.0.0.1:6001:0");
        let b = payload_hash("1700000000:127.0.0.1:6001:0");
        let c = payload_hash("1700000000:127.0.0.1:6001:1");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn log_drops_replays() {
        let mut log = MessageLog::new(8);
        let origin = id("127.0.0.1:6001");
        let h = payload_hash("x");
        assert!(log.insert(h, 1, origin));
        assert!(!log.insert(h, 2, origin));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn log_evicts_oldest_first() {
        let mut log = MessageLog::new(3);
        let origin = id("127.0.0.1:6001");
        let hashes: Vec<GossipHash> = (0..4).map(|i| payload_hash(&format!("m{i}"))).collect();
        for (i, h) in hashes.iter().enumerate() {
            assert!(log.insert(*h, i as u64, origin));
        }
        assert_eq!(log.len(), 3);
        assert!(!log.contains(&hashes[0]), "oldest entry should be evicted");
        assert!(log.contains(&hashes[3]));
        // An evicted hash counts as new again.
        assert!(log.insert(hashes[0], 9, origin));
    }

    fn test_shared(neighbor_ports: &[u16]) -> (PeerShared, Vec<mpsc::Receiver<Message>>) {
        let shared = PeerShared::new(
            id("127.0.0.1:7000"),
            Vec::new(),
            NodeConfig::default(),
        );
        let mut rxs = Vec::new();
        for port in neighbor_ports {
            let (tx, rx) = mpsc::channel(16);
            shared
                .neighbors
                .try_write()
                .unwrap()
                .insert(
                    id(&format!("127.0.0.1:{port}")),
                    super::super::neighbors::Neighbor::new(tx, 0, false),
                )
                .unwrap();
            rxs.push(rx);
        }
        (shared, rxs)
    }

    #[tokio::test]
    async fn forwards_to_everyone_but_the_source() {
        let (shared, mut rxs) = test_shared(&[6001, 6002]);
        let source = id("127.0.0.1:6001");

        handle_gossip(
            &shared,
            source,
            source,
            0,
            99,
            "99:127.0.0.1:6001:0".to_string(),
        )
        .await;

        // 6002 gets the identical frame; 6001 (the source) gets nothing.
        let forwarded = rxs[1].try_recv().unwrap();
        match forwarded {
            Message::Gossip { payload, originator, .. } => {
                assert_eq!(payload, "99:127.0.0.1:6001:0");
                assert_eq!(originator, source);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(rxs[0].try_recv().is_err());
    }

    #[tokio::test]
    async fn replay_is_not_forwarded() {
        let (shared, mut rxs) = test_shared(&[6001, 6002]);
        let source = id("127.0.0.1:6001");
        let payload = "99:127.0.0.1:6001:0".to_string();

        handle_gossip(&shared, source, source, 0, 99, payload.clone()).await;
        rxs[1].try_recv().unwrap();

        // Same frame arriving again, this time via 6002.
        let other_source = id("127.0.0.1:6002");
        handle_gossip(&shared, other_source, source, 0, 99, payload).await;
        assert!(rxs[0].try_recv().is_err(), "replay must not reach 6001");
        assert!(rxs[1].try_recv().is_err(), "replay must not reach 6002");
    }

    #[tokio::test]
    async fn origination_floods_all_neighbors() {
        let (shared, mut rxs) = test_shared(&[6001, 6002]);
        originate(&shared, 0).await;
        assert!(matches!(rxs[0].try_recv().unwrap(), Message::Gossip { .. }));
        assert!(matches!(rxs[1].try_recv().unwrap(), Message::Gossip { .. }));
        assert_eq!(shared.log.read().await.len(), 1);
    }
}
