//! Bootstrap: register with the seed quorum, probe candidate degrees, and
//! attach by preferential selection.
//!
//! Registration rounds repeat with exponential backoff until at least one
//! seed answers with a peer list — a seed group that lost its state (or a
//! partitioned seed that cannot commit) just never answers, and the peer
//! keeps retrying. Candidate selection weights each reachable peer by
//! `degree + 1` and draws without replacement, so well-connected peers
//! attract new links while fresh overlays stay connectable.

use super::neighbors::Neighbor;
use super::PeerShared;
use crate::net::{wire, FrameReader, Message};
use crate::types::NodeId;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Exponential retry delay with a ceiling.
pub struct Backoff {
    delay: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { delay: initial, max }
    }

    /// Current delay; doubles for next time, up to the ceiling.
    pub fn next(&mut self) -> Duration {
        let current = self.delay;
        self.delay = (self.delay * crate::types::RETRY_BACKOFF_FACTOR).min(self.max);
        current
    }
}

/// Run the whole bootstrap sequence. Inbound acceptance is already running
/// when this is called, so a first peer with an empty union just waits.
pub async fn run(shared: Arc<PeerShared>) {
    let candidates = register_with_seeds(&shared).await;
    if candidates.is_empty() {
        info!("overlay is empty; waiting for inbound attachments");
        return;
    }

    let probed = probe_degrees(&shared, candidates).await;
    if probed.is_empty() {
        info!("no candidate reachable; waiting for inbound attachments");
        return;
    }

    let picks = {
        let mut rng = rand::thread_rng();
        pick_weighted(&probed, shared.cfg.attach_cap, &mut rng)
    };
    info!(
        "selected {} of {} candidates for attachment",
        picks.len(),
        probed.len()
    );

    for target in picks {
        let degree_hint = probed
            .iter()
            .find(|(id, _)| *id == target)
            .map(|(_, d)| *d)
            .unwrap_or(0);
        attach_one(&shared, target, degree_hint).await;
    }
}

/// Register with every seed concurrently and union the replies. Retries
/// with backoff until at least one peer list arrives.
async fn register_with_seeds(shared: &Arc<PeerShared>) -> Vec<NodeId> {
    let mut backoff = Backoff::new(shared.cfg.initial_retry_delay, shared.cfg.max_retry_delay);
    loop {
        let mut join_set = JoinSet::new();
        for seed in shared.seeds.iter().copied() {
            let self_id = shared.id;
            let connect_timeout = shared.cfg.connect_timeout;
            let reply_timeout = shared.cfg.register_reply_timeout;
            join_set.spawn(async move {
                let reply = wire::exchange(
                    seed.socket_addr(),
                    &Message::Register { peer: self_id },
                    connect_timeout,
                    reply_timeout,
                )
                .await;
                (seed, reply)
            });
        }

        let mut union = HashSet::new();
        let mut replies = 0usize;
        while let Some(res) = join_set.join_next().await {
            let Ok((seed, reply)) = res else { continue };
            match reply {
                Ok(Some(Message::PeerList { peers })) => {
                    info!("PEER_LIST from {seed}: {} peers", peers.len());
                    replies += 1;
                    union.extend(peers);
                }
                Ok(Some(other)) => {
                    warn!("unexpected {} from seed {seed}", other.kind());
                }
                Ok(None) => warn!("seed {seed} closed without a peer list"),
                Err(e) => warn!("registration with seed {seed} failed: {e}"),
            }
        }

        if replies > 0 {
            union.remove(&shared.id);
            return union.into_iter().collect();
        }
        let delay = backoff.next();
        warn!("no seed answered the registration; retrying in {delay:?}");
        tokio::time::sleep(delay).await;
    }
}

/// Probe every candidate's degree over short-lived connections. Unreachable
/// candidates are excluded from this round.
async fn probe_degrees(shared: &Arc<PeerShared>, candidates: Vec<NodeId>) -> Vec<(NodeId, u32)> {
    let mut join_set = JoinSet::new();
    for candidate in candidates {
        let connect_timeout = shared.cfg.connect_timeout;
        let probe_timeout = shared.cfg.probe_timeout;
        join_set.spawn(async move {
            let reply = wire::exchange(
                candidate.socket_addr(),
                &Message::DegQuery,
                connect_timeout,
                probe_timeout,
            )
            .await;
            (candidate, reply)
        });
    }

    let mut probed = Vec::new();
    while let Some(res) = join_set.join_next().await {
        let Ok((candidate, reply)) = res else { continue };
        match reply {
            Ok(Some(Message::DegReply { degree })) => {
                debug!("degree of {candidate} is {degree}");
                probed.push((candidate, degree));
            }
            Ok(Some(other)) => {
                warn!("unexpected {} from {candidate}, excluded", other.kind());
            }
            Ok(None) => warn!("{candidate} closed during degree probe, excluded"),
            Err(e) => warn!("{candidate} unreachable ({e}), excluded"),
        }
    }
    probed
}

/// Weighted draw without replacement: weight `degree + 1`, at most `cap`
/// picks, everyone when fewer candidates than the cap.
pub fn pick_weighted<R: Rng>(
    candidates: &[(NodeId, u32)],
    cap: usize,
    rng: &mut R,
) -> Vec<NodeId> {
    let mut pool: Vec<(NodeId, u64)> = candidates
        .iter()
        .map(|(id, degree)| (*id, u64::from(*degree) + 1))
        .collect();
    let mut picks = Vec::new();
    while picks.len() < cap && !pool.is_empty() {
        let total: u64 = pool.iter().map(|(_, w)| *w).sum();
        let mut roll = rng.gen_range(0..total);
        let mut chosen = pool.len() - 1;
        for (i, (_, weight)) in pool.iter().enumerate() {
            if roll < *weight {
                chosen = i;
                break;
            }
            roll -= *weight;
        }
        picks.push(pool.swap_remove(chosen).0);
    }
    picks
}

/// Dial one selected candidate, announce ourselves, and install the link.
async fn attach_one(shared: &Arc<PeerShared>, target: NodeId, degree_hint: u32) {
    let stream = match wire::connect(target.socket_addr(), shared.cfg.connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("attachment to {target} failed: {e}");
            return;
        }
    };
    let (read_half, write_half) = stream.into_split();
    let tx = wire::spawn_writer(write_half);
    if tx.send(Message::Connect { peer: shared.id }).await.is_err() {
        warn!("attachment to {target} failed before the announce");
        return;
    }

    let insert = shared
        .neighbors
        .write()
        .await
        .insert(target, Neighbor::new(tx, degree_hint, true));
    match insert {
        Ok(()) => {
            info!("ATTACHED {target} (outbound, degree hint {degree_hint})");
            let shared = shared.clone();
            tokio::spawn(async move {
                super::link_loop(shared, FrameReader::new(read_half), target).await;
            });
        }
        Err(reason) => {
            // Simultaneous inbound from the same peer usually wins this race.
            debug!("not installing {target}: {reason:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn id(s: &str) -> NodeId {
        s.parse().unwrap()
    }

    fn candidates(degrees: &[(u16, u32)]) -> Vec<(NodeId, u32)> {
        degrees
            .iter()
            .map(|(port, d)| (id(&format!("127.0.0.1:{port}")), *d))
            .collect()
    }

    #[test]
    fn backoff_doubles_to_the_ceiling() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(10));
        assert_eq!(backoff.next(), Duration::from_secs(2));
        assert_eq!(backoff.next(), Duration::from_secs(4));
        assert_eq!(backoff.next(), Duration::from_secs(8));
        assert_eq!(backoff.next(), Duration::from_secs(10));
        assert_eq!(backoff.next(), Duration::from_secs(10));
    }

    #[test]
    fn draws_without_replacement_up_to_cap() {
        let pool = candidates(&[(6001, 4), (6002, 2), (6003, 0), (6004, 1)]);
        let mut rng = StdRng::seed_from_u64(1);
        let picks = pick_weighted(&pool, 3, &mut rng);
        assert_eq!(picks.len(), 3);
        let unique: HashSet<_> = picks.iter().collect();
        assert_eq!(unique.len(), 3, "a candidate was drawn twice");
    }

    #[test]
    fn takes_everyone_when_short_of_candidates() {
        let pool = candidates(&[(6001, 0), (6002, 5)]);
        let mut rng = StdRng::seed_from_u64(2);
        let picks = pick_weighted(&pool, 3, &mut rng);
        assert_eq!(picks.len(), 2);
    }

    #[test]
    fn zero_degree_candidates_are_still_drawable() {
        let pool = candidates(&[(6001, 0)]);
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(pick_weighted(&pool, 3, &mut rng).len(), 1);
    }

    #[test]
    fn selection_skews_toward_high_degree() {
        let pool = candidates(&[(6001, 5), (6005, 0)]);
        let high = id("127.0.0.1:6001");
        let mut rng = StdRng::seed_from_u64(4);

        let mut high_picked = 0;
        for _ in 0..200 {
            if pick_weighted(&pool, 1, &mut rng)[0] == high {
                high_picked += 1;
            }
        }
        // Weight 6 vs 1: roughly 170 of 200 draws; anything near parity
        // would mean the weighting is broken.
        assert!(
            high_picked > 130,
            "expected a strong skew, got {high_picked}/200"
        );
    }
}
