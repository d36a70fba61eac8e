//! Neighbor liveness: ping loop, suspicion, corroboration, escalation.
//!
//! Detection is two-staged. A neighbor missing three consecutive pings is
//! only SUSPECT; the node then asks its other neighbors to probe the target
//! themselves and confirms death only on a majority of corroborating
//! reports. That keeps one bad link from evicting a healthy peer. A
//! confirmed death is escalated to every seed exactly once.

use super::neighbors::LinkState;
use super::PeerShared;
use crate::net::{wire, Message};
use crate::types::{majority, now, now_millis, NodeId};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One in-flight corroboration round.
///
/// A corroborating reply must come from a neighbor this round actually
/// queried and must echo the round marker the query carried. Anything else
/// that arrives in a `DEAD_NODE` frame — in particular a neighbor's own
/// independent suspicion of the same target — is a query, and gets probed
/// and answered rather than counted.
pub struct Suspicion {
    /// Marker the round's queries carry and genuine replies echo.
    pub round: u64,
    /// Neighbors this round queried.
    pub queried: HashSet<NodeId>,
    /// Distinct corroborating reporters so far.
    pub reporters: HashSet<NodeId>,
}

/// One ping round over the whole neighbor table.
///
/// A nonce still pending from the previous round counts as a miss before
/// the new ping goes out. Suspects are handed to the corroboration task and
/// skipped here until it decides their fate.
pub async fn ping_tick(shared: &Arc<PeerShared>) {
    let mut pings = Vec::new();
    let mut suspects = Vec::new();
    {
        let mut table = shared.neighbors.write().await;
        for id in table.ids() {
            let Some(neighbor) = table.get_mut(&id) else { continue };
            if neighbor.state == LinkState::Suspect {
                continue;
            }
            if neighbor.pending_nonce.is_some() {
                neighbor.missed_pings += 1;
                warn!("PING MISS #{} for {id}", neighbor.missed_pings);
                if neighbor.missed_pings >= shared.cfg.max_missed_pings {
                    neighbor.state = LinkState::Suspect;
                    suspects.push(id);
                    continue;
                }
            }
            let nonce: u64 = rand::random();
            neighbor.pending_nonce = Some(nonce);
            pings.push((id, neighbor.tx.clone(), nonce));
        }
    }

    for (id, tx, nonce) in pings {
        super::send_to_neighbor(shared, &id, &tx, Message::Ping { nonce }).await;
    }
    for target in suspects {
        info!(
            "SUSPECT {target} after {} missed pings",
            shared.cfg.max_missed_pings
        );
        let shared = shared.clone();
        tokio::spawn(async move {
            corroborate(shared, target).await;
        });
    }
}

/// A pong from a neighbor clears the outstanding nonce and heals the link.
pub async fn handle_pong(shared: &Arc<PeerShared>, from: NodeId, nonce: u64) {
    let mut table = shared.neighbors.write().await;
    let Some(neighbor) = table.get_mut(&from) else {
        debug!("PONG from non-neighbor {from} dropped");
        return;
    };
    if neighbor.pending_nonce != Some(nonce) {
        debug!("PONG with stale nonce from {from} dropped");
        return;
    }
    neighbor.pending_nonce = None;
    neighbor.missed_pings = 0;
    if neighbor.state == LinkState::Suspect {
        neighbor.state = LinkState::Healthy;
        info!("{from} answered during suspicion, restored");
    }
}

/// Ask every other neighbor to check on `target`, wait out the window, and
/// either restore the link or confirm the death and escalate to the seeds.
pub async fn corroborate(shared: Arc<PeerShared>, target: NodeId) {
    let others = shared.neighbors.read().await.fanout_except(Some(&target));
    let asked = others.len();
    let round = now_millis();
    shared.suspicions.lock().await.insert(
        target,
        Suspicion {
            round,
            queried: others.iter().map(|(id, _)| *id).collect(),
            reporters: HashSet::new(),
        },
    );

    if asked > 0 {
        info!("corroborating suspicion of {target} with {asked} neighbors");
        for (id, tx) in others {
            super::send_to_neighbor(
                shared.as_ref(),
                &id,
                &tx,
                Message::DeadNode {
                    dead: target,
                    reporter: shared.id,
                    timestamp: round,
                },
            )
            .await;
        }
        tokio::time::sleep(shared.cfg.corroboration_window).await;
    }

    let reporters = shared
        .suspicions
        .lock()
        .await
        .remove(&target)
        .map(|s| s.reporters)
        .unwrap_or_default();
    // With nobody else to ask, our own three misses stand.
    let confirmed = asked == 0 || reporters.len() >= majority(asked);

    let mut table = shared.neighbors.write().await;
    let Some(state) = table.get_mut(&target).map(|n| n.state) else {
        return;
    };
    if state != LinkState::Suspect {
        return;
    }

    if confirmed {
        table.remove_dead(&target);
        drop(table);
        info!(
            "CONFIRMED_DEAD {target} ({}/{asked} corroborations)",
            reporters.len()
        );
        escalate(&shared, target).await;
    } else {
        if let Some(neighbor) = table.get_mut(&target) {
            neighbor.state = LinkState::Healthy;
            neighbor.missed_pings = 0;
            neighbor.pending_nonce = None;
        }
        info!(
            "suspicion of {target} not corroborated ({}/{asked}), restored",
            reporters.len()
        );
    }
}

/// Report a confirmed death to every seed. Runs once per DEAD transition:
/// the neighbor entry is gone by the time this is called, so the detector
/// cannot re-suspect the same link.
async fn escalate(shared: &Arc<PeerShared>, dead: NodeId) {
    let msg = Message::DeadNode {
        dead,
        reporter: shared.id,
        timestamp: now(),
    };
    for seed in &shared.seeds {
        if let Err(e) = wire::send_oneshot(seed.socket_addr(), &msg, shared.cfg.connect_timeout).await
        {
            warn!("DEAD_NODE escalation to seed {seed} failed: {e}");
        } else {
            info!("DEAD_NODE {dead} escalated to seed {seed}");
        }
    }
}

/// A `DEAD_NODE` frame on a peer link is either a corroborating reply for
/// one of our own rounds, or a neighbor asking for our view of the target.
///
/// A reply is only recognized when it comes from a neighbor the in-flight
/// round queried and echoes that round's marker; a neighbor independently
/// suspecting the same target carries its own marker, lands on the query
/// path, and is answered by probing the target ourselves — staying silent
/// when it still responds.
pub async fn handle_dead_node(
    shared: &Arc<PeerShared>,
    from: NodeId,
    dead: NodeId,
    reporter: NodeId,
    timestamp: u64,
) {
    if dead == shared.id {
        debug!("{from} suspects us; we beg to differ");
        return;
    }

    {
        let mut suspicions = shared.suspicions.lock().await;
        if let Some(suspicion) = suspicions.get_mut(&dead) {
            if suspicion.queried.contains(&from)
                && reporter == from
                && timestamp == suspicion.round
            {
                if suspicion.reporters.insert(reporter) {
                    info!("corroboration for {dead} from {reporter}");
                }
                return;
            }
        }
    }

    if shared.neighbors.read().await.is_dead(&dead) {
        reply_dead(shared, from, dead, timestamp).await;
        return;
    }

    let shared = shared.clone();
    tokio::spawn(async move {
        let nonce: u64 = rand::random();
        let verdict = wire::exchange(
            dead.socket_addr(),
            &Message::Ping { nonce },
            shared.cfg.connect_timeout,
            shared.cfg.probe_timeout,
        )
        .await;
        let alive = matches!(verdict, Ok(Some(Message::Pong { nonce: n })) if n == nonce);
        if alive {
            debug!("{dead} still answers; not corroborating {from}");
        } else {
            info!("probe of {dead} failed, corroborating {from}");
            reply_dead(&shared, from, dead, timestamp).await;
        }
    });
}

/// Send a corroborating report back over the querying neighbor's link,
/// echoing the marker its query carried.
async fn reply_dead(shared: &Arc<PeerShared>, to: NodeId, dead: NodeId, round: u64) {
    let Some(tx) = shared.neighbors.read().await.sender(&to) else {
        debug!("queried link {to} is gone, corroboration unsent");
        return;
    };
    super::send_to_neighbor(
        shared.as_ref(),
        &to,
        &tx,
        Message::DeadNode {
            dead,
            reporter: shared.id,
            timestamp: round,
        },
    )
    .await;
}
