//! Peer node: bootstrap, inbound acceptance, gossip and liveness timers.
//!
//! Every connection gets its own reader task; every long-lived link gets a
//! writer task behind a bounded channel. The node itself runs two periodic
//! timers (gossip origination, neighbor pings) plus a status line, and all
//! shared state lives behind per-structure locks on [`PeerShared`].

pub mod bootstrap;
pub mod gossip;
pub mod liveness;
pub mod neighbors;

use crate::config::NodeConfig;
use crate::net::{spawn_writer, FrameReader, Message};
use crate::types::{NodeError, NodeId};
use gossip::MessageLog;
use liveness::Suspicion;
use neighbors::{Neighbor, NeighborTable};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Grace given to the single retry after a neighbor's channel is found full.
const SEND_RETRY: Duration = Duration::from_millis(500);

/// State shared by every task of one peer.
pub struct PeerShared {
    pub id: NodeId,
    pub seeds: Vec<NodeId>,
    pub cfg: NodeConfig,
    pub neighbors: RwLock<NeighborTable>,
    pub log: RwLock<MessageLog>,
    /// In-flight corroboration rounds, keyed by suspect.
    pub suspicions: Mutex<HashMap<NodeId, Suspicion>>,
}

impl PeerShared {
    pub fn new(id: NodeId, seeds: Vec<NodeId>, cfg: NodeConfig) -> Self {
        Self {
            id,
            seeds,
            neighbors: RwLock::new(NeighborTable::new(cfg.attach_cap)),
            log: RwLock::new(MessageLog::new(cfg.message_log_cap)),
            suspicions: Mutex::new(HashMap::new()),
            cfg,
        }
    }
}

/// Running peer; exposes overlay state for tests and operators.
pub struct PeerHandle {
    pub id: NodeId,
    shared: Arc<PeerShared>,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerHandle {
    pub async fn degree(&self) -> usize {
        self.shared.neighbors.read().await.degree()
    }

    pub async fn neighbor_ids(&self) -> Vec<NodeId> {
        self.shared.neighbors.read().await.ids()
    }

    pub async fn outbound_count(&self) -> usize {
        self.shared.neighbors.read().await.outbound_count()
    }

    /// Distinct gossip messages this peer has seen (originated included).
    pub async fn gossip_seen(&self) -> usize {
        self.shared.log.read().await.len()
    }

    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Bind and run a peer.
pub async fn spawn(
    seeds: Vec<NodeId>,
    port: u16,
    bind_ip: Option<IpAddr>,
    cfg: NodeConfig,
) -> Result<PeerHandle, NodeError> {
    let ip = bind_ip.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let id = NodeId::new(ip, port);
    let bind_addr = SocketAddr::new(ip, port);
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|source| NodeError::Bind {
            addr: bind_addr,
            source,
        })?;

    let shared = Arc::new(PeerShared::new(id, seeds, cfg));
    info!("LISTENING peer {id}");

    let accept = {
        let shared = shared.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let shared = shared.clone();
                        tokio::spawn(async move {
                            handle_inbound(shared, stream, remote).await;
                        });
                    }
                    Err(e) => warn!("accept failed: {e}"),
                }
            }
        })
    };

    let boot = {
        let shared = shared.clone();
        tokio::spawn(async move {
            bootstrap::run(shared).await;
        })
    };

    let gossip_timer = {
        let shared = shared.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(shared.cfg.gossip_interval);
            tick.tick().await;
            let mut seq = 0u64;
            while seq < shared.cfg.max_originated {
                tick.tick().await;
                gossip::originate(&shared, seq).await;
                seq += 1;
            }
            info!("origination cap reached; forwarding only");
        })
    };

    let ping_timer = {
        let shared = shared.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(shared.cfg.ping_interval);
            tick.tick().await;
            loop {
                tick.tick().await;
                liveness::ping_tick(&shared).await;
            }
        })
    };

    let status = {
        let shared = shared.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(shared.cfg.status_interval);
            tick.tick().await;
            loop {
                tick.tick().await;
                let degree = shared.neighbors.read().await.degree();
                let seen = shared.log.read().await.len();
                info!("status: {degree} neighbors, {seen} gossip seen");
            }
        })
    };

    Ok(PeerHandle {
        id,
        shared,
        tasks: vec![accept, boot, gossip_timer, ping_timer, status],
    })
}

/// Serve one inbound connection. Probe connections (`DEG_QUERY`, stranger
/// `PING`) are answered statelessly; a `CONNECT` upgrades the connection to
/// a neighbor link.
async fn handle_inbound(shared: Arc<PeerShared>, stream: TcpStream, remote: SocketAddr) {
    debug!("inbound connection from {remote}");
    let (read_half, write_half) = stream.into_split();
    let tx = spawn_writer(write_half);
    let mut reader = FrameReader::new(read_half);

    loop {
        let msg = match reader.next().await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                debug!("inbound connection from {remote} closed");
                return;
            }
            Err(e) => {
                debug!("inbound connection from {remote} errored: {e}");
                return;
            }
        };

        match msg {
            Message::Connect { peer } => {
                let insert = shared
                    .neighbors
                    .write()
                    .await
                    .insert(peer, Neighbor::new(tx.clone(), 0, false));
                match insert {
                    Ok(()) => {
                        info!("CONNECT from {peer} accepted (inbound)");
                        link_loop(shared, reader, peer).await;
                    }
                    Err(reason) => {
                        warn!("CONNECT from {peer} refused: {reason:?}");
                    }
                }
                return;
            }
            Message::DegQuery => {
                let degree = shared.neighbors.read().await.degree() as u32;
                if tx.send(Message::DegReply { degree }).await.is_err() {
                    return;
                }
            }
            Message::Ping { nonce } => {
                // Liveness probe from a non-neighbor checking on us.
                if tx.send(Message::Pong { nonce }).await.is_err() {
                    return;
                }
            }
            other => {
                warn!(
                    "unexpected {} before CONNECT from {remote}, dropped",
                    other.kind()
                );
            }
        }
    }
}

/// Serve an established neighbor link until it closes.
///
/// The entry is left in the table on EOF: a vanished peer keeps missing
/// pings until the detector corroborates and escalates, which is the only
/// path that reports the death to the seeds.
pub(crate) async fn link_loop(
    shared: Arc<PeerShared>,
    mut reader: FrameReader,
    peer: NodeId,
) {
    loop {
        let msg = match reader.next().await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(e) => {
                debug!("link to {peer} errored: {e}");
                break;
            }
        };

        match msg {
            Message::Gossip {
                originator,
                seq,
                timestamp,
                payload,
            } => {
                gossip::handle_gossip(&shared, peer, originator, seq, timestamp, payload).await;
            }
            Message::Ping { nonce } => {
                let tx = shared.neighbors.read().await.sender(&peer);
                if let Some(tx) = tx {
                    send_to_neighbor(&shared, &peer, &tx, Message::Pong { nonce }).await;
                }
            }
            Message::Pong { nonce } => {
                liveness::handle_pong(&shared, peer, nonce).await;
            }
            Message::DeadNode {
                dead,
                reporter,
                timestamp,
            } => {
                liveness::handle_dead_node(&shared, peer, dead, reporter, timestamp).await;
            }
            Message::DegQuery => {
                let (degree, tx) = {
                    let table = shared.neighbors.read().await;
                    (table.degree() as u32, table.sender(&peer))
                };
                if let Some(tx) = tx {
                    send_to_neighbor(&shared, &peer, &tx, Message::DegReply { degree }).await;
                }
            }
            other => {
                warn!("unexpected {} on link to {peer}, dropped", other.kind());
            }
        }
    }
    debug!("link reader for {peer} ended");
}

/// Queue a frame for a neighbor: one bounded retry on a full channel, then
/// count a missed ping and leave the rest to the liveness detector. A
/// failed neighbor never aborts a fan-out.
pub(crate) async fn send_to_neighbor(
    shared: &PeerShared,
    id: &NodeId,
    tx: &mpsc::Sender<Message>,
    msg: Message,
) {
    let kind = msg.kind();
    match tx.try_send(msg) {
        Ok(()) => {}
        Err(TrySendError::Full(msg)) => {
            if tx.send_timeout(msg, SEND_RETRY).await.is_err() {
                mark_send_failure(shared, id, kind).await;
            }
        }
        Err(TrySendError::Closed(_)) => {
            mark_send_failure(shared, id, kind).await;
        }
    }
}

async fn mark_send_failure(shared: &PeerShared, id: &NodeId, kind: &'static str) {
    warn!("send of {kind} to {id} failed");
    if let Some(neighbor) = shared.neighbors.write().await.get_mut(id) {
        neighbor.missed_pings += 1;
    }
}
