//! Seed node: authoritative membership with quorum add/remove.
//!
//! Seeds accept registrations from peers and failure reports from anyone
//! authenticated by the ledger, and coordinate among themselves with
//! one-shot `PROPOSE_ADD` / `VOTE_ADD` / `COMMIT_ADD` / `PROPOSE_REMOVE`
//! frames. A seed that cannot observe a quorum leaves the round pending;
//! there is no unilateral commit path.

pub mod ledger;

use crate::config::NodeConfig;
use crate::net::{spawn_writer, wire, FrameReader, Message};
use crate::types::{NodeError, NodeId};
use ledger::{Ledger, ReportOutcome, VoteOutcome};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct SeedShared {
    pub id: NodeId,
    /// Every other seed in the directory.
    others: Vec<NodeId>,
    cfg: NodeConfig,
    ledger: Mutex<Ledger>,
    /// Registrants parked until their add round commits, keyed by subject.
    waiting: Mutex<HashMap<NodeId, Vec<mpsc::Sender<Message>>>>,
}

/// Running seed; exposes ledger state for tests and operators.
pub struct SeedHandle {
    pub id: NodeId,
    shared: Arc<SeedShared>,
    tasks: Vec<JoinHandle<()>>,
}

impl SeedHandle {
    pub async fn live_peers(&self) -> Vec<NodeId> {
        self.shared.ledger.lock().await.live_snapshot()
    }

    pub async fn live_count(&self) -> usize {
        self.shared.ledger.lock().await.live_count()
    }

    /// Stop accepting and stop the timers. Established connections drain
    /// on their own when the far side closes.
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Bind and run a seed. The listen port must appear in the directory: that
/// entry becomes this seed's identity.
pub async fn spawn(
    directory: Vec<NodeId>,
    port: u16,
    cfg: NodeConfig,
) -> Result<SeedHandle, NodeError> {
    let id = directory
        .iter()
        .find(|s| s.port == port)
        .copied()
        .ok_or(NodeError::NotInDirectory(port))?;
    let others: Vec<NodeId> = directory.iter().filter(|s| **s != id).copied().collect();

    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|source| NodeError::Bind {
            addr: bind_addr,
            source,
        })?;

    let shared = Arc::new(SeedShared {
        id,
        others,
        cfg,
        ledger: Mutex::new(Ledger::new(directory)),
        waiting: Mutex::new(HashMap::new()),
    });

    info!("LISTENING seed {id} ({} seed group)", shared.others.len() + 1);

    let accept = {
        let shared = shared.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let shared = shared.clone();
                        tokio::spawn(async move {
                            handle_conn(shared, stream, remote).await;
                        });
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                    }
                }
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
                let live = shared.ledger.lock().await.live_count();
                info!("status: {live} live peers");
            }
        })
    };

    Ok(SeedHandle {
        id,
        shared,
        tasks: vec![accept, status],
    })
}

async fn handle_conn(shared: Arc<SeedShared>, stream: TcpStream, remote: SocketAddr) {
    debug!("connection from {remote}");
    let (read_half, write_half) = stream.into_split();
    let reply_tx = spawn_writer(write_half);
    let mut reader = FrameReader::new(read_half);

    loop {
        match reader.next().await {
            Ok(Some(msg)) => handle_frame(&shared, msg, &reply_tx).await,
            Ok(None) => break,
            Err(e) => {
                debug!("connection from {remote} errored: {e}");
                break;
            }
        }
    }
    debug!("connection from {remote} closed");
}

async fn handle_frame(shared: &Arc<SeedShared>, msg: Message, reply_tx: &mpsc::Sender<Message>) {
    match msg {
        Message::Register { peer } => {
            info!("REGISTER from {peer}");
            let (reply, broadcast_propose, committed) = {
                let mut ledger = shared.ledger.lock().await;
                if ledger.is_live(&peer) {
                    info!("re-registration of live peer {peer}");
                    (Some(ledger.peer_list_for(&peer)), false, false)
                } else {
                    match ledger.record_vote(peer, shared.id) {
                        VoteOutcome::Committed => (Some(ledger.peer_list_for(&peer)), false, true),
                        VoteOutcome::Counted(n) => {
                            info!("ADD round for {peer}: {n}/{} votes", ledger.quorum());
                            (None, true, false)
                        }
                        // Round already open with our vote in it: the peer
                        // re-sent REGISTER while consensus is in flight.
                        VoteOutcome::Duplicate | VoteOutcome::AlreadyLive => (None, false, false),
                    }
                }
            };

            match reply {
                Some(peers) => {
                    if committed {
                        commit_locally(shared, peer).await;
                    }
                    send_reply(reply_tx, Message::PeerList { peers }).await;
                }
                None => {
                    shared
                        .waiting
                        .lock()
                        .await
                        .entry(peer)
                        .or_default()
                        .push(reply_tx.clone());
                    if broadcast_propose {
                        broadcast(
                            shared,
                            Message::ProposeAdd {
                                peer,
                                proposer: shared.id,
                            },
                        );
                    }
                }
            }
        }

        Message::ProposeAdd { peer, proposer } => {
            info!("PROPOSE_ADD {peer} from {proposer}");
            let (vote, committed) = {
                let mut ledger = shared.ledger.lock().await;
                match ledger.record_vote(peer, proposer) {
                    VoteOutcome::AlreadyLive => {
                        debug!("proposal for already-live {peer} dropped");
                        return;
                    }
                    VoteOutcome::Committed => (false, true),
                    VoteOutcome::Counted(_) | VoteOutcome::Duplicate => {
                        if ledger.has_voted(&peer, &shared.id) {
                            (false, false)
                        } else {
                            match ledger.record_vote(peer, shared.id) {
                                VoteOutcome::Committed => (true, true),
                                _ => (true, false),
                            }
                        }
                    }
                }
            };

            if vote {
                info!("VOTE_ADD {peer}");
                broadcast(
                    shared,
                    Message::VoteAdd {
                        peer,
                        voter: shared.id,
                    },
                );
            }
            if committed {
                commit_locally(shared, peer).await;
            }
        }

        Message::VoteAdd { peer, voter } => {
            let outcome = shared.ledger.lock().await.record_vote(peer, voter);
            match outcome {
                VoteOutcome::Committed => {
                    info!("VOTE_ADD {peer} from {voter} reached quorum");
                    commit_locally(shared, peer).await;
                }
                VoteOutcome::Counted(n) => {
                    info!("VOTE_ADD {peer} from {voter} ({n} votes)");
                }
                VoteOutcome::Duplicate => debug!("duplicate VOTE_ADD {peer} from {voter}"),
                VoteOutcome::AlreadyLive => debug!("late VOTE_ADD for live {peer}"),
            }
        }

        Message::CommitAdd { peer } => {
            let newly = shared.ledger.lock().await.commit_add(peer);
            if newly {
                info!("COMMIT_ADD {peer}");
            } else {
                debug!("redundant COMMIT_ADD {peer}");
            }
            answer_waiters(shared, peer).await;
        }

        Message::DeadNode {
            dead,
            reporter,
            timestamp: _,
        } => {
            let outcome = shared.ledger.lock().await.record_report(dead, reporter);
            match outcome {
                ReportOutcome::Removed => {
                    info!("DEAD_NODE {dead}: report quorum reached, removed");
                    broadcast(
                        shared,
                        Message::ProposeRemove {
                            dead,
                            proposer: shared.id,
                        },
                    );
                }
                ReportOutcome::Counted(n) => {
                    info!("DEAD_NODE {dead} reported by {reporter} ({n} reports)");
                }
                ReportOutcome::Duplicate => {
                    debug!("duplicate DEAD_NODE {dead} from {reporter}");
                }
                ReportOutcome::UnknownReporter => {
                    warn!("DEAD_NODE {dead} from unknown reporter {reporter} dropped");
                }
            }
        }

        Message::ProposeRemove { dead, proposer } => {
            let was_live = shared.ledger.lock().await.commit_remove(&dead);
            if was_live {
                info!("PROPOSE_REMOVE {dead} from {proposer}: removed");
            } else {
                debug!("PROPOSE_REMOVE {dead} from {proposer}: not live here");
            }
        }

        other => {
            warn!("unexpected {} frame on seed, dropped", other.kind());
        }
    }
}

/// Local quorum observed: tell the other seeds and answer parked registrants.
async fn commit_locally(shared: &Arc<SeedShared>, peer: NodeId) {
    info!("COMMIT_ADD {peer} (local quorum)");
    broadcast(shared, Message::CommitAdd { peer });
    answer_waiters(shared, peer).await;
}

/// Answer every registrant parked on `peer` with the current peer list.
async fn answer_waiters(shared: &Arc<SeedShared>, peer: NodeId) {
    let waiters = shared.waiting.lock().await.remove(&peer);
    let Some(waiters) = waiters else { return };
    let peers = shared.ledger.lock().await.peer_list_for(&peer);
    for tx in waiters {
        send_reply(&tx, Message::PeerList { peers: peers.clone() }).await;
    }
}

async fn send_reply(tx: &mpsc::Sender<Message>, msg: Message) {
    if tx.send(msg).await.is_err() {
        debug!("registrant went away before the reply");
    }
}

/// One-shot a frame to every other seed; unreachable seeds are skipped.
fn broadcast(shared: &Arc<SeedShared>, msg: Message) {
    for seed in &shared.others {
        let seed = *seed;
        let msg = msg.clone();
        let connect_timeout = shared.cfg.connect_timeout;
        tokio::spawn(async move {
            if let Err(e) = wire::send_oneshot(seed.socket_addr(), &msg, connect_timeout).await {
                warn!("seed {seed} unreachable for {}: {e}", msg.kind());
            }
        });
    }
}
