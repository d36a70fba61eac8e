//! Control protocol frames and their line codec.
//!
//! Every frame is one newline-terminated ASCII line: the kind token followed
//! by whitespace-delimited fields. Node ids travel either as a single
//! `ip:port` token or as separate `ip port` fields, matching the frame
//! layouts below. Parsing fails closed: a malformed line yields an error and
//! is never half-applied.

use crate::types::NodeId;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("empty frame")]
    Empty,

    #[error("unknown frame kind `{0}`")]
    UnknownKind(String),

    #[error("malformed {kind} frame: {reason}")]
    Malformed {
        kind: &'static str,
        reason: String,
    },
}

/// Every frame kind the overlay speaks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `REGISTER <ip> <port>` — peer announces itself to a seed.
    Register { peer: NodeId },
    /// `PROPOSE_ADD <ip> <port> <proposer>` — seed opens an add round.
    ProposeAdd { peer: NodeId, proposer: NodeId },
    /// `VOTE_ADD <ip> <port> <voter>` — seed votes in an add round.
    VoteAdd { peer: NodeId, voter: NodeId },
    /// `COMMIT_ADD <ip> <port>` — add round reached quorum.
    CommitAdd { peer: NodeId },
    /// `PEER_LIST [<ip:port>]*` — seed answers a registration.
    PeerList { peers: Vec<NodeId> },
    /// `DEG_QUERY` — ask a peer for its current degree.
    DegQuery,
    /// `DEG_REPLY <degree>` — degree answer.
    DegReply { degree: u32 },
    /// `CONNECT <ip> <port>` — dialer installs itself as a neighbor.
    Connect { peer: NodeId },
    /// `GOSSIP <originator> <seq> <timestamp> <payload>` — flooded message.
    Gossip {
        originator: NodeId,
        seq: u64,
        timestamp: u64,
        payload: String,
    },
    /// `PING <nonce>` — liveness check.
    Ping { nonce: u64 },
    /// `PONG <nonce>` — liveness answer, echoing the nonce.
    Pong { nonce: u64 },
    /// `DEAD_NODE <dead_ip> <dead_port> <reporter_ip> <reporter_port> <ts>`
    /// — failure report (to seeds) or suspicion query (between peers).
    DeadNode {
        dead: NodeId,
        reporter: NodeId,
        timestamp: u64,
    },
    /// `PROPOSE_REMOVE <ip> <port> <proposer>` — remove quorum reached.
    ProposeRemove { dead: NodeId, proposer: NodeId },
}

impl Message {
    /// Wire token identifying the frame kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Register { .. } => "REGISTER",
            Message::ProposeAdd { .. } => "PROPOSE_ADD",
            Message::VoteAdd { .. } => "VOTE_ADD",
            Message::CommitAdd { .. } => "COMMIT_ADD",
            Message::PeerList { .. } => "PEER_LIST",
            Message::DegQuery => "DEG_QUERY",
            Message::DegReply { .. } => "DEG_REPLY",
            Message::Connect { .. } => "CONNECT",
            Message::Gossip { .. } => "GOSSIP",
            Message::Ping { .. } => "PING",
            Message::Pong { .. } => "PONG",
            Message::DeadNode { .. } => "DEAD_NODE",
            Message::ProposeRemove { .. } => "PROPOSE_REMOVE",
        }
    }

    /// Render the frame as a wire line, without the terminating newline.
    pub fn encode(&self) -> String {
        match self {
            Message::Register { peer } => {
                format!("REGISTER {} {}", peer.ip, peer.port)
            }
            Message::ProposeAdd { peer, proposer } => {
                format!("PROPOSE_ADD {} {} {}", peer.ip, peer.port, proposer)
            }
            Message::VoteAdd { peer, voter } => {
                format!("VOTE_ADD {} {} {}", peer.ip, peer.port, voter)
            }
            Message::CommitAdd { peer } => {
                format!("COMMIT_ADD {} {}", peer.ip, peer.port)
            }
            Message::PeerList { peers } => {
                let mut line = String::from("PEER_LIST");
                for p in peers {
                    line.push(' ');
                    line.push_str(&p.to_string());
                }
                line
            }
            Message::DegQuery => "DEG_QUERY".to_string(),
            Message::DegReply { degree } => format!("DEG_REPLY {degree}"),
            Message::Connect { peer } => {
                format!("CONNECT {} {}", peer.ip, peer.port)
            }
            Message::Gossip {
                originator,
                seq,
                timestamp,
                payload,
            } => {
                format!("GOSSIP {originator} {seq} {timestamp} {payload}")
            }
            Message::Ping { nonce } => format!("PING {nonce}"),
            Message::Pong { nonce } => format!("PONG {nonce}"),
            Message::DeadNode {
                dead,
                reporter,
                timestamp,
            } => {
                format!(
                    "DEAD_NODE {} {} {} {} {}",
                    dead.ip, dead.port, reporter.ip, reporter.port, timestamp
                )
            }
            Message::ProposeRemove { dead, proposer } => {
                format!("PROPOSE_REMOVE {} {} {}", dead.ip, dead.port, proposer)
            }
        }
    }

    /// Parse one wire line (newline already stripped).
    pub fn parse(line: &str) -> Result<Message, WireError> {
        let mut parts = line.split_whitespace();
        let kind = parts.next().ok_or(WireError::Empty)?;
        let fields: Vec<&str> = parts.collect();

        match kind {
            "REGISTER" => {
                let peer = ip_port(&fields, 0, "REGISTER")?;
                expect_len(&fields, 2, "REGISTER")?;
                Ok(Message::Register { peer })
            }
            "PROPOSE_ADD" => {
                let peer = ip_port(&fields, 0, "PROPOSE_ADD")?;
                let proposer = id_field(&fields, 2, "PROPOSE_ADD")?;
                expect_len(&fields, 3, "PROPOSE_ADD")?;
                Ok(Message::ProposeAdd { peer, proposer })
            }
            "VOTE_ADD" => {
                let peer = ip_port(&fields, 0, "VOTE_ADD")?;
                let voter = id_field(&fields, 2, "VOTE_ADD")?;
                expect_len(&fields, 3, "VOTE_ADD")?;
                Ok(Message::VoteAdd { peer, voter })
            }
            "COMMIT_ADD" => {
                let peer = ip_port(&fields, 0, "COMMIT_ADD")?;
                expect_len(&fields, 2, "COMMIT_ADD")?;
                Ok(Message::CommitAdd { peer })
            }
            "PEER_LIST" => {
                let mut peers = Vec::with_capacity(fields.len());
                for f in &fields {
                    peers.push(NodeId::from_str(f).map_err(|_| WireError::Malformed {
                        kind: "PEER_LIST",
                        reason: format!("bad peer id `{f}`"),
                    })?);
                }
                Ok(Message::PeerList { peers })
            }
            "DEG_QUERY" => {
                expect_len(&fields, 0, "DEG_QUERY")?;
                Ok(Message::DegQuery)
            }
            "DEG_REPLY" => {
                let degree = num_field(&fields, 0, "DEG_REPLY")?;
                expect_len(&fields, 1, "DEG_REPLY")?;
                Ok(Message::DegReply { degree })
            }
            "CONNECT" => {
                let peer = ip_port(&fields, 0, "CONNECT")?;
                expect_len(&fields, 2, "CONNECT")?;
                Ok(Message::Connect { peer })
            }
            "GOSSIP" => {
                // The payload is the whole remainder of the line; re-split
                // with a bounded splitter so it survives verbatim.
                let mut parts = line.splitn(5, char::is_whitespace);
                parts.next(); // kind token
                let originator = parts.next().unwrap_or_default();
                let seq = parts.next().unwrap_or_default();
                let timestamp = parts.next().unwrap_or_default();
                let payload = parts.next().ok_or_else(|| WireError::Malformed {
                    kind: "GOSSIP",
                    reason: "missing payload".to_string(),
                })?;
                let originator =
                    NodeId::from_str(originator).map_err(|_| WireError::Malformed {
                        kind: "GOSSIP",
                        reason: format!("bad originator `{originator}`"),
                    })?;
                let seq: u64 = seq.parse().map_err(|_| WireError::Malformed {
                    kind: "GOSSIP",
                    reason: format!("bad seq `{seq}`"),
                })?;
                let timestamp: u64 = timestamp.parse().map_err(|_| WireError::Malformed {
                    kind: "GOSSIP",
                    reason: format!("bad timestamp `{timestamp}`"),
                })?;
                Ok(Message::Gossip {
                    originator,
                    seq,
                    timestamp,
                    payload: payload.to_string(),
                })
            }
            "PING" => {
                let nonce = num_field(&fields, 0, "PING")?;
                expect_len(&fields, 1, "PING")?;
                Ok(Message::Ping { nonce })
            }
            "PONG" => {
                let nonce = num_field(&fields, 0, "PONG")?;
                expect_len(&fields, 1, "PONG")?;
                Ok(Message::Pong { nonce })
            }
            "DEAD_NODE" => {
                let dead = ip_port(&fields, 0, "DEAD_NODE")?;
                let reporter = ip_port(&fields, 2, "DEAD_NODE")?;
                let timestamp = num_field(&fields, 4, "DEAD_NODE")?;
                expect_len(&fields, 5, "DEAD_NODE")?;
                Ok(Message::DeadNode {
                    dead,
                    reporter,
                    timestamp,
                })
            }
            "PROPOSE_REMOVE" => {
                let dead = ip_port(&fields, 0, "PROPOSE_REMOVE")?;
                let proposer = id_field(&fields, 2, "PROPOSE_REMOVE")?;
                expect_len(&fields, 3, "PROPOSE_REMOVE")?;
                Ok(Message::ProposeRemove { dead, proposer })
            }
            other => Err(WireError::UnknownKind(other.to_string())),
        }
    }
}

fn expect_len(fields: &[&str], want: usize, kind: &'static str) -> Result<(), WireError> {
    if fields.len() == want {
        Ok(())
    } else {
        Err(WireError::Malformed {
            kind,
            reason: format!("expected {want} fields, got {}", fields.len()),
        })
    }
}

fn field<'a>(fields: &[&'a str], idx: usize, kind: &'static str) -> Result<&'a str, WireError> {
    fields.get(idx).copied().ok_or_else(|| WireError::Malformed {
        kind,
        reason: format!("missing field {idx}"),
    })
}

/// Two consecutive fields `ip port` starting at `idx`.
fn ip_port(fields: &[&str], idx: usize, kind: &'static str) -> Result<NodeId, WireError> {
    let ip_str = field(fields, idx, kind)?;
    let port_str = field(fields, idx + 1, kind)?;
    let ip = ip_str.parse().map_err(|_| WireError::Malformed {
        kind,
        reason: format!("bad ip `{ip_str}`"),
    })?;
    let port = port_str.parse().map_err(|_| WireError::Malformed {
        kind,
        reason: format!("bad port `{port_str}`"),
    })?;
    Ok(NodeId::new(ip, port))
}

/// One `ip:port` token at `idx`.
fn id_field(fields: &[&str], idx: usize, kind: &'static str) -> Result<NodeId, WireError> {
    let s = field(fields, idx, kind)?;
    NodeId::from_str(s).map_err(|_| WireError::Malformed {
        kind,
        reason: format!("bad node id `{s}`"),
    })
}

fn num_field<T: FromStr>(fields: &[&str], idx: usize, kind: &'static str) -> Result<T, WireError> {
    let s = field(fields, idx, kind)?;
    s.parse().map_err(|_| WireError::Malformed {
        kind,
        reason: format!("bad number `{s}`"),
    })
}
