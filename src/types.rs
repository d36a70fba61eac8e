//! Overlay constants and core identifiers.
//!
//! # Design Goals
//!
//! 1. **Bounded memory usage** — the gossip dedup log and all per-neighbor
//!    state carry explicit caps, so a node's footprint does not grow with
//!    overlay lifetime.
//!
//! 2. **No unilateral decisions** — every timeout below feeds either a
//!    quorum (seed consensus, neighbor corroboration) or a retry loop,
//!    never a direct state change on its own.

use crate::config::ConfigError;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

// =============================================================================
// TIMERS
// =============================================================================

/// Gossip origination period in seconds.
pub const GOSSIP_INTERVAL_SECS: u64 = 5;

/// Total messages a node originates before it becomes forward-only.
pub const MAX_ORIGINATED: u64 = 10;

/// Neighbor ping period in seconds. An unanswered ping at the next tick
/// counts as one miss.
pub const PING_INTERVAL_SECS: u64 = 13;

/// Consecutive missed pings before a neighbor is suspected.
pub const MAX_MISSED_PINGS: u32 = 3;

/// How long the suspecting node waits for corroborating reports from its
/// other neighbors before deciding a suspect's fate.
pub const CORROBORATION_WINDOW_SECS: u64 = 8;

/// Periodic status line interval in seconds.
pub const STATUS_INTERVAL_SECS: u64 = 30;

// =============================================================================
// TIMEOUTS
// =============================================================================

/// Outbound connect timeout in seconds. Applies to every dial: seed
/// registration, degree probes, neighbor attachment, one-shot broadcasts.
pub const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Reply timeout for one-shot probe exchanges (degree query, liveness probe).
pub const PROBE_TIMEOUT_SECS: u64 = 3;

/// How long a registering node waits for the seed quorum to answer with a
/// peer list. Covers one full propose/vote/commit round trip; a stalled
/// quorum simply never answers.
pub const REGISTER_REPLY_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// TOPOLOGY
// =============================================================================

/// Outbound attachment cap. Inbound attachments are uncapped so that
/// well-connected nodes can keep accumulating degree.
pub const ATTACH_CAP: usize = 3;

/// Bounded capacity of each neighbor's outbound frame channel. A neighbor
/// that cannot drain this many frames is effectively unresponsive and is
/// left to the liveness detector.
pub const NEIGHBOR_CHANNEL_CAPACITY: usize = 64;

/// Longest accepted wire frame in bytes. Frames beyond this are dropped.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

// =============================================================================
// GOSSIP DEDUP
// =============================================================================

/// Seen-hash log capacity, FIFO-evicted by first sight. Sized so an entry
/// comfortably outlives its own propagation across the overlay.
pub const MESSAGE_LOG_CAP: usize = 4096;

// =============================================================================
// BOOTSTRAP RETRY
// =============================================================================

/// First retry delay after a registration round yields no peer list.
pub const INITIAL_RETRY_DELAY_SECS: u64 = 2;

/// Retry delay multiplier per failed round.
pub const RETRY_BACKOFF_FACTOR: u32 = 2;

/// Retry delay ceiling.
pub const MAX_RETRY_DELAY_SECS: u64 = 60;

/// Overlay node identifier: listen address as `(ip, port)`.
///
/// Seeds and peers share this type; the role is decided by which side of a
/// connection the id appears on. Canonical text form is `ip:port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    pub ip: IpAddr,
    pub port: u16,
}

impl NodeId {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for NodeId {
    fn from(addr: SocketAddr) -> Self {
        Self { ip: addr.ip(), port: addr.port() }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

impl FromStr for NodeId {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SocketAddr::from_str(s).map(Self::from)
    }
}

/// Quorum size over a group of `n` participants.
pub fn majority(n: usize) -> usize {
    n / 2 + 1
}

/// Current unix time in seconds.
pub fn now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Current unix time in milliseconds. Corroboration rounds carry this as
/// their marker; whole seconds are too coarse to tell two neighbors'
/// concurrent rounds apart.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Node-level failures that abort startup or a running node.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("listen port {0} is not in the seed directory")]
    NotInDirectory(u16),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_round_trip() {
        let id: NodeId = "127.0.0.1:6001".parse().unwrap();
        assert_eq!(id.port, 6001);
        assert_eq!(id.to_string(), "127.0.0.1:6001");
        assert_eq!(id.to_string().parse::<NodeId>().unwrap(), id);
    }

    #[test]
    fn majority_thresholds() {
        assert_eq!(majority(1), 1);
        assert_eq!(majority(2), 2);
        assert_eq!(majority(3), 2);
        assert_eq!(majority(4), 3);
        assert_eq!(majority(5), 3);
    }
}
