//! Seed directory loading and runtime tunables.

use crate::types::{self, NodeId};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("{path}:{line}: expected `IP,PORT`, got `{content}`")]
    BadLine {
        path: String,
        line: usize,
        content: String,
    },

    #[error("{path}: seed directory is empty")]
    Empty { path: String },
}

/// Load the seed directory: one `IP,PORT` line per seed, ASCII.
///
/// Blank lines are skipped; anything else malformed fails the whole load.
pub fn load_seed_directory<P: AsRef<Path>>(path: P) -> Result<Vec<NodeId>, ConfigError> {
    let path_str = path.as_ref().display().to_string();
    let data = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path_str.clone(),
        source,
    })?;

    let mut seeds = Vec::new();
    for (idx, raw) in data.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let bad = || ConfigError::BadLine {
            path: path_str.clone(),
            line: idx + 1,
            content: raw.to_string(),
        };
        let (ip_part, port_part) = line.split_once(',').ok_or_else(bad)?;
        let ip: IpAddr = ip_part.trim().parse().map_err(|_| bad())?;
        let port: u16 = port_part.trim().parse().map_err(|_| bad())?;
        seeds.push(NodeId::new(ip, port));
    }

    if seeds.is_empty() {
        return Err(ConfigError::Empty { path: path_str });
    }
    Ok(seeds)
}

/// Runtime tunables. The binary runs the defaults; tests shrink the
/// intervals to keep wall-clock time down.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Gossip origination period.
    pub gossip_interval: Duration,
    /// Messages originated before the node becomes forward-only.
    pub max_originated: u64,
    /// Neighbor ping period.
    pub ping_interval: Duration,
    /// Consecutive misses before suspicion.
    pub max_missed_pings: u32,
    /// Outbound attachment cap.
    pub attach_cap: usize,
    /// Dial timeout for every outbound connect.
    pub connect_timeout: Duration,
    /// Reply timeout for one-shot probes.
    pub probe_timeout: Duration,
    /// Wait for corroborating reports before deciding a suspect's fate.
    pub corroboration_window: Duration,
    /// Wait for the seed quorum to answer a registration.
    pub register_reply_timeout: Duration,
    /// Seen-hash log capacity.
    pub message_log_cap: usize,
    /// First registration retry delay.
    pub initial_retry_delay: Duration,
    /// Registration retry delay ceiling.
    pub max_retry_delay: Duration,
    /// Periodic status line interval.
    pub status_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            gossip_interval: Duration::from_secs(types::GOSSIP_INTERVAL_SECS),
            max_originated: types::MAX_ORIGINATED,
            ping_interval: Duration::from_secs(types::PING_INTERVAL_SECS),
            max_missed_pings: types::MAX_MISSED_PINGS,
            attach_cap: types::ATTACH_CAP,
            connect_timeout: Duration::from_secs(types::CONNECT_TIMEOUT_SECS),
            probe_timeout: Duration::from_secs(types::PROBE_TIMEOUT_SECS),
            corroboration_window: Duration::from_secs(types::CORROBORATION_WINDOW_SECS),
            register_reply_timeout: Duration::from_secs(types::REGISTER_REPLY_TIMEOUT_SECS),
            message_log_cap: types::MESSAGE_LOG_CAP,
            initial_retry_delay: Duration::from_secs(types::INITIAL_RETRY_DELAY_SECS),
            max_retry_delay: Duration::from_secs(types::MAX_RETRY_DELAY_SECS),
            status_interval: Duration::from_secs(types::STATUS_INTERVAL_SECS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_seed_directory() {
        let path = write_temp(
            "gossamer_cfg_ok.csv",
            "127.0.0.1,5001\n127.0.0.1,5002\n\n127.0.0.1,5003\n",
        );
        let seeds = load_seed_directory(&path).unwrap();
        assert_eq!(seeds.len(), 3);
        assert_eq!(seeds[1], "127.0.0.1:5002".parse().unwrap());
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn rejects_bad_port() {
        let path = write_temp("gossamer_cfg_bad.csv", "127.0.0.1,notaport\n");
        let err = load_seed_directory(&path).unwrap_err();
        assert!(matches!(err, ConfigError::BadLine { line: 1, .. }));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn rejects_empty_directory() {
        let path = write_temp("gossamer_cfg_empty.csv", "\n\n");
        assert!(matches!(
            load_seed_directory(&path).unwrap_err(),
            ConfigError::Empty { .. }
        ));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn rejects_missing_file() {
        let err = load_seed_directory("/nonexistent/gossamer.csv").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
