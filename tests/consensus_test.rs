//! Seed quorum integration tests: in-process seed groups driven over raw
//! TCP, asserting on ledger state through the seed handles.

use gossamer::config::NodeConfig;
use gossamer::seed::{self, SeedHandle};
use gossamer::types::{now, NodeId};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

fn test_cfg() -> NodeConfig {
    NodeConfig {
        connect_timeout: Duration::from_secs(1),
        register_reply_timeout: Duration::from_secs(2),
        status_interval: Duration::from_secs(60),
        ..NodeConfig::default()
    }
}

/// Reserve distinct localhost ports by binding and dropping listeners.
fn free_ports(n: usize) -> Vec<u16> {
    let listeners: Vec<std::net::TcpListener> = (0..n)
        .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    listeners
        .iter()
        .map(|l| l.local_addr().unwrap().port())
        .collect()
}

fn directory(ports: &[u16]) -> Vec<NodeId> {
    ports
        .iter()
        .map(|p| format!("127.0.0.1:{p}").parse().unwrap())
        .collect()
}

async fn spawn_group(ports: &[u16]) -> Vec<SeedHandle> {
    let dir = directory(ports);
    let mut handles = Vec::new();
    for port in ports {
        handles.push(seed::spawn(dir.clone(), *port, test_cfg()).await.unwrap());
    }
    handles
}

/// Write one line to `addr`, wait up to `wait` for a single reply line.
async fn request_reply(addr: NodeId, line: &str, wait: Duration) -> Option<String> {
    let stream = TcpStream::connect(addr.socket_addr()).await.ok()?;
    let (read_half, mut write_half) = stream.into_split();
    write_half
        .write_all(format!("{line}\n").as_bytes())
        .await
        .ok()?;
    let mut reader = BufReader::new(read_half);
    let mut reply = String::new();
    match timeout(wait, reader.read_line(&mut reply)).await {
        Ok(Ok(n)) if n > 0 => Some(reply.trim_end().to_string()),
        _ => None,
    }
}

/// Write one line and close.
async fn send_line(addr: NodeId, line: &str) {
    let mut stream = TcpStream::connect(addr.socket_addr()).await.unwrap();
    stream
        .write_all(format!("{line}\n").as_bytes())
        .await
        .unwrap();
    stream.flush().await.unwrap();
}

async fn register(seed: NodeId, peer: NodeId) -> Option<String> {
    request_reply(
        seed,
        &format!("REGISTER {} {}", peer.ip, peer.port),
        Duration::from_secs(3),
    )
    .await
}

#[tokio::test]
async fn single_seed_starts_empty_and_commits_alone() {
    let ports = free_ports(1);
    let seeds = spawn_group(&ports).await;
    assert_eq!(seeds[0].live_count().await, 0);

    let peer: NodeId = "127.0.0.1:6001".parse().unwrap();
    let reply = register(seeds[0].id, peer).await.expect("no peer list");
    // First peer of an empty overlay: the list carries no other peers.
    assert_eq!(reply, "PEER_LIST");
    assert_eq!(seeds[0].live_peers().await, vec![peer]);

    for s in &seeds {
        s.shutdown();
    }
}

#[tokio::test]
async fn three_seed_quorum_commits_registration() {
    let ports = free_ports(3);
    let seeds = spawn_group(&ports).await;

    let peer: NodeId = "127.0.0.1:6001".parse().unwrap();
    let reply = register(seeds[0].id, peer).await.expect("no peer list");
    assert_eq!(reply, "PEER_LIST");

    // The commit must reach a majority of the group within the window.
    let mut committed = 0;
    for _ in 0..40 {
        let mut n = 0;
        for s in &seeds {
            if s.live_peers().await.contains(&peer) {
                n += 1;
            }
        }
        committed = n;
        if committed >= 2 {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert!(
        committed >= 2,
        "commit reached only {committed} of 3 seeds"
    );

    for s in &seeds {
        s.shutdown();
    }
}

#[tokio::test]
async fn reregistration_is_idempotent() {
    let ports = free_ports(3);
    let seeds = spawn_group(&ports).await;
    let peer: NodeId = "127.0.0.1:6001".parse().unwrap();

    assert!(register(seeds[0].id, peer).await.is_some());
    // Second registration answers immediately without a new round.
    let reply = register(seeds[1].id, peer)
        .await
        .or(register(seeds[0].id, peer).await)
        .expect("re-registration got no peer list");
    assert_eq!(reply, "PEER_LIST");
    assert_eq!(seeds[0].live_count().await, 1);

    for s in &seeds {
        s.shutdown();
    }
}

#[tokio::test]
async fn report_quorum_removes_peer() {
    let ports = free_ports(3);
    let seeds = spawn_group(&ports).await;
    let victim: NodeId = "127.0.0.1:6001".parse().unwrap();
    let witness: NodeId = "127.0.0.1:6002".parse().unwrap();

    assert!(register(seeds[0].id, victim).await.is_some());
    assert!(register(seeds[1].id, witness).await.is_some());

    // Wait for every seed to hold both peers before reporting.
    for _ in 0..40 {
        let mut all = true;
        for s in &seeds {
            if s.live_count().await != 2 {
                all = false;
            }
        }
        if all {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }

    // Two distinct reporters — one live peer, one seed — reach the quorum
    // of 2 at the first seed, which then notifies the rest.
    let ts = now();
    send_line(
        seeds[0].id,
        &format!(
            "DEAD_NODE {} {} {} {} {ts}",
            victim.ip, victim.port, witness.ip, witness.port
        ),
    )
    .await;
    send_line(
        seeds[0].id,
        &format!(
            "DEAD_NODE {} {} {} {} {ts}",
            victim.ip, victim.port, seeds[1].id.ip, seeds[1].id.port
        ),
    )
    .await;

    let mut gone_everywhere = false;
    for _ in 0..60 {
        let mut gone = true;
        for s in &seeds {
            if s.live_peers().await.contains(&victim) {
                gone = false;
            }
        }
        if gone {
            gone_everywhere = true;
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert!(gone_everywhere, "victim still live on some seed");
    assert!(seeds[0].live_peers().await.contains(&witness));

    for s in &seeds {
        s.shutdown();
    }
}

#[tokio::test]
async fn duplicate_reports_do_not_reach_quorum() {
    let ports = free_ports(3);
    let seeds = spawn_group(&ports).await;
    let victim: NodeId = "127.0.0.1:6001".parse().unwrap();
    let witness: NodeId = "127.0.0.1:6002".parse().unwrap();

    assert!(register(seeds[0].id, victim).await.is_some());
    assert!(register(seeds[0].id, witness).await.is_some());

    // The same reporter, twice: one distinct report, no quorum.
    let ts = now();
    for _ in 0..2 {
        send_line(
            seeds[0].id,
            &format!(
                "DEAD_NODE {} {} {} {} {ts}",
                victim.ip, victim.port, witness.ip, witness.port
            ),
        )
        .await;
    }
    sleep(Duration::from_millis(500)).await;
    assert!(seeds[0].live_peers().await.contains(&victim));

    for s in &seeds {
        s.shutdown();
    }
}

#[tokio::test]
async fn unknown_reporter_is_ignored() {
    let ports = free_ports(1);
    let seeds = spawn_group(&ports).await;
    let peer: NodeId = "127.0.0.1:6001".parse().unwrap();

    assert!(register(seeds[0].id, peer).await.is_some());
    let ts = now();
    send_line(
        seeds[0].id,
        &format!("DEAD_NODE {} {} 127.0.0.1 9999 {ts}", peer.ip, peer.port),
    )
    .await;
    sleep(Duration::from_millis(300)).await;
    assert!(seeds[0].live_peers().await.contains(&peer));

    seeds[0].shutdown();
}

#[tokio::test]
async fn isolated_seed_cannot_commit() {
    // A directory of three, but only one seed actually runs: it can never
    // observe a quorum, so the registration stays pending forever.
    let ports = free_ports(3);
    let dir = directory(&ports);
    let lone = seed::spawn(dir, ports[0], test_cfg()).await.unwrap();

    let peer: NodeId = "127.0.0.1:6001".parse().unwrap();
    let reply = request_reply(
        lone.id,
        &format!("REGISTER {} {}", peer.ip, peer.port),
        Duration::from_secs(1),
    )
    .await;
    assert!(reply.is_none(), "partitioned seed must not answer");
    assert_eq!(lone.live_count().await, 0);

    lone.shutdown();
}

#[tokio::test]
async fn malformed_frames_do_not_stall_the_connection() {
    let ports = free_ports(1);
    let seeds = spawn_group(&ports).await;
    let peer: NodeId = "127.0.0.1:6001".parse().unwrap();

    // Garbage, then a valid registration on the same connection.
    let stream = TcpStream::connect(seeds[0].id.socket_addr()).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    write_half
        .write_all(format!("GARBAGE ???\nREGISTER {} {}\n", peer.ip, peer.port).as_bytes())
        .await
        .unwrap();
    let mut reader = BufReader::new(read_half);
    let mut reply = String::new();
    timeout(Duration::from_secs(2), reader.read_line(&mut reply))
        .await
        .expect("no reply after malformed frame")
        .unwrap();
    assert!(reply.starts_with("PEER_LIST"));

    seeds[0].shutdown();
}
