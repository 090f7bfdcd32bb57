//! Standalone bootstrap mesh: nine nodes with fixed, well-known identities
//! on consecutive ports, randomly cross-wired for redundancy.
//!
//! The wiring is best-effort: each node dials four or five randomly chosen
//! peers and individual dial failures are logged, not fatal. The resulting
//! graph is almost always connected but never guaranteed to be.

use crate::keypair::{self, Keypair};
use crate::node::{self, NetworkError, Node, NodeHandle};
use libp2p::{Multiaddr, PeerId};
use rand::{seq::SliceRandom, Rng};
use serde_json::json;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::{sync::mpsc, time};

/// Number of nodes in the bootstrap cluster.
pub const MESH_SIZE: usize = 9;

/// Port of the first node; node `i` listens on `BASE_PORT + i`.
pub const BASE_PORT: u16 = 15001;

const MIN_DEGREE: usize = 4;
const SETTLE_DELAY: Duration = Duration::from_secs(1);
const HELLO_DELAY: Duration = Duration::from_secs(3);

/// Well-known seed for mesh node `i`: zeroes except the first byte.
pub fn seed_for(index: usize) -> [u8; 32] {
    let mut seed = [0u8; 32];
    seed[0] = (index + 1) as u8;
    seed
}

/// Picks the indices node `exclude` should dial: a uniform shuffle of the
/// other nodes, truncated to four or five.
pub fn random_neighbors(total: usize, exclude: usize) -> Vec<usize> {
    let mut others: Vec<usize> = (0..total).filter(|i| *i != exclude).collect();
    let mut rng = rand::thread_rng();
    others.shuffle(&mut rng);
    let degree = MIN_DEGREE + rng.gen_range(0..2);
    others.truncate(degree.min(others.len()));
    others
}

/// Starts the full cluster and wires the mesh. Returns the node handles so
/// the caller can shut the cluster down.
pub async fn run_cluster() -> Result<Vec<NodeHandle>, NetworkError> {
    let now = keypair::rfc3339_utc(unix_seconds());

    let mut handles: Vec<NodeHandle> = Vec::with_capacity(MESH_SIZE);
    let mut peers: Vec<PeerId> = Vec::with_capacity(MESH_SIZE);
    let mut dial_addrs: Vec<Multiaddr> = Vec::with_capacity(MESH_SIZE);

    for i in 0..MESH_SIZE {
        let kp = Keypair::from_seed(seed_for(i), now.clone(), now.clone())
            .map_err(|err| NetworkError::Key(err.to_string()))?;
        let port = BASE_PORT + i as u16;
        let listen: Multiaddr = format!("/ip4/0.0.0.0/tcp/{port}")
            .parse()
            .map_err(|err| NetworkError::Libp2p(format!("listen addr: {err}")))?;
        let Node {
            handle, inbound, ..
        } = node::start(listen, &[], &kp)?;
        let peer = handle.local_peer();
        let dial: Multiaddr = format!("/ip4/127.0.0.1/tcp/{port}/p2p/{peer}")
            .parse()
            .map_err(|err| NetworkError::Libp2p(format!("dial addr: {err}")))?;
        println!("SIGHT|mod=MESH|evt=NODE_UP|index={i}|port={port}|peer={peer}");
        drain_inbound(i, inbound);
        handles.push(handle);
        peers.push(peer);
        dial_addrs.push(dial);
    }

    // Let every listener come up before wiring.
    time::sleep(SETTLE_DELAY).await;

    for i in 0..MESH_SIZE {
        let neighbors = random_neighbors(MESH_SIZE, i);
        for &n in &neighbors {
            if let Err(err) = handles[i].connect(peers[n], vec![dial_addrs[n].clone()]).await {
                eprintln!("mesh dial {i} -> {n}: {err}");
            }
        }
        println!("SIGHT|mod=MESH|evt=WIRED|node={i}|neighbors={neighbors:?}");
    }

    // A first broadcast exercises the gossip mesh end to end.
    let hello = handles[0].clone();
    tokio::spawn(async move {
        time::sleep(HELLO_DELAY).await;
        let envelope = json!({
            "to": "mesh",
            "payload": {"type": "hello", "from": 0},
        });
        if let Err(err) = hello.publish(envelope.to_string().into_bytes()).await {
            eprintln!("mesh hello publish: {err}");
        } else {
            println!("SIGHT|mod=MESH|evt=HELLO_SENT|node=0");
        }
    });

    Ok(handles)
}

/// Bootstrap nodes relay gossip but consume nothing; log and discard so the
/// actor's delivery queue never backs up.
fn drain_inbound(index: usize, mut inbound: mpsc::Receiver<Vec<u8>>) {
    tokio::spawn(async move {
        while let Some(data) = inbound.recv().await {
            println!("SIGHT|mod=MESH|evt=RECV|node={index}|bytes={}", data.len());
        }
    });
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
