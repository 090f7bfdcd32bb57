//! Libp2p orchestration: the swarm actor and its cloneable handle.
//!
//! One tokio task owns the [`Swarm`] and all mutable network state (address
//! book, public-key cache, pending dial/lookup/ping replies). Everything else
//! talks to it through [`NodeHandle`] commands over an mpsc channel, so no
//! locks are needed anywhere in this crate.
//!
//! The behaviour stack mirrors what the overlay requires: gossipsub for the
//! shared broadcast topic, kademlia for distributed peer lookup, identify to
//! learn peer addresses and public keys on handshake, ping for RTT probes,
//! and raw streams for point-to-point messages.

use crate::keypair::Keypair;
use futures::StreamExt;
use libp2p::{
    gossipsub::{self, IdentTopic, MessageAuthenticity, PublishError, ValidationMode},
    identify, identity,
    kad::{self, store::MemoryStore},
    multiaddr::Protocol,
    noise, ping,
    swarm::{dial_opts::DialOpts, NetworkBehaviour, Swarm, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, StreamProtocol, SwarmBuilder,
};
use libp2p_stream as stream;
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use std::{
    collections::{HashMap, HashSet},
    fmt, io,
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};

/// Shared broadcast topic every sight node subscribes to.
pub static MESSAGE_TOPIC: Lazy<IdentTopic> = Lazy::new(|| IdentTopic::new("sight-message"));

/// Application protocol for point-to-point message streams.
pub static DIRECT_PROTOCOL: Lazy<StreamProtocol> =
    Lazy::new(|| StreamProtocol::new("/sight/message/0.0.1"));

/// Upper bound on a single envelope, broadcast or direct.
pub const MAX_ENVELOPE_BYTES: usize = 64 * 1024;

const INBOUND_CHANNEL_CAPACITY: usize = 64;
const COMMAND_CHANNEL_CAPACITY: usize = 64;
const PING_INTERVAL: Duration = Duration::from_secs(1);
const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors surfaced by the networking runtime.
#[derive(Debug)]
pub enum NetworkError {
    /// Key derivation failure.
    Key(String),
    /// Underlying libp2p API returned an error.
    Libp2p(String),
    /// Filesystem or socket failure.
    Io(String),
    /// The swarm actor has shut down and no longer accepts commands.
    NodeStopped,
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(msg) => write!(f, "key error: {msg}"),
            Self::Libp2p(msg) => write!(f, "libp2p error: {msg}"),
            Self::Io(msg) => write!(f, "I/O error: {msg}"),
            Self::NodeStopped => write!(f, "node stopped"),
        }
    }
}

impl std::error::Error for NetworkError {}

impl From<io::Error> for NetworkError {
    fn from(err: io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[derive(NetworkBehaviour)]
struct SightBehaviour {
    gossipsub: gossipsub::Behaviour,
    identify: identify::Behaviour,
    kademlia: kad::Behaviour<MemoryStore>,
    ping: ping::Behaviour,
    stream: stream::Behaviour,
}

pub(crate) enum Command {
    Publish {
        data: Vec<u8>,
    },
    Connect {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply: oneshot::Sender<Result<(), String>>,
    },
    FindPeer {
        peer: PeerId,
        reply: oneshot::Sender<Result<Vec<Multiaddr>, String>>,
    },
    CachedPublicKey {
        peer: PeerId,
        reply: oneshot::Sender<Option<identity::PublicKey>>,
    },
    Neighbors {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    Ping {
        peer: PeerId,
        reply: oneshot::Sender<Result<Duration, String>>,
    },
    Shutdown,
}

/// Cloneable handle for issuing commands to the swarm actor.
#[derive(Clone)]
pub struct NodeHandle {
    tx: mpsc::Sender<Command>,
    local_peer: PeerId,
}

impl NodeHandle {
    /// Peer id of the local node.
    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    /// Publishes raw bytes on the shared broadcast topic. Fire-and-forget:
    /// publish failures are logged by the actor, never surfaced here.
    pub async fn publish(&self, data: Vec<u8>) -> Result<(), NetworkError> {
        self.tx
            .send(Command::Publish { data })
            .await
            .map_err(|_| NetworkError::NodeStopped)
    }

    /// Connects to `peer`, preferring the supplied addresses. Resolves once
    /// the connection is established (immediately when already connected).
    pub async fn connect(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> Result<(), NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Connect { peer, addrs, reply })
            .await
            .map_err(|_| NetworkError::NodeStopped)?;
        rx.await
            .map_err(|_| NetworkError::NodeStopped)?
            .map_err(NetworkError::Libp2p)
    }

    /// Queries the DHT for the peer's current addresses.
    pub async fn find_peer(&self, peer: PeerId) -> Result<Vec<Multiaddr>, NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::FindPeer { peer, reply })
            .await
            .map_err(|_| NetworkError::NodeStopped)?;
        rx.await
            .map_err(|_| NetworkError::NodeStopped)?
            .map_err(NetworkError::Libp2p)
    }

    /// Reads the locally cached public key for `peer`, if the identify
    /// handshake has recorded one. Never touches the network.
    pub async fn cached_public_key(
        &self,
        peer: PeerId,
    ) -> Result<Option<identity::PublicKey>, NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::CachedPublicKey { peer, reply })
            .await
            .map_err(|_| NetworkError::NodeStopped)?;
        rx.await.map_err(|_| NetworkError::NodeStopped)
    }

    /// Lists currently connected peers.
    pub async fn neighbors(&self) -> Result<Vec<PeerId>, NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Neighbors { reply })
            .await
            .map_err(|_| NetworkError::NodeStopped)?;
        rx.await.map_err(|_| NetworkError::NodeStopped)
    }

    /// Waits for the next ping round trip to `peer`. The peer must already
    /// be connected; callers bound the wait with a timeout.
    pub async fn ping(&self, peer: PeerId) -> Result<Duration, NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Ping { peer, reply })
            .await
            .map_err(|_| NetworkError::NodeStopped)?;
        rx.await
            .map_err(|_| NetworkError::NodeStopped)?
            .map_err(NetworkError::Libp2p)
    }

    /// Asks the actor to stop. Dropping the swarm closes every connection.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

/// A running overlay node: the actor handle plus the inbound delivery ends.
pub struct Node {
    /// Command handle shared with the router, resolver, and HTTP surface.
    pub handle: NodeHandle,
    /// Raw broadcast messages from the shared topic, in arrival order.
    pub inbound: mpsc::Receiver<Vec<u8>>,
    /// Incoming point-to-point streams on the message protocol.
    pub incoming_streams: stream::IncomingStreams,
    /// Control for opening outbound streams.
    pub control: stream::Control,
}

/// Builds the swarm, starts listening, dials the bootstrap peers, and spawns
/// the actor task. Fatal errors here mean the node cannot participate at all.
pub fn start(
    listen_addr: Multiaddr,
    bootstrap: &[Multiaddr],
    keypair: &Keypair,
) -> Result<Node, NetworkError> {
    let mut swarm = build_swarm(keypair.libp2p.clone())?;
    let local_peer = *swarm.local_peer_id();

    Swarm::listen_on(&mut swarm, listen_addr.clone())
        .map_err(|err| NetworkError::Libp2p(format!("listen on {listen_addr}: {err:?}")))?;

    let mut bootstrap_peers = 0usize;
    for addr in bootstrap {
        if let Some(peer_id) = extract_peer_id(addr) {
            swarm
                .behaviour_mut()
                .kademlia
                .add_address(&peer_id, addr.clone());
            swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
            bootstrap_peers += 1;
        }
        if let Err(err) = Swarm::dial(&mut swarm, addr.clone()) {
            eprintln!("dial {addr} failed: {err}");
        }
    }
    if bootstrap_peers > 0 {
        match swarm.behaviour_mut().kademlia.bootstrap() {
            Ok(_) => println!("SIGHT|mod=NET|evt=KAD_BOOTSTRAP|peers={bootstrap_peers}"),
            Err(err) => eprintln!("kademlia bootstrap failed: {err:?}"),
        }
    }

    let mut control = swarm.behaviour().stream.new_control();
    let incoming_streams = control
        .accept(DIRECT_PROTOCOL.clone())
        .map_err(|err| NetworkError::Libp2p(format!("{err:?}")))?;

    let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);

    println!(
        "SIGHT|mod=NET|evt=START|peer={local_peer} addr={listen_addr} topic={}",
        MESSAGE_TOPIC.hash()
    );

    let actor = NodeActor {
        swarm,
        commands: command_rx,
        inbound_tx,
        pending_dials: HashMap::new(),
        pending_lookups: HashMap::new(),
        pending_pings: HashMap::new(),
        address_book: HashMap::new(),
        key_cache: HashMap::new(),
    };
    tokio::spawn(actor.run());

    Ok(Node {
        handle: NodeHandle {
            tx: command_tx,
            local_peer,
        },
        inbound: inbound_rx,
        incoming_streams,
        control,
    })
}

fn build_swarm(identity: identity::Keypair) -> Result<Swarm<SightBehaviour>, NetworkError> {
    let builder = SwarmBuilder::with_existing_identity(identity)
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|err| NetworkError::Libp2p(format!("{err:?}")))?
        .with_behaviour(|key| {
            build_behaviour(key).map_err(|err| {
                let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(err);
                boxed
            })
        })
        .map_err(|err| NetworkError::Libp2p(format!("{err:?}")))?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT));

    Ok(builder.build())
}

fn build_behaviour(key: &identity::Keypair) -> Result<SightBehaviour, NetworkError> {
    let peer_id = key.public().to_peer_id();

    let gossipsub_config = gossipsub::ConfigBuilder::default()
        .validation_mode(ValidationMode::Strict)
        .message_id_fn(|message: &gossipsub::Message| {
            let mut hasher = Sha256::new();
            hasher.update(&message.data);
            gossipsub::MessageId::from(hasher.finalize().to_vec())
        })
        .build()
        .map_err(|err| NetworkError::Libp2p(format!("{err:?}")))?;

    let mut gossipsub =
        gossipsub::Behaviour::new(MessageAuthenticity::Signed(key.clone()), gossipsub_config)
            .map_err(|err| NetworkError::Libp2p(format!("{err:?}")))?;
    gossipsub
        .subscribe(&MESSAGE_TOPIC)
        .map_err(|err| NetworkError::Libp2p(format!("{err:?}")))?;

    let identify_config = identify::Config::new("sight/1.0.0".into(), key.public())
        .with_push_listen_addr_updates(true);
    let identify = identify::Behaviour::new(identify_config);

    let store = MemoryStore::new(peer_id);
    let mut kademlia = kad::Behaviour::with_config(peer_id, store, kad::Config::default());
    kademlia.set_mode(Some(kad::Mode::Server));

    let ping = ping::Behaviour::new(ping::Config::new().with_interval(PING_INTERVAL));

    Ok(SightBehaviour {
        gossipsub,
        identify,
        kademlia,
        ping,
        stream: stream::Behaviour::new(),
    })
}

/// Extracts the `/p2p/<peer-id>` component from a multiaddr, if present.
pub fn extract_peer_id(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|proto| match proto {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}

/// Builds a handle whose command stream is served by the caller instead of
/// a live swarm. Lets unit tests script the substrate's answers.
#[cfg(test)]
pub(crate) fn scripted_handle() -> (NodeHandle, mpsc::Receiver<Command>) {
    let (tx, rx) = mpsc::channel(8);
    let handle = NodeHandle {
        tx,
        local_peer: PeerId::random(),
    };
    (handle, rx)
}

struct NodeActor {
    swarm: Swarm<SightBehaviour>,
    commands: mpsc::Receiver<Command>,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<(), String>>>>,
    pending_lookups: HashMap<kad::QueryId, (PeerId, oneshot::Sender<Result<Vec<Multiaddr>, String>>)>,
    pending_pings: HashMap<PeerId, Vec<oneshot::Sender<Result<Duration, String>>>>,
    address_book: HashMap<PeerId, HashSet<Multiaddr>>,
    key_cache: HashMap<PeerId, identity::PublicKey>,
}

impl NodeActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(command) => self.handle_command(command),
                },
                event = self.swarm.select_next_some() => self.handle_event(event),
            }
        }
        println!("SIGHT|mod=NET|evt=STOP");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Publish { data } => {
                match self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(MESSAGE_TOPIC.clone(), data)
                {
                    Ok(_) => {}
                    Err(PublishError::InsufficientPeers) => {
                        eprintln!("publish skipped: no gossip peers yet");
                    }
                    Err(PublishError::Duplicate) => {}
                    Err(err) => eprintln!("publish error: {err}"),
                }
            }
            Command::Connect { peer, addrs, reply } => {
                if self.swarm.is_connected(&peer) {
                    let _ = reply.send(Ok(()));
                    return;
                }
                for addr in &addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer, addr.clone());
                    self.address_book.entry(peer).or_default().insert(addr.clone());
                }
                let opts = DialOpts::peer_id(peer)
                    .addresses(addrs)
                    .extend_addresses_through_behaviour()
                    .build();
                match self.swarm.dial(opts) {
                    Ok(()) => self.pending_dials.entry(peer).or_default().push(reply),
                    Err(err) => {
                        let _ = reply.send(Err(format!("dial {peer}: {err}")));
                    }
                }
            }
            Command::FindPeer { peer, reply } => {
                let query_id = self.swarm.behaviour_mut().kademlia.get_closest_peers(peer);
                self.pending_lookups.insert(query_id, (peer, reply));
            }
            Command::CachedPublicKey { peer, reply } => {
                let _ = reply.send(self.key_cache.get(&peer).cloned());
            }
            Command::Neighbors { reply } => {
                let peers: Vec<PeerId> = self.swarm.connected_peers().cloned().collect();
                let _ = reply.send(peers);
            }
            Command::Ping { peer, reply } => {
                if !self.swarm.is_connected(&peer) {
                    let _ = reply.send(Err(format!("not connected to {peer}")));
                    return;
                }
                self.pending_pings.entry(peer).or_default().push(reply);
            }
            Command::Shutdown => unreachable!("handled in run loop"),
        }
    }

    fn handle_event(&mut self, event: SwarmEvent<SightBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                println!("SIGHT|mod=NET|evt=LISTEN|addr={address}");
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                if let Some(waiters) = self.pending_dials.remove(&peer_id) {
                    for waiter in waiters {
                        let _ = waiter.send(Ok(()));
                    }
                }
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer),
                error,
                ..
            } => {
                if let Some(waiters) = self.pending_dials.remove(&peer) {
                    let message = format!("connect {peer}: {error}");
                    for waiter in waiters {
                        let _ = waiter.send(Err(message.clone()));
                    }
                }
            }
            SwarmEvent::Behaviour(SightBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                message,
                ..
            })) => {
                if message.topic != MESSAGE_TOPIC.hash() {
                    return;
                }
                if message.data.len() > MAX_ENVELOPE_BYTES {
                    eprintln!("broadcast message dropped: {} bytes", message.data.len());
                    return;
                }
                // At-most-once: a full drain queue sheds the message.
                if let Err(err) = self.inbound_tx.try_send(message.data) {
                    eprintln!("inbound queue full, message dropped: {err}");
                }
            }
            SwarmEvent::Behaviour(SightBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                for addr in &info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr.clone());
                }
                self.address_book
                    .entry(peer_id)
                    .or_default()
                    .extend(info.listen_addrs.iter().cloned());
                self.key_cache.insert(peer_id, info.public_key);
            }
            SwarmEvent::Behaviour(SightBehaviourEvent::Kademlia(
                kad::Event::RoutingUpdated {
                    peer, addresses, ..
                },
            )) => {
                self.address_book
                    .entry(peer)
                    .or_default()
                    .extend(addresses.iter().cloned());
            }
            SwarmEvent::Behaviour(SightBehaviourEvent::Kademlia(
                kad::Event::OutboundQueryProgressed {
                    id,
                    result: kad::QueryResult::GetClosestPeers(_),
                    step,
                    ..
                },
            )) => {
                if !step.last {
                    return;
                }
                if let Some((peer, reply)) = self.pending_lookups.remove(&id) {
                    let addrs = self.known_addresses(&peer);
                    if addrs.is_empty() {
                        let _ = reply.send(Err(format!("no addresses found for {peer}")));
                    } else {
                        let _ = reply.send(Ok(addrs));
                    }
                }
            }
            SwarmEvent::Behaviour(SightBehaviourEvent::Ping(ping::Event {
                peer, result, ..
            })) => {
                if let Some(waiters) = self.pending_pings.remove(&peer) {
                    let outcome = result.map_err(|err| format!("ping {peer}: {err}"));
                    for waiter in waiters {
                        let _ = waiter.send(outcome.clone());
                    }
                }
            }
            _ => {}
        }
    }

    /// Addresses known for `peer` after identify updates and DHT traffic:
    /// the address book first, then the kademlia routing table.
    fn known_addresses(&mut self, peer: &PeerId) -> Vec<Multiaddr> {
        let mut out: HashSet<Multiaddr> =
            self.address_book.get(peer).cloned().unwrap_or_default();
        for bucket in self.swarm.behaviour_mut().kademlia.kbuckets() {
            for entry in bucket.iter() {
                if entry.node.key.preimage() == peer {
                    out.extend(entry.node.value.iter().cloned());
                }
            }
        }
        out.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_peer_id_from_multiaddr() {
        let peer = PeerId::random();
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/15001/p2p/{peer}")
            .parse()
            .unwrap();
        assert_eq!(extract_peer_id(&addr), Some(peer));

        let bare: Multiaddr = "/ip4/127.0.0.1/tcp/15001".parse().unwrap();
        assert_eq!(extract_peer_id(&bare), None);
    }

    #[tokio::test]
    async fn handle_reports_stopped_actor() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = NodeHandle {
            tx,
            local_peer: PeerId::random(),
        };
        assert!(matches!(
            handle.publish(b"x".to_vec()).await,
            Err(NetworkError::NodeStopped)
        ));
        assert!(matches!(
            handle.neighbors().await,
            Err(NetworkError::NodeStopped)
        ));
    }
}
