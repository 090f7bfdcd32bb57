//! Tiered resolution from a peer reference to a public key or a connect
//! target.
//!
//! A peer reference is either a sight DID, a raw multiaddr (leading `/`), or
//! a bare peer-identifier string (base58 multihash or CID). Public-key
//! resolution walks an ordered strategy chain and stops at the first tier
//! that produces a key:
//!
//! 1. **SelfDescribing**: ed25519 peer identifiers are identity multihashes
//!    wrapping the public key itself; decode it locally, zero network I/O.
//! 2. **Cache**: the key cache the identify handshake populates.
//! 3. **Lookup**: DHT address lookup, dial (the handshake caches the remote
//!    key as a side effect), then re-check the cache.
//!
//! Adding a tier means adding a variant and a slot in [`TIERS`]; the driver
//! loop does not change.

use crate::did::{self, DidError};
use crate::node::{extract_peer_id, NetworkError, NodeHandle};
use cid::Cid;
use libp2p::{identity, Multiaddr, PeerId};
use multihash::Multihash;
use std::{fmt, str::FromStr};

/// Multihash code marking a digest that carries its preimage verbatim.
const IDENTITY_MULTIHASH_CODE: u64 = 0x00;

/// Errors surfaced while resolving a peer reference.
#[derive(Debug)]
pub enum ResolveError {
    /// The reference looked like a DID but failed to decode.
    InvalidDid(DidError),
    /// The reference is neither a DID, a multiaddr, nor a peer identifier.
    InvalidPeerRef(String),
    /// Every tier ran and none produced a public key.
    NoPublicKeyFound,
    /// The distributed lookup returned no reachable addresses.
    PeerUnreachable(String),
    /// Dialing the resolved target failed.
    Connect(String),
    /// The local swarm actor rejected or dropped the request.
    Node(String),
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidDid(err) => write!(f, "invalid DID: {err}"),
            Self::InvalidPeerRef(msg) => write!(f, "invalid peer reference: {msg}"),
            Self::NoPublicKeyFound => write!(f, "no public key found"),
            Self::PeerUnreachable(msg) => write!(f, "peer unreachable: {msg}"),
            Self::Connect(msg) => write!(f, "connect failed: {msg}"),
            Self::Node(msg) => write!(f, "node error: {msg}"),
        }
    }
}

impl std::error::Error for ResolveError {}

impl From<DidError> for ResolveError {
    fn from(err: DidError) -> Self {
        Self::InvalidDid(err)
    }
}

impl From<NetworkError> for ResolveError {
    fn from(err: NetworkError) -> Self {
        Self::Node(err.to_string())
    }
}

/// Ordered public-key resolution strategies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Tier {
    SelfDescribing,
    Cache,
    Lookup,
}

const TIERS: [Tier; 3] = [Tier::SelfDescribing, Tier::Cache, Tier::Lookup];

/// Resolves peer references against the local node and the DHT.
#[derive(Clone)]
pub struct PeerResolver {
    node: NodeHandle,
}

impl PeerResolver {
    /// Creates a resolver backed by the given swarm handle.
    pub fn new(node: NodeHandle) -> PeerResolver {
        PeerResolver { node }
    }

    /// Resolves a peer reference to raw ed25519 public-key bytes through the
    /// tier chain, short-circuiting at the first hit.
    pub async fn resolve_public_key(&self, peer_ref: &str) -> Result<Vec<u8>, ResolveError> {
        for tier in TIERS {
            if let Some(key) = self.attempt(tier, peer_ref).await? {
                println!("SIGHT|mod=RESOLVE|evt=HIT|tier={tier:?}|ref={peer_ref}");
                return Ok(key);
            }
        }
        Err(ResolveError::NoPublicKeyFound)
    }

    async fn attempt(&self, tier: Tier, peer_ref: &str) -> Result<Option<Vec<u8>>, ResolveError> {
        match tier {
            Tier::SelfDescribing => Ok(embedded_public_key(peer_ref)),
            Tier::Cache => {
                let peer = parse_peer_id(peer_ref)?;
                let cached = self.node.cached_public_key(peer).await?;
                Ok(cached.map(|key| raw_public_key(&key)))
            }
            Tier::Lookup => {
                let peer = parse_peer_id(peer_ref)?;
                let addrs = self
                    .node
                    .find_peer(peer)
                    .await
                    .map_err(|err| ResolveError::PeerUnreachable(err.to_string()))?;
                self.node
                    .connect(peer, addrs)
                    .await
                    .map_err(|err| ResolveError::Connect(err.to_string()))?;
                // The noise handshake has run; the identify exchange caches
                // the remote key shortly after. Re-check once.
                let cached = self.node.cached_public_key(peer).await?;
                Ok(cached.map(|key| raw_public_key(&key)))
            }
        }
    }

    /// Resolves a peer reference to a dialable target.
    ///
    /// Raw multiaddr strings are parsed directly and never hit the network;
    /// DIDs are decoded to a peer id and located through the DHT.
    pub async fn resolve_connect_target(
        &self,
        peer_ref: &str,
    ) -> Result<(PeerId, Vec<Multiaddr>), ResolveError> {
        if peer_ref.starts_with('/') {
            let addr: Multiaddr = peer_ref
                .parse()
                .map_err(|err| ResolveError::InvalidPeerRef(format!("{peer_ref}: {err}")))?;
            let peer = extract_peer_id(&addr).ok_or_else(|| {
                ResolveError::InvalidPeerRef(format!("{peer_ref}: missing /p2p peer id"))
            })?;
            return Ok((peer, vec![addr]));
        }
        let public_key = did::did_to_public_key(peer_ref)?;
        let peer = peer_id_from_public_key(&public_key)?;
        let addrs = self
            .node
            .find_peer(peer)
            .await
            .map_err(|err| ResolveError::PeerUnreachable(err.to_string()))?;
        Ok((peer, addrs))
    }

    /// Connects to a peer given a DID or raw multiaddr, returning the peer id
    /// once the connection is up.
    pub async fn connect(&self, peer_ref: &str) -> Result<PeerId, ResolveError> {
        let (peer, addrs) = self.resolve_connect_target(peer_ref).await?;
        self.node
            .connect(peer, addrs)
            .await
            .map_err(|err| ResolveError::Connect(err.to_string()))?;
        Ok(peer)
    }
}

/// Tier 1: extracts the public key a self-describing peer identifier embeds.
///
/// Accepts both the CID form and the classic base58 multihash form. Returns
/// `None` when the digest is a real hash (nothing embedded) or the reference
/// is not a peer identifier at all.
pub fn embedded_public_key(peer_ref: &str) -> Option<Vec<u8>> {
    if let Ok(c) = Cid::try_from(peer_ref) {
        return key_from_identity_digest(c.hash().code(), c.hash().digest());
    }
    let peer = PeerId::from_str(peer_ref).ok()?;
    let bytes = peer.to_bytes();
    let mh = Multihash::<64>::from_bytes(&bytes).ok()?;
    key_from_identity_digest(mh.code(), mh.digest())
}

fn key_from_identity_digest(code: u64, digest: &[u8]) -> Option<Vec<u8>> {
    if code != IDENTITY_MULTIHASH_CODE {
        return None;
    }
    let key = identity::PublicKey::try_decode_protobuf(digest).ok()?;
    Some(raw_public_key(&key))
}

/// Raw key bytes in the same form every tier returns: 32 ed25519 bytes, or
/// the protobuf encoding for non-ed25519 peers.
pub(crate) fn raw_public_key(key: &identity::PublicKey) -> Vec<u8> {
    match key.clone().try_into_ed25519() {
        Ok(ed) => ed.to_bytes().to_vec(),
        Err(_) => key.encode_protobuf(),
    }
}

fn parse_peer_id(peer_ref: &str) -> Result<PeerId, ResolveError> {
    PeerId::from_str(peer_ref)
        .map_err(|err| ResolveError::InvalidPeerRef(format!("{peer_ref}: {err}")))
}

/// Derives the overlay peer id for a raw ed25519 public key.
pub fn peer_id_from_public_key(public_key: &[u8]) -> Result<PeerId, ResolveError> {
    let key = identity::ed25519::PublicKey::try_from_bytes(public_key)
        .map_err(|err| ResolveError::InvalidPeerRef(err.to_string()))?;
    Ok(identity::PublicKey::from(key).to_peer_id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{scripted_handle, Command};
    use sha2::{Digest, Sha256};

    fn ed25519_identity() -> (identity::Keypair, Vec<u8>, PeerId) {
        let keypair = identity::Keypair::generate_ed25519();
        let raw = keypair
            .public()
            .clone()
            .try_into_ed25519()
            .unwrap()
            .to_bytes()
            .to_vec();
        let peer = keypair.public().to_peer_id();
        (keypair, raw, peer)
    }

    /// Peer id whose multihash is a real sha2-256 digest: nothing embedded,
    /// so tier 1 must pass on it.
    fn opaque_peer_id() -> PeerId {
        let digest = Sha256::digest(b"opaque peer");
        let mh = Multihash::<64>::wrap(0x12, &digest).unwrap();
        PeerId::from_multihash(mh).unwrap()
    }

    #[test]
    fn embedded_key_decodes_from_base58_peer_id() {
        let (_, raw, peer) = ed25519_identity();
        let decoded = embedded_public_key(&peer.to_base58()).unwrap();
        assert_eq!(decoded, raw);
    }

    #[test]
    fn embedded_key_decodes_from_cid_form() {
        let (keypair, raw, _) = ed25519_identity();
        let protobuf = keypair.public().encode_protobuf();
        let mh = Multihash::<64>::wrap(IDENTITY_MULTIHASH_CODE, &protobuf).unwrap();
        // 0x72 = libp2p-key codec.
        let c = Cid::new_v1(0x72, mh);
        let decoded = embedded_public_key(&c.to_string()).unwrap();
        assert_eq!(decoded, raw);
    }

    #[test]
    fn opaque_digest_embeds_nothing() {
        assert!(embedded_public_key(&opaque_peer_id().to_base58()).is_none());
        assert!(embedded_public_key("definitely not a peer id").is_none());
    }

    #[tokio::test]
    async fn self_describing_ref_resolves_without_the_substrate() {
        let (handle, rx) = scripted_handle();
        // No one serves the channel: any cache or lookup attempt would fail.
        drop(rx);
        let (_, raw, peer) = ed25519_identity();
        let resolver = PeerResolver::new(handle);
        let key = resolver.resolve_public_key(&peer.to_base58()).await.unwrap();
        assert_eq!(key, raw);
    }

    #[tokio::test]
    async fn cached_key_resolves_without_a_lookup() {
        let (handle, mut rx) = scripted_handle();
        let (keypair, raw, _) = ed25519_identity();
        let target = opaque_peer_id();
        let public = keypair.public();

        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    Command::CachedPublicKey { reply, .. } => {
                        let _ = reply.send(Some(public.clone()));
                    }
                    Command::FindPeer { .. } | Command::Connect { .. } => {
                        panic!("cache hit must not reach the lookup tier");
                    }
                    _ => {}
                }
            }
        });

        let resolver = PeerResolver::new(handle);
        let key = resolver
            .resolve_public_key(&target.to_base58())
            .await
            .unwrap();
        assert_eq!(key, raw);
    }

    #[tokio::test]
    async fn lookup_tier_dials_then_rechecks_the_cache() {
        let (handle, mut rx) = scripted_handle();
        let (keypair, raw, _) = ed25519_identity();
        let target = opaque_peer_id();
        let public = keypair.public();

        tokio::spawn(async move {
            let mut cache_hits = 0u32;
            while let Some(command) = rx.recv().await {
                match command {
                    Command::CachedPublicKey { reply, .. } => {
                        cache_hits += 1;
                        // Empty before the dial, populated after.
                        let answer = if cache_hits > 1 {
                            Some(public.clone())
                        } else {
                            None
                        };
                        let _ = reply.send(answer);
                    }
                    Command::FindPeer { reply, .. } => {
                        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/15001".parse().unwrap();
                        let _ = reply.send(Ok(vec![addr]));
                    }
                    Command::Connect { reply, .. } => {
                        let _ = reply.send(Ok(()));
                    }
                    _ => {}
                }
            }
        });

        let resolver = PeerResolver::new(handle);
        let key = resolver
            .resolve_public_key(&target.to_base58())
            .await
            .unwrap();
        assert_eq!(key, raw);
    }

    #[tokio::test]
    async fn connect_target_from_raw_multiaddr_needs_no_lookup() {
        let (handle, rx) = scripted_handle();
        drop(rx);
        let peer = PeerId::random();
        let addr = format!("/ip4/127.0.0.1/tcp/15001/p2p/{peer}");
        let resolver = PeerResolver::new(handle);
        let (resolved, addrs) = resolver.resolve_connect_target(&addr).await.unwrap();
        assert_eq!(resolved, peer);
        assert_eq!(addrs.len(), 1);
    }

    #[tokio::test]
    async fn connect_target_rejects_malformed_did() {
        let (handle, rx) = scripted_handle();
        drop(rx);
        let resolver = PeerResolver::new(handle);
        let err = resolver
            .resolve_connect_target("did:sight:hoster:0OIl")
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::InvalidDid(_)));
    }

    #[tokio::test]
    async fn multiaddr_without_peer_id_is_rejected() {
        let (handle, rx) = scripted_handle();
        drop(rx);
        let resolver = PeerResolver::new(handle);
        let err = resolver
            .resolve_connect_target("/ip4/127.0.0.1/tcp/15001")
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::InvalidPeerRef(_)));
    }
}
