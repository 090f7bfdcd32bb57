#![deny(missing_docs)]

//! # sightnet
//!
//! A libp2p overlay node with DID-addressed message routing.
//!
//! Every node derives a `did:sight:hoster:` identity from a persisted
//! ed25519 seed and joins a shared gossipsub topic. Messages are JSON
//! envelopes addressed by DID; a node forwards envelopes meant for it to a
//! local HTTP "tunnel" sink and exposes a small HTTP surface for sending,
//! connecting, and peer introspection. Point-to-point delivery uses one raw
//! stream per message on a dedicated protocol.
//!
//! The crate ships two binaries: `sight-node`, the long-lived overlay node,
//! and `sight-bootstrap`, a nine-node fixed-identity mesh that seeds the
//! network.
//!
//! ## Layout
//!
//! * [`keypair`]: persisted ed25519 identity and derived keys.
//! * [`did`]: the DID string codec.
//! * [`config`]: environment-driven node configuration.
//! * [`node`]: the swarm actor and its command handle.
//! * [`resolver`]: tiered peer-reference resolution.
//! * [`router`]: envelope routing between the overlay and the sink.
//! * [`api`]: the local HTTP control surface.
//! * [`mesh`]: the bootstrap cluster builder.

pub mod api;
pub mod config;
pub mod did;
pub mod keypair;
pub mod mesh;
pub mod node;
pub mod resolver;
pub mod router;

pub use config::NodeConfig;
pub use did::{did_to_public_key, public_key_to_did};
pub use keypair::Keypair;
pub use node::{Node, NodeHandle};
pub use resolver::PeerResolver;
pub use router::{Envelope, Router};
