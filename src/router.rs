//! Message routing between the overlay and the local tunnel sink.
//!
//! Every message on the wire is a JSON envelope `{ "to": <peer ref>,
//! "payload": <arbitrary JSON> }`. Broadcast envelopes arrive via gossipsub
//! and are forwarded to the sink only when addressed to the local DID;
//! point-to-point envelopes arrive one per stream and are forwarded
//! unconditionally, since the sender already picked this node. Forwarding is
//! at-most-once: a failed POST to the sink is logged and the payload dropped.

use crate::node::{NetworkError, Node, NodeHandle, DIRECT_PROTOCOL, MAX_ENVELOPE_BYTES};
use crate::resolver::{PeerResolver, ResolveError};
use futures::{AsyncReadExt, AsyncWriteExt, StreamExt};
use libp2p_stream as stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, io};
use tokio::sync::mpsc;

/// Wire envelope carried by both transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Addressee peer reference, usually a DID.
    pub to: String,
    /// Opaque application payload.
    pub payload: Value,
}

/// Errors surfaced on the outbound send paths.
#[derive(Debug)]
pub enum RouteError {
    /// The addressee reference could not be resolved or reached.
    Resolve(ResolveError),
    /// The envelope failed to serialize.
    Encode(serde_json::Error),
    /// The serialized envelope exceeds the wire limit.
    Oversized(usize),
    /// Opening or writing the point-to-point stream failed.
    Stream(String),
    /// The local swarm actor rejected the request.
    Node(String),
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolve(err) => write!(f, "{err}"),
            Self::Encode(err) => write!(f, "envelope encode error: {err}"),
            Self::Oversized(len) => {
                write!(f, "envelope too large: {len} > {MAX_ENVELOPE_BYTES} bytes")
            }
            Self::Stream(msg) => write!(f, "stream error: {msg}"),
            Self::Node(msg) => write!(f, "node error: {msg}"),
        }
    }
}

impl std::error::Error for RouteError {}

impl From<ResolveError> for RouteError {
    fn from(err: ResolveError) -> Self {
        Self::Resolve(err)
    }
}

impl From<serde_json::Error> for RouteError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encode(err)
    }
}

impl From<NetworkError> for RouteError {
    fn from(err: NetworkError) -> Self {
        Self::Node(err.to_string())
    }
}

/// Decodes a broadcast envelope and applies the addressee filter: the payload
/// passes only when the envelope names the local DID.
pub fn broadcast_payload(data: &[u8], self_did: &str) -> Result<Option<Value>, serde_json::Error> {
    let envelope: Envelope = serde_json::from_slice(data)?;
    if envelope.to == self_did {
        Ok(Some(envelope.payload))
    } else {
        Ok(None)
    }
}

/// Decodes a point-to-point envelope. No addressee filter on this path.
pub fn direct_payload(data: &[u8]) -> Result<Value, serde_json::Error> {
    let envelope: Envelope = serde_json::from_slice(data)?;
    Ok(envelope.payload)
}

fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, RouteError> {
    bounded(serde_json::to_vec(envelope)?)
}

/// Wire bytes for a direct send: the caller's body serialized verbatim. The
/// caller supplies the envelope shape; nothing is added on the wire.
fn direct_wire_bytes(body: &Value) -> Result<Vec<u8>, RouteError> {
    bounded(serde_json::to_vec(body)?)
}

fn bounded(data: Vec<u8>) -> Result<Vec<u8>, RouteError> {
    if data.len() > MAX_ENVELOPE_BYTES {
        return Err(RouteError::Oversized(data.len()));
    }
    Ok(data)
}

/// POSTs accepted payloads to the tunnel sink.
#[derive(Clone)]
struct SinkForwarder {
    client: reqwest::Client,
    sink_url: String,
}

impl SinkForwarder {
    async fn forward(&self, payload: &Value) {
        match self.client.post(&self.sink_url).json(payload).send().await {
            Ok(response) if !response.status().is_success() => {
                eprintln!("sink rejected payload: {}", response.status());
            }
            Ok(_) => {}
            Err(err) => eprintln!("sink forward failed: {err}"),
        }
    }
}

/// Outbound send surface plus the spawned inbound drains.
#[derive(Clone)]
pub struct Router {
    handle: NodeHandle,
    resolver: PeerResolver,
    control: stream::Control,
}

impl Router {
    /// Consumes the node's inbound ends, spawns the broadcast and
    /// point-to-point drain tasks, and returns the outbound surface.
    pub fn start(node: Node, resolver: PeerResolver, sink_url: String, self_did: String) -> Router {
        let Node {
            handle,
            inbound,
            incoming_streams,
            control,
        } = node;
        let forwarder = SinkForwarder {
            client: reqwest::Client::new(),
            sink_url,
        };
        spawn_broadcast_drain(inbound, forwarder.clone(), self_did);
        spawn_direct_accept(incoming_streams, forwarder);
        Router {
            handle,
            resolver,
            control,
        }
    }

    /// Publishes an envelope on the shared broadcast topic. Delivery is
    /// best-effort; each receiver applies its own addressee filter.
    pub async fn send_broadcast(&self, to: String, payload: Value) -> Result<(), RouteError> {
        let data = encode_envelope(&Envelope { to, payload })?;
        self.handle.publish(data).await?;
        Ok(())
    }

    /// Delivers the caller's body over a dedicated stream, byte for byte:
    /// resolve the addressee, ensure a connection, then write one message
    /// and close. The body is expected to already be an envelope; the
    /// receiving drain unwraps its `payload` field.
    pub async fn send_direct(&self, peer_ref: &str, body: Value) -> Result<(), RouteError> {
        let data = direct_wire_bytes(&body)?;
        let peer = self.resolver.connect(peer_ref).await?;
        let mut control = self.control.clone();
        let mut outbound = control
            .open_stream(peer, DIRECT_PROTOCOL.clone())
            .await
            .map_err(|err| RouteError::Stream(format!("open stream to {peer}: {err}")))?;
        outbound
            .write_all(&data)
            .await
            .map_err(|err| RouteError::Stream(err.to_string()))?;
        outbound
            .close()
            .await
            .map_err(|err| RouteError::Stream(err.to_string()))?;
        println!(
            "SIGHT|mod=ROUTE|evt=DIRECT_SENT|peer={peer}|bytes={}",
            data.len()
        );
        Ok(())
    }
}

fn spawn_broadcast_drain(
    mut inbound: mpsc::Receiver<Vec<u8>>,
    forwarder: SinkForwarder,
    self_did: String,
) {
    tokio::spawn(async move {
        while let Some(data) = inbound.recv().await {
            match broadcast_payload(&data, &self_did) {
                Ok(Some(payload)) => forwarder.forward(&payload).await,
                Ok(None) => {}
                Err(err) => eprintln!("broadcast envelope decode failed: {err}"),
            }
        }
    });
}

fn spawn_direct_accept(mut incoming: stream::IncomingStreams, forwarder: SinkForwarder) {
    tokio::spawn(async move {
        while let Some((peer, inbound)) = incoming.next().await {
            let forwarder = forwarder.clone();
            tokio::spawn(async move {
                match read_one_message(inbound).await {
                    Ok(data) => match direct_payload(&data) {
                        Ok(payload) => {
                            println!(
                                "SIGHT|mod=ROUTE|evt=DIRECT_RECV|peer={peer}|bytes={}",
                                data.len()
                            );
                            forwarder.forward(&payload).await;
                        }
                        Err(err) => eprintln!("direct envelope from {peer} malformed: {err}"),
                    },
                    Err(err) => eprintln!("direct stream from {peer} failed: {err}"),
                }
            });
        }
    });
}

/// Reads a whole one-shot message stream, bounded by the envelope limit.
async fn read_one_message(inbound: libp2p::Stream) -> io::Result<Vec<u8>> {
    let mut data = Vec::new();
    inbound
        .take(MAX_ENVELOPE_BYTES as u64 + 1)
        .read_to_end(&mut data)
        .await?;
    if data.len() > MAX_ENVELOPE_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("direct message exceeds {MAX_ENVELOPE_BYTES} bytes"),
        ));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn broadcast_passes_only_the_addressee() {
        let envelope = Envelope {
            to: "did:sight:hoster:abc".to_string(),
            payload: json!({"kind": "hello"}),
        };
        let data = serde_json::to_vec(&envelope).unwrap();

        let hit = broadcast_payload(&data, "did:sight:hoster:abc").unwrap();
        assert_eq!(hit, Some(json!({"kind": "hello"})));

        let miss = broadcast_payload(&data, "did:sight:hoster:other").unwrap();
        assert_eq!(miss, None);
    }

    #[test]
    fn broadcast_rejects_garbage() {
        assert!(broadcast_payload(b"not json", "did:sight:hoster:abc").is_err());
        assert!(broadcast_payload(br#"{"payload": 1}"#, "x").is_err());
    }

    #[test]
    fn direct_forwards_regardless_of_addressee() {
        let envelope = Envelope {
            to: "did:sight:hoster:someone-else".to_string(),
            payload: json!({"n": 7}),
        };
        let data = serde_json::to_vec(&envelope).unwrap();
        assert_eq!(direct_payload(&data).unwrap(), json!({"n": 7}));
    }

    #[test]
    fn envelope_round_trips_nested_payloads() {
        let envelope = Envelope {
            to: "gateway".to_string(),
            payload: json!({"a": [1, 2, {"b": null}], "c": "x"}),
        };
        let data = serde_json::to_vec(&envelope).unwrap();
        let back: Envelope = serde_json::from_slice(&data).unwrap();
        assert_eq!(back.to, envelope.to);
        assert_eq!(back.payload, envelope.payload);
    }

    #[test]
    fn direct_send_puts_the_body_on_the_wire_verbatim() {
        let body = json!({"to": "did:sight:hoster:Y", "payload": {"text": "hi"}});
        let wire = direct_wire_bytes(&body).unwrap();
        let on_wire: Value = serde_json::from_slice(&wire).unwrap();
        assert_eq!(on_wire, body);
        // The receiving drain unwraps the envelope the caller built, so the
        // sink sees only the inner payload.
        assert_eq!(direct_payload(&wire).unwrap(), json!({"text": "hi"}));
    }

    #[test]
    fn oversized_direct_body_is_rejected() {
        let body = json!({"payload": "y".repeat(MAX_ENVELOPE_BYTES)});
        assert!(matches!(
            direct_wire_bytes(&body).unwrap_err(),
            RouteError::Oversized(_)
        ));
    }

    #[test]
    fn oversized_envelope_is_rejected_before_publish() {
        let envelope = Envelope {
            to: "x".to_string(),
            payload: json!("y".repeat(MAX_ENVELOPE_BYTES)),
        };
        let err = encode_envelope(&envelope).unwrap_err();
        assert!(matches!(err, RouteError::Oversized(_)));
    }
}
