//! Local HTTP control surface.
//!
//! A small hand-rolled HTTP/1.1 server: one request per connection,
//! `Connection: close`, JSON in and out. Concurrency is bounded with a
//! semaphore; a slow or malformed client costs one permit, never the
//! accept loop.

use crate::node::{NodeHandle, MAX_ENVELOPE_BYTES};
use crate::resolver::PeerResolver;
use crate::router::Router;
use libp2p::PeerId;
use serde_json::{json, Value};
use std::{collections::HashMap, io, str, str::FromStr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpListener,
    sync::Semaphore,
    time,
};

const MAX_HEADER_BYTES: usize = 8 * 1024;
const MAX_BODY_BYTES: usize = MAX_ENVELOPE_BYTES;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_CONCURRENT_REQUESTS: usize = 64;

/// Bound on a full resolve + connect + ping round trip.
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a request handler may touch.
#[derive(Clone)]
pub struct ApiState {
    /// Swarm command handle.
    pub handle: NodeHandle,
    /// Peer-reference resolver.
    pub resolver: PeerResolver,
    /// Outbound message surface.
    pub router: Router,
}

/// Binds the control port and serves requests until the listener fails.
/// A bind failure is returned to the caller, which treats it as fatal.
pub async fn serve(port: u16, state: ApiState) -> io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    println!("SIGHT|mod=API|evt=LISTEN|port={port}");
    let limiter = Arc::new(Semaphore::new(MAX_CONCURRENT_REQUESTS));
    loop {
        match listener.accept().await {
            Ok((mut stream, _addr)) => {
                let permit = match limiter.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        eprintln!("api accept error: limiter closed");
                        continue;
                    }
                };
                let state = state.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(err) = handle_connection(&mut stream, &state).await {
                        eprintln!("api connection error: {err}");
                    }
                });
            }
            Err(err) => {
                eprintln!("api accept error: {err}");
                break;
            }
        }
    }
    Ok(())
}

async fn handle_connection<S>(stream: &mut S, state: &ApiState) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req = match read_http_request(stream, MAX_HEADER_BYTES, MAX_BODY_BYTES, REQUEST_TIMEOUT)
        .await
    {
        Ok(req) => req,
        Err(err) => {
            let resp = build_response("400 Bad Request", json!({"error": err.to_string()}));
            let _ = stream.write_all(&resp).await;
            let _ = stream.shutdown().await;
            return Ok(());
        }
    };
    let (status, body) = dispatch(state, &req).await;
    let resp = build_response(status, body);
    stream.write_all(&resp).await?;
    stream.shutdown().await
}

async fn dispatch(state: &ApiState, req: &HttpRequest) -> (&'static str, Value) {
    match req.method.as_str() {
        "POST" if req.path == "/libp2p/send" => handle_send(state, &req.body).await,
        "GET" if req.path.starts_with("/libp2p/find-peer/") => {
            let peer_ref = path_tail(&req.path, "/libp2p/find-peer/");
            handle_find_peer(state, peer_ref).await
        }
        "GET" if req.path.starts_with("/libp2p/public-key/") => {
            let peer_ref = path_tail(&req.path, "/libp2p/public-key/");
            handle_public_key(state, peer_ref).await
        }
        // The reference may itself be a raw multiaddr, so the whole path
        // remainder is the argument.
        "POST" if req.path.starts_with("/libp2p/connect/") => {
            let peer_ref = peer_ref_tail(&req.path, "/libp2p/connect/");
            handle_connect(state, &peer_ref).await
        }
        "GET" if req.path == "/libp2p/neighbors" => handle_neighbors(state).await,
        "GET" if req.path.starts_with("/libp2p/ping/") => {
            let peer_ref = peer_ref_tail(&req.path, "/libp2p/ping/");
            handle_ping(state, &peer_ref).await
        }
        "POST" if req.path.starts_with("/libp2p/send-direct/") => {
            let peer_ref = peer_ref_tail(&req.path, "/libp2p/send-direct/");
            handle_send_direct(state, &peer_ref, &req.body).await
        }
        _ => ("404 Not Found", json!({"error": "not found"})),
    }
}

async fn handle_send(state: &ApiState, body: &[u8]) -> (&'static str, Value) {
    let (to, payload) = match broadcast_request(body) {
        Ok(parsed) => parsed,
        Err(msg) => return ("400 Bad Request", json!({"error": msg})),
    };
    match state.router.send_broadcast(to, payload).await {
        Ok(()) => ("200 OK", json!({"status": "ok"})),
        Err(err) => ("500 Internal Server Error", json!({"error": err.to_string()})),
    }
}

async fn handle_find_peer(state: &ApiState, peer_ref: &str) -> (&'static str, Value) {
    let peer = match PeerId::from_str(peer_ref) {
        Ok(peer) => peer,
        Err(err) => {
            return (
                "400 Bad Request",
                json!({"error": format!("invalid peer id {peer_ref}: {err}")}),
            )
        }
    };
    match state.handle.find_peer(peer).await {
        Ok(addrs) => {
            let addrs: Vec<String> = addrs.iter().map(|a| a.to_string()).collect();
            ("200 OK", json!({"peerId": peer.to_string(), "addrs": addrs}))
        }
        Err(err) => (
            "404 Not Found",
            json!({"error": format!("find peer {peer_ref}: {err}")}),
        ),
    }
}

async fn handle_public_key(state: &ApiState, peer_ref: &str) -> (&'static str, Value) {
    match state.resolver.resolve_public_key(peer_ref).await {
        Ok(key) => (
            "200 OK",
            json!({
                "peerId": peer_ref,
                "publicKey": bs58::encode(key).into_string(),
            }),
        ),
        Err(err) => (
            "404 Not Found",
            json!({"error": format!("public key of {peer_ref}: {err}")}),
        ),
    }
}

async fn handle_connect(state: &ApiState, peer_ref: &str) -> (&'static str, Value) {
    match state.resolver.connect(peer_ref).await {
        Ok(peer) => (
            "200 OK",
            json!({"status": "connected", "peerId": peer.to_string()}),
        ),
        Err(err) => (
            "400 Bad Request",
            json!({"error": format!("connect {peer_ref}: {err}")}),
        ),
    }
}

async fn handle_neighbors(state: &ApiState) -> (&'static str, Value) {
    match state.handle.neighbors().await {
        Ok(peers) => {
            let peers: Vec<String> = peers.iter().map(|p| p.to_string()).collect();
            ("200 OK", json!({"count": peers.len(), "peers": peers}))
        }
        Err(err) => ("500 Internal Server Error", json!({"error": err.to_string()})),
    }
}

async fn handle_ping(state: &ApiState, peer_ref: &str) -> (&'static str, Value) {
    let round_trip = time::timeout(PING_TIMEOUT, async {
        let peer = state
            .resolver
            .connect(peer_ref)
            .await
            .map_err(|err| err.to_string())?;
        let rtt = state
            .handle
            .ping(peer)
            .await
            .map_err(|err| err.to_string())?;
        Ok::<_, String>((peer, rtt))
    })
    .await;
    match round_trip {
        Ok(Ok((peer, rtt))) => (
            "200 OK",
            json!({
                "peerId": peer.to_string(),
                "rtt_ms": rtt.as_millis() as u64,
            }),
        ),
        Ok(Err(msg)) => (
            "500 Internal Server Error",
            json!({"error": format!("ping {peer_ref}: {msg}")}),
        ),
        Err(_) => (
            "500 Internal Server Error",
            json!({"error": format!("ping {peer_ref}: timed out after {PING_TIMEOUT:?}")}),
        ),
    }
}

async fn handle_send_direct(
    state: &ApiState,
    peer_ref: &str,
    body: &[u8],
) -> (&'static str, Value) {
    let payload: Value = match serde_json::from_slice(body) {
        Ok(payload) => payload,
        Err(err) => {
            return (
                "400 Bad Request",
                json!({"error": format!("invalid JSON body: {err}")}),
            )
        }
    };
    match state.router.send_direct(peer_ref, payload).await {
        Ok(()) => ("200 OK", json!({"status": "ok"})),
        Err(err) => (
            "500 Internal Server Error",
            json!({"error": format!("send-direct {peer_ref}: {err}")}),
        ),
    }
}

/// Splits a broadcast request body into the addressee and the payload. The
/// whole body is the payload; its `to` field names the recipient.
fn broadcast_request(body: &[u8]) -> Result<(String, Value), String> {
    let value: Value =
        serde_json::from_slice(body).map_err(|err| format!("invalid JSON body: {err}"))?;
    let to = value
        .get("to")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "missing \"to\" field".to_string())?
        .to_string();
    Ok((to, value))
}

fn path_tail<'a>(path: &'a str, prefix: &str) -> &'a str {
    path.strip_prefix(prefix).unwrap_or("")
}

/// Peer reference from a path remainder. DIDs and peer ids never contain
/// `/`, while multiaddrs always start with one that URL routing swallowed,
/// so a tail with separators gets its leading slash restored.
fn peer_ref_tail(path: &str, prefix: &str) -> String {
    let tail = path_tail(path, prefix);
    if tail.contains('/') && !tail.starts_with('/') {
        format!("/{tail}")
    } else {
        tail.to_string()
    }
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

async fn read_http_request<S>(
    stream: &mut S,
    max_header_bytes: usize,
    max_body_bytes: usize,
    timeout: Duration,
) -> io::Result<HttpRequest>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut header_end = None;
    loop {
        let mut tmp = [0u8; 1024];
        let n = time::timeout(timeout, stream.read(&mut tmp))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timeout"))??;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
        if buf.len() > max_header_bytes && header_end.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "header too large",
            ));
        }
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            header_end = Some(pos + 4);
            break;
        }
    }
    let end = header_end
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "malformed request"))?;
    let header_str = str::from_utf8(&buf[..end])
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid header"))?;
    let mut lines = header_str.split("\r\n").filter(|l| !l.is_empty());
    let request_line = lines
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing request line"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let path = parts.next().unwrap_or("").to_string();
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    let content_len: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if content_len > max_body_bytes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "content-length exceeds limit",
        ));
    }
    let mut body = if end < buf.len() {
        buf[end..].to_vec()
    } else {
        Vec::new()
    };
    while body.len() < content_len {
        let remaining = content_len - body.len();
        let mut tmp = vec![0u8; remaining.min(8192)];
        let n = time::timeout(timeout, stream.read(&mut tmp))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timeout"))??;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&tmp[..n]);
    }
    if body.len() < content_len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "incomplete request body",
        ));
    }
    Ok(HttpRequest {
        method,
        path,
        headers,
        body,
    })
}

fn build_response(status: &str, body: Value) -> Vec<u8> {
    let body = body.to_string();
    format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::did;
    use crate::node::{scripted_handle, Command, Node, DIRECT_PROTOCOL};
    use libp2p::identity;
    use libp2p_stream as stream;
    use tokio::sync::mpsc;

    /// Full request-handling state whose command stream is served by the
    /// returned receiver; no sockets, no swarm.
    fn scripted_state() -> (ApiState, mpsc::Receiver<Command>) {
        let (handle, rx) = scripted_handle();
        let behaviour = stream::Behaviour::new();
        let mut control = behaviour.new_control();
        let incoming = control.accept(DIRECT_PROTOCOL.clone()).unwrap();
        let (_inbound_tx, inbound) = mpsc::channel(1);
        let node = Node {
            handle: handle.clone(),
            inbound,
            incoming_streams: incoming,
            control,
        };
        let resolver = PeerResolver::new(handle.clone());
        let router = Router::start(
            node,
            resolver.clone(),
            "http://localhost:1/libp2p/message".to_string(),
            "did:sight:hoster:self".to_string(),
        );
        let state = ApiState {
            handle,
            resolver,
            router,
        };
        (state, rx)
    }

    fn get(path: &str) -> HttpRequest {
        HttpRequest {
            method: "GET".to_string(),
            path: path.to_string(),
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let (state, _rx) = scripted_state();
        let (status, body) = dispatch(&state, &get("/nope")).await;
        assert_eq!(status, "404 Not Found");
        assert_eq!(body["error"], "not found");
    }

    #[tokio::test]
    async fn ping_of_unreachable_peer_fails_fast() {
        let (state, mut rx) = scripted_state();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                if let Command::FindPeer { reply, .. } = command {
                    let _ = reply.send(Err("no addresses found".to_string()));
                }
            }
        });
        let keypair = identity::Keypair::generate_ed25519();
        let raw = keypair
            .public()
            .clone()
            .try_into_ed25519()
            .unwrap()
            .to_bytes();
        let target = did::public_key_to_did(&raw);

        let (status, body) = time::timeout(
            Duration::from_secs(6),
            dispatch(&state, &get(&format!("/libp2p/ping/{target}"))),
        )
        .await
        .unwrap();
        assert_eq!(status, "500 Internal Server Error");
        assert!(body["error"].as_str().unwrap().contains("ping"));
    }

    async fn parse(raw: &[u8]) -> io::Result<HttpRequest> {
        let (mut client, mut server) = tokio::io::duplex(16 * 1024);
        client.write_all(raw).await.unwrap();
        client.shutdown().await.unwrap();
        read_http_request(
            &mut server,
            MAX_HEADER_BYTES,
            MAX_BODY_BYTES,
            Duration::from_secs(1),
        )
        .await
    }

    #[tokio::test]
    async fn parses_request_line_headers_and_body() {
        let raw = b"POST /libp2p/send HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 11\r\n\r\n{\"to\":\"x\"}\n";
        let req = parse(raw).await.unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/libp2p/send");
        assert_eq!(
            req.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
        assert_eq!(req.body, b"{\"to\":\"x\"}\n");
    }

    #[tokio::test]
    async fn rejects_oversized_declared_body() {
        let raw = format!(
            "POST /libp2p/send HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            MAX_BODY_BYTES + 1
        );
        let err = parse(raw.as_bytes()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn rejects_truncated_body() {
        let raw = b"POST /x HTTP/1.1\r\nContent-Length: 10\r\n\r\nshort";
        let err = parse(raw).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn response_carries_status_and_length() {
        let resp = build_response("200 OK", json!({"status": "ok"}));
        let text = String::from_utf8(resp).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 15\r\n"));
        assert!(text.ends_with("{\"status\":\"ok\"}"));
    }

    #[test]
    fn broadcast_request_requires_to_field() {
        let (to, payload) =
            broadcast_request(br#"{"to":"did:sight:hoster:abc","n":1}"#).unwrap();
        assert_eq!(to, "did:sight:hoster:abc");
        assert_eq!(payload["n"], 1);

        assert!(broadcast_request(br#"{"n":1}"#).is_err());
        assert!(broadcast_request(b"nope").is_err());
    }

    #[test]
    fn peer_ref_tail_restores_the_multiaddr_leading_slash() {
        assert_eq!(
            peer_ref_tail("/libp2p/connect/ip4/1.2.3.4/tcp/1", "/libp2p/connect/"),
            "/ip4/1.2.3.4/tcp/1"
        );
        // A caller that double-slashes anyway is not penalized.
        assert_eq!(
            peer_ref_tail("/libp2p/connect//ip4/1.2.3.4/tcp/1", "/libp2p/connect/"),
            "/ip4/1.2.3.4/tcp/1"
        );
        assert_eq!(
            peer_ref_tail("/libp2p/ping/did:sight:hoster:abc", "/libp2p/ping/"),
            "did:sight:hoster:abc"
        );
        assert_eq!(peer_ref_tail("/libp2p/connect/", "/libp2p/connect/"), "");
    }

    #[tokio::test]
    async fn connect_route_accepts_natural_multiaddr_paths() {
        let (state, mut rx) = scripted_state();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                if let Command::Connect { reply, .. } = command {
                    let _ = reply.send(Ok(()));
                }
            }
        });
        let peer = libp2p::PeerId::random();
        let req = HttpRequest {
            method: "POST".to_string(),
            path: format!("/libp2p/connect/ip4/127.0.0.1/tcp/15001/p2p/{peer}"),
            headers: HashMap::new(),
            body: Vec::new(),
        };
        let (status, body) = dispatch(&state, &req).await;
        assert_eq!(status, "200 OK");
        assert_eq!(body["peerId"], peer.to_string());
    }
}
