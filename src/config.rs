//! Immutable node configuration, constructed once at startup.
//!
//! All environment access happens here; every other component receives the
//! finished [`NodeConfig`] by reference and never reads ambient process
//! state.

use libp2p::{multiaddr::Protocol, Multiaddr};
use std::{env, net::Ipv4Addr, path::PathBuf};

/// Environment variable naming the shared data directory (the key file lives
/// in its `config/` subdirectory).
pub const ENV_DATA_DIR: &str = "SIGHT_DATA_DIR";

const DEFAULT_NODE_PORT: u16 = 15050;
const DEFAULT_HTTP_PORT: u16 = 4010;

/// Runtime configuration for a sight overlay node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Directory holding the persisted keypair.
    pub key_dir: PathBuf,
    /// TCP port the libp2p transport listens on (`NODE_PORT`).
    pub node_port: u16,
    /// TCP port of the local HTTP surface (`LIBP2P_PORT`).
    pub http_port: u16,
    /// Bootstrap peers dialed on startup (`BOOTSTRAP_ADDRS`, comma separated).
    pub bootstrap: Vec<Multiaddr>,
    /// Local tunnel endpoint that receives forwarded payloads.
    pub sink_url: String,
    /// Gateway mode: fixed well-known identity instead of a per-device DID
    /// (`IS_GATEWAY`).
    pub is_gateway: bool,
}

impl NodeConfig {
    /// Builds the configuration from process environment variables, applying
    /// the documented defaults.
    pub fn from_env() -> NodeConfig {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> NodeConfig {
        let key_dir = lookup(ENV_DATA_DIR)
            .map(|dir| PathBuf::from(dir).join("config"))
            .unwrap_or_else(|| default_key_dir(&lookup));
        let node_port = parse_port(lookup("NODE_PORT"), DEFAULT_NODE_PORT);
        let http_port = parse_port(lookup("LIBP2P_PORT"), DEFAULT_HTTP_PORT);
        let bootstrap = lookup("BOOTSTRAP_ADDRS")
            .map(|raw| parse_bootstrap_list(&raw))
            .unwrap_or_default();
        let api_port = lookup("API_PORT").unwrap_or_else(|| "8716".to_string());
        let sink_url = format!("http://localhost:{api_port}/libp2p/message");
        let is_gateway = lookup("IS_GATEWAY")
            .map(|v| parse_flag(&v))
            .unwrap_or(false);
        NodeConfig {
            key_dir,
            node_port,
            http_port,
            bootstrap,
            sink_url,
            is_gateway,
        }
    }

    /// Multiaddr the libp2p transport listens on.
    pub fn listen_addr(&self) -> Multiaddr {
        Multiaddr::empty()
            .with(Protocol::Ip4(Ipv4Addr::UNSPECIFIED))
            .with(Protocol::Tcp(self.node_port))
    }
}

fn default_key_dir(lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    let home = lookup("HOME").unwrap_or_else(|| ".".to_string());
    PathBuf::from(home).join(".sight").join("config")
}

fn parse_port(value: Option<String>, default: u16) -> u16 {
    value
        .and_then(|v| v.trim().parse::<u16>().ok())
        .unwrap_or(default)
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Parses a comma-separated multiaddr list, logging and skipping invalid
/// entries rather than refusing to start.
fn parse_bootstrap_list(raw: &str) -> Vec<Multiaddr> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .filter_map(|part| match part.parse::<Multiaddr>() {
            Ok(addr) => Some(addr),
            Err(err) => {
                eprintln!("invalid bootstrap addr {part}: {err}");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = vars.iter().copied().collect();
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = NodeConfig::from_lookup(lookup(&[("HOME", "/home/x")]));
        assert_eq!(cfg.node_port, 15050);
        assert_eq!(cfg.http_port, 4010);
        assert!(cfg.bootstrap.is_empty());
        assert!(!cfg.is_gateway);
        assert_eq!(cfg.key_dir, PathBuf::from("/home/x/.sight/config"));
    }

    #[test]
    fn data_dir_overrides_home() {
        let cfg = NodeConfig::from_lookup(lookup(&[
            ("HOME", "/home/x"),
            (ENV_DATA_DIR, "/data"),
        ]));
        assert_eq!(cfg.key_dir, PathBuf::from("/data/config"));
    }

    #[test]
    fn bootstrap_list_skips_invalid_entries() {
        let cfg = NodeConfig::from_lookup(lookup(&[(
            "BOOTSTRAP_ADDRS",
            "/ip4/127.0.0.1/tcp/15001,bogus,,/ip4/127.0.0.1/tcp/15002",
        )]));
        assert_eq!(cfg.bootstrap.len(), 2);
    }

    #[test]
    fn sink_url_tracks_api_port() {
        let cfg = NodeConfig::from_lookup(lookup(&[("API_PORT", "9000")]));
        assert_eq!(cfg.sink_url, "http://localhost:9000/libp2p/message");
    }

    #[test]
    fn gateway_flag_accepts_common_spellings() {
        for v in ["1", "true", "YES", "on"] {
            let cfg = NodeConfig::from_lookup(lookup(&[("IS_GATEWAY", v)]));
            assert!(cfg.is_gateway, "{v} should enable gateway mode");
        }
        let cfg = NodeConfig::from_lookup(lookup(&[("IS_GATEWAY", "0")]));
        assert!(!cfg.is_gateway);
    }
}
