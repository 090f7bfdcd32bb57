//! Long-lived sight overlay node: the libp2p swarm, the tunnel router, and
//! the local HTTP surface, configured entirely from the environment.

use sightnet::{
    api::{self, ApiState},
    config::NodeConfig,
    did,
    keypair::Keypair,
    node,
    resolver::PeerResolver,
    router::Router,
};
use tokio::signal;

fn fatal(message: &str) -> ! {
    eprintln!("{message}");
    std::process::exit(1);
}

fn main() {
    let cfg = NodeConfig::from_env();

    // Gateways share one well-known identity and answer to a fixed name;
    // regular nodes derive their DID from the persisted device key.
    let (keypair, self_did) = if cfg.is_gateway {
        let kp = Keypair::gateway()
            .unwrap_or_else(|err| fatal(&format!("gateway identity: {err}")));
        (kp, "gateway".to_string())
    } else {
        let kp = Keypair::load_or_generate(&cfg.key_dir)
            .unwrap_or_else(|err| fatal(&format!("identity load failed: {err}")));
        let self_did = did::public_key_to_did(&kp.public_key_bytes());
        (kp, self_did)
    };
    println!("SIGHT|mod=MAIN|evt=IDENTITY|did={self_did}");

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    let runtime = builder
        .build()
        .unwrap_or_else(|err| fatal(&format!("failed to start runtime: {err}")));

    runtime.block_on(async move {
        let node = node::start(cfg.listen_addr(), &cfg.bootstrap, &keypair)
            .unwrap_or_else(|err| fatal(&format!("node start failed: {err}")));
        let handle = node.handle.clone();
        let resolver = PeerResolver::new(handle.clone());
        let router = Router::start(node, resolver.clone(), cfg.sink_url.clone(), self_did);

        let state = ApiState {
            handle: handle.clone(),
            resolver,
            router,
        };
        let http_port = cfg.http_port;
        tokio::spawn(async move {
            if let Err(err) = api::serve(http_port, state).await {
                fatal(&format!("http surface on port {http_port}: {err}"));
            }
        });

        match signal::ctrl_c().await {
            Ok(()) => println!("SIGHT|mod=MAIN|evt=SHUTDOWN"),
            Err(err) => eprintln!("signal wait failed: {err}"),
        }
        handle.shutdown().await;
    });
}
