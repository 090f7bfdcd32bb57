//! Nine-node bootstrap mesh on ports 15001-15009, each node with a fixed,
//! well-known identity so the rest of the network can hardcode its
//! multiaddrs.

use sightnet::mesh;
use tokio::signal;

fn fatal(message: &str) -> ! {
    eprintln!("{message}");
    std::process::exit(1);
}

fn main() {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    let runtime = builder
        .build()
        .unwrap_or_else(|err| fatal(&format!("failed to start runtime: {err}")));

    runtime.block_on(async {
        let handles = mesh::run_cluster()
            .await
            .unwrap_or_else(|err| fatal(&format!("mesh start failed: {err}")));
        println!("SIGHT|mod=MESH|evt=READY|nodes={}", handles.len());

        match signal::ctrl_c().await {
            Ok(()) => println!("SIGHT|mod=MESH|evt=SHUTDOWN"),
            Err(err) => eprintln!("signal wait failed: {err}"),
        }
        for handle in &handles {
            handle.shutdown().await;
        }
    });
}
