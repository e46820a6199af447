//! Tavern document server: the remote side of `tavern-docsync`.
//!
//! Holds document snapshots and retained updates in memory and serves
//! them over WebSocket. Bind address comes from `TAVERN_DOCSERVER_ADDR`
//! (default `127.0.0.1:9190`); log level from `RUST_LOG`.

use log::{error, info};
use tavern_docsync::{DocServer, ServerConfig};

const ADDR_ENV: &str = "TAVERN_DOCSERVER_ADDR";

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut config = ServerConfig::default();
    if let Ok(addr) = std::env::var(ADDR_ENV) {
        config.bind_addr = addr;
    }

    info!("Starting Tavern document server on {}...", config.bind_addr);
    let server = DocServer::new(config);
    if let Err(e) = server.run().await {
        error!("Document server stopped: {e}");
        std::process::exit(1);
    }
}
