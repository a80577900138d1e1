//! `synerex-nodeserv`: the directory, covering node identity, liveness,
//! broker profiles, and the migration queue.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::info;
use tonic::transport::Server;

use synerex::config::NodeservConfig;
use synerex::registry::{NodeRegistry, DEFAULT_DURATION_SECS};
use synerex::rpc::{ControlService, NodeService};
use synerex::synerex::control::node_control_server::NodeControlServer;
use synerex::synerex::node::node_server::NodeServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = NodeservConfig::parse();

    info!("synerex-nodeserv {} starting", env!("CARGO_PKG_VERSION"));

    let registry = Arc::new(NodeRegistry::new(&config.data_dir));
    if config.restart() {
        registry.load_from_disk()?;
    }

    let sweeper = Arc::clone(&registry);
    let verbose = config.verbose();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(DEFAULT_DURATION_SECS as u64));
        loop {
            ticker.tick().await;
            let evicted = sweeper.sweep_liveness();
            if verbose && !evicted.is_empty() {
                info!("liveness sweep evicted: {evicted:?}");
            }
        }
    });

    let addr = config.addr().parse()?;
    info!("listening on {addr}");
    Server::builder()
        .add_service(NodeServer::new(NodeService::new(registry.clone(), verbose)))
        .add_service(NodeControlServer::new(ControlService::new(registry)))
        .serve(addr)
        .await?;
    Ok(())
}
