//! `synerex-broker`: channel fan-out, selection negotiation, Mbus, and
//! gateway bridging. Registers itself with the directory the same way any
//! other node does.

use std::sync::{Arc, Mutex};

use clap::Parser;
use log::{error, info};
use tonic::transport::Server;

use synerex::client::{ClientCallbacks, ProviderClient, RegistrationInfo};
use synerex::config::BrokerConfig;
use synerex::model::NodeType;
use synerex::router::Router;
use synerex::rpc::FabricService;
use synerex::synerex::fabric::fabric_server::FabricServer;

struct BrokerCallbacks {
    router: Mutex<Option<Arc<Router>>>,
}

impl BrokerCallbacks {
    fn new() -> Self {
        Self { router: Mutex::new(None) }
    }

    fn set_router(&self, router: Arc<Router>) {
        *self.router.lock().unwrap_or_else(|e| e.into_inner()) = Some(router);
    }
}

impl BrokerCallbacks {
    fn reseed(&self, node_id: i32) {
        if let Some(router) = self.router.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            router.reseed_id_allocator(node_id);
        }
    }
}

impl ClientCallbacks for BrokerCallbacks {
    fn on_reconnect(&self, new_node_id: i32) {
        self.reseed(new_node_id);
    }

    fn on_provider_disconnect(&self, node_ids: &[i32]) {
        let guard = self.router.lock().unwrap_or_else(|e| e.into_inner());
        let Some(router) = guard.as_ref() else { return };
        for id in node_ids {
            info!("closing channels for disconnected provider {id}");
            router.close_all_channels(*id as u64);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = BrokerConfig::parse();

    let callbacks = Arc::new(BrokerCallbacks::new());
    let info = RegistrationInfo {
        node_name: config.name(),
        node_type: NodeType::Server,
        server_info: config.addr(),
        channel_types: Vec::new(),
        gw_info: String::new(),
        pbase_version: env!("CARGO_PKG_VERSION").to_string(),
        bin_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let client = Arc::new(ProviderClient::new(config.nodesrv(), info, callbacks.clone()));
    client.register().await?;

    let router = Arc::new(Router::new(client.node_id()));
    callbacks.set_router(router.clone());

    tokio::spawn(Arc::clone(&client).run_heartbeat_loop());

    let addr = config.addr().parse()?;
    info!("synerex-broker {} listening on {addr}", env!("CARGO_PKG_VERSION"));
    let service = FabricService::new(router);
    if let Err(e) = Server::builder().add_service(FabricServer::new(service)).serve(addr).await {
        error!("server error: {e}");
        return Err(e.into());
    }
    Ok(())
}
