//! `synctl`: operator CLI over the directory's `NodeControl` surface.

use clap::Parser;

use synerex::config::SynctlConfig;
use synerex::synerex::control::node_control_client::NodeControlClient;
use synerex::synerex::control::{NodeControlFilter, Order, OrderType, SwitchServerInfo};
use synerex::synerex::node::NodeType;

#[tokio::main]
async fn main() {
    let config = SynctlConfig::parse();
    std::process::exit(run(config).await);
}

async fn run(config: SynctlConfig) -> i32 {
    let endpoint = format!("http://{}", config.nodesrv);
    let mut client = match NodeControlClient::connect(endpoint).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("cannot reach directory at {}: {e}", config.nodesrv);
            return 1;
        }
    };

    if config.show {
        return show(&mut client).await;
    }

    if let Some(spec) = config.sxmove {
        return sxmove(&mut client, &spec).await;
    }

    eprintln!("nothing to do: pass --show or --sxmove <providerId>,<brokerId>");
    1
}

async fn show(client: &mut NodeControlClient<tonic::transport::Channel>) -> i32 {
    for (label, node_type) in [("gateways", NodeType::Gateway), ("brokers", NodeType::Server), ("providers", NodeType::Provider)] {
        let resp = match client.query_node_infos(NodeControlFilter { node_type: node_type as i32 }).await {
            Ok(r) => r.into_inner(),
            Err(e) => {
                eprintln!("query failed for {label}: {e}");
                return 1;
            }
        };
        println!("-- {label} --");
        for info in resp.infos {
            let name = info.node_info.as_ref().map(|n| n.node_name.as_str()).unwrap_or("?");
            let addr = info.node_info.as_ref().map(|n| n.server_info.as_str()).unwrap_or("");
            println!("  id={:<5} name={:<20} addr={:<22} last_alive_ms={}", info.node_id, name, addr, info.last_alive_unix_ms);
        }
    }
    0
}

async fn sxmove(client: &mut NodeControlClient<tonic::transport::Channel>, spec: &str) -> i32 {
    let parts: Vec<&str> = spec.split(',').collect();
    let (Some(provider), Some(broker)) = (parts.first(), parts.get(1)) else {
        eprintln!("--sxmove expects <providerId>,<brokerId>");
        return 1;
    };
    let (Ok(provider_id), Ok(broker_id)) = (provider.trim().parse::<i32>(), broker.trim().parse::<i32>()) else {
        eprintln!("--sxmove ids must be integers");
        return 1;
    };

    let order = Order {
        order_type: OrderType::SwitchServer as i32,
        target_node_id: provider_id,
        switch_info: Some(SwitchServerInfo { target_broker_id: broker_id }),
    };
    match client.control_nodes(order).await {
        Ok(resp) => {
            let resp = resp.into_inner();
            if resp.ok {
                println!("SWITCH_SERVER({provider_id} -> {broker_id}) acknowledged");
                0
            } else {
                eprintln!("SWITCH_SERVER rejected: {}", resp.err);
                1
            }
        }
        Err(e) => {
            eprintln!("control_nodes rpc failed: {e}");
            1
        }
    }
}
