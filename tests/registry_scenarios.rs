//! Directory scenarios from `spec.md` §8: heartbeat eviction with
//! `PROVIDER_DISCONNECT` propagation, and `SWITCH_SERVER` migration.

use std::path::PathBuf;

use synerex::model::NodeType;
use synerex::registry::{Command, NodeRegistry, RegisterInfo, SwitchServerOrder};

fn tempdir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("synerex-registry-it-{}", rand::random::<u64>()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn broker(name: &str, addr: &str) -> RegisterInfo {
    RegisterInfo {
        node_name: name.to_string(),
        node_type: NodeType::Server,
        addr: addr.to_string(),
        pbase_version: "0.1.9".into(),
        bin_version: "test".into(),
        channel_types: vec![],
        keepalive_interval: 10,
        with_node_id: None,
        gw_info: None,
    }
}

fn provider(name: &str, keepalive_interval: i32) -> RegisterInfo {
    RegisterInfo {
        node_name: name.to_string(),
        node_type: NodeType::Provider,
        addr: String::new(),
        pbase_version: "0.1.9".into(),
        bin_version: "test".into(),
        channel_types: vec![3],
        keepalive_interval,
        with_node_id: None,
        gw_info: None,
    }
}

#[test]
fn scenario_5_heartbeat_eviction_propagates_provider_disconnect() {
    let registry = NodeRegistry::new(tempdir());
    let b0 = registry.register(broker("b0", "127.0.0.1:3000")).unwrap();
    // keepalive_interval = 0 means `is_live` tolerates zero slack: any
    // elapsed wall-clock time is enough to mark the record stale.
    let p100 = registry.register(provider("p100", 0)).unwrap();

    std::thread::sleep(std::time::Duration::from_millis(20));
    let evicted = registry.sweep_liveness();
    assert_eq!(evicted, vec![p100.node_id]);

    // the broker's next heartbeat learns about the eviction.
    let result = registry.heartbeat(b0.node_id, b0.secret, 1, String::new()).unwrap();
    assert_eq!(result.command, Command::ProviderDisconnect);
    assert_eq!(result.disconnected, vec![p100.node_id]);

    // draining pendingNodes is one-shot: the next heartbeat is quiet.
    let second = registry.heartbeat(b0.node_id, b0.secret, 2, String::new()).unwrap();
    assert_eq!(second.command, Command::None);

    // the evicted provider itself now gets Reconnect since its record is gone.
    let reconnect = registry.heartbeat(p100.node_id, p100.secret, 1, String::new()).unwrap();
    assert_eq!(reconnect.command, Command::Reconnect);
}

#[test]
fn scenario_6_switch_server_migrates_provider_to_new_broker() {
    let registry = NodeRegistry::new(tempdir());
    let b0 = registry.register(broker("b0", "127.0.0.1:3000")).unwrap();
    let b1 = registry.register(broker("b1", "127.0.0.1:3001")).unwrap();
    let p100 = registry.register(provider("p100", 10)).unwrap();
    assert_eq!(p100.broker_address, b0.broker_address);

    registry.control_switch_server(SwitchServerOrder { provider_id: p100.node_id, target_broker_id: b1.node_id });

    // re-registering under the same id before any heartbeat consumes the
    // pending order resolves the provider straight to the new broker.
    registry.unregister(p100.node_id, p100.secret).unwrap();
    let mut reregister = provider("p100", 10);
    reregister.with_node_id = Some(p100.node_id);
    let rejoined = registry.register(reregister).unwrap();
    assert_eq!(rejoined.node_id, p100.node_id);
    assert_eq!(rejoined.broker_address, "127.0.0.1:3001");

    // a second provider instead learns about the pending switch via its
    // next heartbeat, one-shot.
    let p200 = registry.register(provider("p200", 10)).unwrap();
    registry.control_switch_server(SwitchServerOrder { provider_id: p200.node_id, target_broker_id: b1.node_id });
    let result = registry.heartbeat(p200.node_id, p200.secret, 1, String::new()).unwrap();
    assert_eq!(result.command, Command::ServerChange);
    let second = registry.heartbeat(p200.node_id, p200.secret, 2, String::new()).unwrap();
    assert_eq!(second.command, Command::None);
}
