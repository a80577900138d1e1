//! The Directory: node id allocation, heartbeat liveness, broker profiles,
//! and the provider migration queue.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::FabricError;
use crate::model::{now_unix_ms, BrokerProfile, NodeRecord, NodeType, MAX_NODE_NUM, MAX_SERVER_ID};

pub const DEFAULT_DURATION_SECS: i64 = 10;
pub const MAX_MISSES: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    None,
    Reconnect,
    ServerChange,
    ProviderDisconnect,
}

#[derive(Debug, Clone)]
pub struct RegisterInfo {
    pub node_name: String,
    pub node_type: NodeType,
    pub addr: String,
    pub pbase_version: String,
    pub bin_version: String,
    pub channel_types: Vec<u32>,
    pub keepalive_interval: i32,
    /// A caller may request a specific id (used on re-registration after
    /// `RECONNECT`); honored if free, otherwise silently reassigned.
    pub with_node_id: Option<i32>,
    /// Comma-separated broker `node_name` list, meaningful for gateways
    /// only (`GwInfo` in the original).
    pub gw_info: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RegisterResult {
    pub node_id: i32,
    pub secret: u64,
    pub broker_address: String,
    pub keepalive_interval: i32,
}

#[derive(Debug, Clone)]
pub struct HeartbeatResult {
    pub command: Command,
    /// JSON array of evicted provider ids, populated only for
    /// `Command::ProviderDisconnect`.
    pub disconnected: Vec<i32>,
}

#[derive(Debug, Clone, Copy)]
pub struct SwitchServerOrder {
    pub provider_id: i32,
    pub target_broker_id: i32,
}

#[derive(Serialize, Deserialize)]
struct NodeInfoEntry {
    node_id: i32,
    info: NodeRecord,
}

#[derive(Debug)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<i32, NodeRecord>>,
    profiles: RwLock<HashMap<i32, BrokerProfile>>,
    connection_map: RwLock<HashMap<i32, i32>>,
    migrations: RwLock<HashMap<i32, SwitchServerOrder>>,
    last_broker_pick: RwLock<i32>,
    last_other_pick: RwLock<i32>,
    nodeinfo_path: PathBuf,
    sxprofile_path: PathBuf,
}

impl NodeRegistry {
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        let dir = working_dir.as_ref();
        Self {
            nodes: RwLock::new(HashMap::new()),
            profiles: RwLock::new(HashMap::new()),
            connection_map: RwLock::new(HashMap::new()),
            migrations: RwLock::new(HashMap::new()),
            last_broker_pick: RwLock::new(MAX_SERVER_ID - 1),
            last_other_pick: RwLock::new(MAX_NODE_NUM - 1),
            nodeinfo_path: dir.join("nodeinfo.json"),
            sxprofile_path: dir.join("sxprofile.json"),
        }
    }

    /// Loads both JSON snapshots and resets `last_alive` on every loaded
    /// record to "now", granting a grace interval before the liveness
    /// sweep can evict anything right after a restart.
    pub fn load_from_disk(&self) -> anyhow::Result<()> {
        if let Ok(bytes) = std::fs::read(&self.nodeinfo_path) {
            let entries: Vec<NodeInfoEntry> = serde_json::from_slice(&bytes)?;
            let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
            let now = now_unix_ms();
            for mut entry in entries {
                entry.info.last_alive = now;
                nodes.insert(entry.node_id, entry.info);
            }
            info!("loaded {} node records from {}", nodes.len(), self.nodeinfo_path.display());
        }
        if let Ok(bytes) = std::fs::read(&self.sxprofile_path) {
            let profiles: Vec<BrokerProfile> = serde_json::from_slice(&bytes)?;
            let mut guard = self.profiles.write().unwrap_or_else(|e| e.into_inner());
            for p in profiles {
                guard.insert(p.node_id, p);
            }
        }
        Ok(())
    }

    fn persist(&self) {
        let entries: Vec<NodeInfoEntry> = self
            .nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, info)| NodeInfoEntry { node_id: *id, info: info.clone() })
            .collect();
        if let Err(e) = write_pretty_json(&self.nodeinfo_path, &entries) {
            warn!("failed to persist {}: {e}", self.nodeinfo_path.display());
        }

        let profiles: Vec<BrokerProfile> =
            self.profiles.read().unwrap_or_else(|e| e.into_inner()).values().cloned().collect();
        if let Err(e) = write_pretty_json(&self.sxprofile_path, &profiles) {
            warn!("failed to persist {}: {e}", self.sxprofile_path.display());
        }
    }

    // -- ID allocation ----------------------------------------------------

    fn next_broker_candidate(last: i32) -> i32 {
        (last + 1).rem_euclid(MAX_SERVER_ID)
    }

    fn next_other_candidate(last: i32) -> i32 {
        (last - MAX_SERVER_ID + 1).rem_euclid(MAX_NODE_NUM - MAX_SERVER_ID) + MAX_SERVER_ID
    }

    /// Round-robins from the last successful pick, skipping ids that are
    /// live or present in any broker's `pendingNodes`.
    fn allocate_id(&self, node_type: NodeType) -> Result<i32, FabricError> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        let profiles = self.profiles.read().unwrap_or_else(|e| e.into_inner());
        let is_reserved = |id: i32| {
            nodes.contains_key(&id) || profiles.values().any(|p| p.pending_nodes.contains(&id))
        };

        if node_type == NodeType::Server {
            let mut last = self.last_broker_pick.write().unwrap_or_else(|e| e.into_inner());
            for _ in 0..MAX_SERVER_ID {
                let candidate = Self::next_broker_candidate(*last);
                *last = candidate;
                if !is_reserved(candidate) {
                    return Ok(candidate);
                }
            }
        } else {
            let mut last = self.last_other_pick.write().unwrap_or_else(|e| e.into_inner());
            for _ in 0..(MAX_NODE_NUM - MAX_SERVER_ID) {
                let candidate = Self::next_other_candidate(*last);
                *last = candidate;
                if !is_reserved(candidate) {
                    return Ok(candidate);
                }
            }
        }
        Err(FabricError::NoExtraNodeId)
    }

    fn id_is_free(&self, id: i32) -> bool {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        let profiles = self.profiles.read().unwrap_or_else(|e| e.into_inner());
        !nodes.contains_key(&id) && !profiles.values().any(|p| p.pending_nodes.contains(&id))
    }

    // -- Register ---------------------------------------------------------

    pub fn register(&self, info: RegisterInfo) -> Result<RegisterResult, FabricError> {
        let node_id = match info.with_node_id {
            Some(requested) if self.id_is_free(requested) => requested,
            Some(requested) => {
                warn!("requested node id {requested} unavailable, reassigning");
                self.allocate_id(info.node_type)?
            }
            None => self.allocate_id(info.node_type)?,
        };

        let secret: u64 = rand::random();
        let now = now_unix_ms();

        let broker_address = match info.node_type {
            NodeType::Server => {
                let mut profiles = self.profiles.write().unwrap_or_else(|e| e.into_inner());
                profiles.insert(
                    node_id,
                    BrokerProfile {
                        node_id,
                        server_info: info.addr.clone(),
                        channel_types: info.channel_types.clone(),
                        cluster_id: 0,
                        area_id: String::new(),
                        node_name: info.node_name.clone(),
                        pending_nodes: Vec::new(),
                    },
                );
                info.addr.clone()
            }
            NodeType::Gateway => self.resolve_gateway_brokers(info.gw_info.as_deref()),
            NodeType::Provider => {
                let addr = self.resolve_provider_broker(node_id);
                self.connection_map.write().unwrap_or_else(|e| e.into_inner()).insert(node_id, 0);
                addr
            }
        };

        self.nodes.write().unwrap_or_else(|e| e.into_inner()).insert(
            node_id,
            NodeRecord {
                node_id,
                node_name: info.node_name,
                node_type: info.node_type,
                addr: info.addr,
                pbase_version: info.pbase_version,
                bin_version: info.bin_version,
                channel_types: info.channel_types,
                last_alive: now,
                keepalive_interval: info.keepalive_interval,
                status_counter: 0,
                status_arg: String::new(),
                secret,
                last_print: now,
            },
        );

        self.persist();

        Ok(RegisterResult { node_id, secret, broker_address, keepalive_interval: info.keepalive_interval })
    }

    /// `getSynerexServer`/`GetServerIdForPrv`/`GetConnectSvrId`: pending
    /// migration first, else the provider's existing connection map
    /// entry, else the first registered broker profile, else none.
    fn resolve_provider_broker(&self, provider_id: i32) -> String {
        if let Some(order) = self.migrations.read().unwrap_or_else(|e| e.into_inner()).get(&provider_id) {
            let profiles = self.profiles.read().unwrap_or_else(|e| e.into_inner());
            if let Some(p) = profiles.get(&order.target_broker_id) {
                return p.server_info.clone();
            }
        }
        if let Some(&broker_id) = self.connection_map.read().unwrap_or_else(|e| e.into_inner()).get(&provider_id) {
            if broker_id != 0 {
                if let Some(p) = self.profiles.read().unwrap_or_else(|e| e.into_inner()).get(&broker_id) {
                    return p.server_info.clone();
                }
            }
        }
        let profiles = self.profiles.read().unwrap_or_else(|e| e.into_inner());
        profiles.values().min_by_key(|p| p.node_id).map(|p| p.server_info.clone()).unwrap_or_default()
    }

    /// `getSynerexServerForGw`: a literal name-based join of every broker
    /// profile whose `node_name` appears in the gateway's comma-separated
    /// list.
    fn resolve_gateway_brokers(&self, gw_info: Option<&str>) -> String {
        let Some(names) = gw_info else { return String::new() };
        let wanted: Vec<&str> = names.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
        let profiles = self.profiles.read().unwrap_or_else(|e| e.into_inner());
        profiles
            .values()
            .filter(|p| wanted.contains(&p.node_name.as_str()))
            .map(|p| p.server_info.clone())
            .collect::<Vec<_>>()
            .join(",")
    }

    // -- Heartbeat / Unregister --------------------------------------------

    pub fn heartbeat(
        &self,
        node_id: i32,
        secret: u64,
        status_counter: i32,
        status_arg: String,
    ) -> Result<HeartbeatResult, FabricError> {
        self.heartbeat_inner(node_id, secret, status_counter, status_arg, false)
    }

    /// As `heartbeat`, but additionally prints a `--verbose` listing line
    /// (node id/type/name/version/address/time-since-alive/update count/
    /// status) once per node whenever a heartbeat crosses half the
    /// keepalive window since the last such line, mirroring the original
    /// directory's periodic `lastPrint` logging.
    pub fn heartbeat_verbose(
        &self,
        node_id: i32,
        secret: u64,
        status_counter: i32,
        status_arg: String,
    ) -> Result<HeartbeatResult, FabricError> {
        self.heartbeat_inner(node_id, secret, status_counter, status_arg, true)
    }

    fn heartbeat_inner(
        &self,
        node_id: i32,
        secret: u64,
        status_counter: i32,
        status_arg: String,
        verbose: bool,
    ) -> Result<HeartbeatResult, FabricError> {
        let node_type = {
            let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
            let Some(record) = nodes.get_mut(&node_id) else {
                return Ok(HeartbeatResult { command: Command::Reconnect, disconnected: Vec::new() });
            };
            if record.secret != secret {
                return Err(FabricError::SecretMismatch);
            }
            let now = now_unix_ms();
            record.last_alive = now;
            record.status_counter = status_counter;
            record.status_arg = status_arg;
            if verbose && record.due_for_verbose_print(now) {
                info!(
                    "node id={} type={:?} name={} version={}/{} addr={} alive_ms_ago=0 updates={} status_arg={}",
                    record.node_id,
                    record.node_type,
                    record.node_name,
                    record.pbase_version,
                    record.bin_version,
                    record.addr,
                    record.status_counter,
                    record.status_arg
                );
                record.last_print = now;
            }
            record.node_type
        };

        if node_type == NodeType::Server {
            let mut profiles = self.profiles.write().unwrap_or_else(|e| e.into_inner());
            if let Some(profile) = profiles.get_mut(&node_id) {
                if !profile.pending_nodes.is_empty() {
                    let drained = std::mem::take(&mut profile.pending_nodes);
                    drop(profiles);
                    self.persist();
                    return Ok(HeartbeatResult { command: Command::ProviderDisconnect, disconnected: drained });
                }
            }
        } else if node_type == NodeType::Provider {
            let mut migrations = self.migrations.write().unwrap_or_else(|e| e.into_inner());
            if migrations.remove(&node_id).is_some() {
                return Ok(HeartbeatResult { command: Command::ServerChange, disconnected: Vec::new() });
            }
        }

        Ok(HeartbeatResult { command: Command::None, disconnected: Vec::new() })
    }

    pub fn unregister(&self, node_id: i32, secret: u64) -> Result<(), FabricError> {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        let Some(record) = nodes.get(&node_id) else { return Err(FabricError::UnknownNode) };
        if record.secret != secret {
            return Err(FabricError::SecretMismatch);
        }
        let node_type = record.node_type;
        nodes.remove(&node_id);
        drop(nodes);
        if node_type == NodeType::Server {
            self.profiles.write().unwrap_or_else(|e| e.into_inner()).remove(&node_id);
        }
        self.persist();
        Ok(())
    }

    // -- Query / Control ----------------------------------------------------

    pub fn query_nodes(&self, filter: Option<NodeType>) -> Vec<NodeRecord> {
        self.nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|r| match filter {
                None => true,
                Some(f) => r.node_type == f,
            })
            .cloned()
            .collect()
    }

    pub fn control_switch_server(&self, order: SwitchServerOrder) {
        self.migrations.write().unwrap_or_else(|e| e.into_inner()).insert(order.provider_id, order);
    }

    // -- Liveness -----------------------------------------------------------

    /// Evicts records whose `lastAlive` is stale, removes them from any
    /// broker profile, and enqueues them into every *other* broker
    /// profile's `pendingNodes` so the broker can close their channels on
    /// its next heartbeat. Returns the evicted ids.
    pub fn sweep_liveness(&self) -> Vec<i32> {
        let now = now_unix_ms();
        let dead: Vec<i32> = {
            let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
            nodes.values().filter(|r| !r.is_live(now, MAX_MISSES)).map(|r| r.node_id).collect()
        };
        if dead.is_empty() {
            return dead;
        }

        {
            let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
            for id in &dead {
                nodes.remove(id);
            }
        }
        {
            let mut profiles = self.profiles.write().unwrap_or_else(|e| e.into_inner());
            for profile in profiles.values_mut() {
                for id in &dead {
                    if !profile.pending_nodes.contains(id) {
                        profile.pending_nodes.push(*id);
                    }
                }
            }
        }
        self.persist();
        info!("liveness sweep evicted {} node(s): {dead:?}", dead.len());
        dead
    }
}

fn write_pretty_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(file, value)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_info(name: &str) -> RegisterInfo {
        RegisterInfo {
            node_name: name.to_string(),
            node_type: NodeType::Provider,
            addr: String::new(),
            pbase_version: "0.1.9".into(),
            bin_version: "test".into(),
            channel_types: vec![3],
            keepalive_interval: 10,
            with_node_id: None,
            gw_info: None,
        }
    }

    fn broker_info(name: &str, addr: &str) -> RegisterInfo {
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

    #[test]
    fn broker_ids_stay_in_reserved_range() {
        let dir = tempdir();
        let registry = NodeRegistry::new(&dir);
        let a = registry.register(broker_info("b1", "127.0.0.1:1001")).unwrap();
        let b = registry.register(broker_info("b2", "127.0.0.1:1002")).unwrap();
        assert!((0..MAX_SERVER_ID).contains(&a.node_id));
        assert!((0..MAX_SERVER_ID).contains(&b.node_id));
        assert_ne!(a.node_id, b.node_id);
    }

    #[test]
    fn provider_ids_stay_outside_reserved_range() {
        let dir = tempdir();
        let registry = NodeRegistry::new(&dir);
        let r = registry.register(provider_info("p1")).unwrap();
        assert!((MAX_SERVER_ID..MAX_NODE_NUM).contains(&r.node_id));
    }

    #[test]
    fn register_unregister_register_yields_new_secret() {
        let dir = tempdir();
        let registry = NodeRegistry::new(&dir);
        let first = registry.register(provider_info("p1")).unwrap();
        registry.unregister(first.node_id, first.secret).unwrap();
        let second = registry.register(provider_info("p1")).unwrap();
        assert_ne!(first.secret, second.secret);
    }

    #[test]
    fn heartbeat_for_unknown_node_requests_reconnect() {
        let dir = tempdir();
        let registry = NodeRegistry::new(&dir);
        let result = registry.heartbeat(999, 0, 0, String::new()).unwrap();
        assert_eq!(result.command, Command::Reconnect);
    }

    #[test]
    fn heartbeat_with_bad_secret_is_rejected() {
        let dir = tempdir();
        let registry = NodeRegistry::new(&dir);
        let r = registry.register(provider_info("p1")).unwrap();
        let err = registry.heartbeat(r.node_id, r.secret.wrapping_add(1), 0, String::new()).unwrap_err();
        assert_eq!(err, FabricError::SecretMismatch);
    }

    #[test]
    fn switch_server_surfaces_on_next_heartbeat() {
        let dir = tempdir();
        let registry = NodeRegistry::new(&dir);
        let broker = registry.register(broker_info("b0", "127.0.0.1:2000")).unwrap();
        let provider = registry.register(provider_info("p100")).unwrap();
        registry.control_switch_server(SwitchServerOrder { provider_id: provider.node_id, target_broker_id: broker.node_id });
        let result = registry.heartbeat(provider.node_id, provider.secret, 1, String::new()).unwrap();
        assert_eq!(result.command, Command::ServerChange);
        // consumed on read
        let result2 = registry.heartbeat(provider.node_id, provider.secret, 2, String::new()).unwrap();
        assert_eq!(result2.command, Command::None);
    }

    #[test]
    fn query_nodes_filters_by_type() {
        let dir = tempdir();
        let registry = NodeRegistry::new(&dir);
        registry.register(broker_info("b0", "127.0.0.1:2000")).unwrap();
        registry.register(provider_info("p1")).unwrap();
        let servers = registry.query_nodes(Some(NodeType::Server));
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].node_type, NodeType::Server);
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("synerex-registry-test-{}", rand::random::<u64>()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
