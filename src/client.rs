//! `ProviderClientLib`: the counterpart linked into every provider (and,
//! for registering with the directory, into the broker and gateway
//! binaries too).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use sysinfo::System;
use tonic::transport::Channel;
use tonic::Request;

use crate::model::NodeType;
use crate::synerex::fabric::fabric_client::FabricClient;
use crate::synerex::node::node_client::NodeClient;
use crate::synerex::node::{self, KeepaliveCommand, NodeInfo, NodeUpdate, ServerStatus};

/// Fixed reconnect backoff for stream readers and heartbeat send failures,
/// matching the original's `RECONNECT_WAIT`.
pub const RECONNECT_WAIT: Duration = Duration::from_secs(5);

/// How long a `Locked` node state is held before being force-reset,
/// matching the original's `WAIT_TIME` ticker in `startKeepAliveWithCmd`.
pub const SERVER_CHANGE_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Tracks outstanding proposals so `SERVER_CHANGE` can tell whether it is
/// safe to drop the broker connection immediately.
#[derive(Default)]
pub struct NodeState {
    proposed_supply: Mutex<HashSet<u64>>,
    proposed_demand: Mutex<HashSet<u64>>,
    locked: AtomicBool,
}

impl NodeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_proposed_supply(&self, id: u64) {
        self.proposed_supply.lock().unwrap_or_else(|e| e.into_inner()).insert(id);
    }

    pub fn add_proposed_demand(&self, id: u64) {
        self.proposed_demand.lock().unwrap_or_else(|e| e.into_inner()).insert(id);
    }

    /// Removes the entry keyed by a confirmed proposal id, called once a
    /// matching `Confirm` has been observed.
    pub fn resolve(&self, id: u64) {
        self.proposed_supply.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
        self.proposed_demand.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
    }

    /// Safe to comply with `SERVER_CHANGE` iff both lists are empty.
    pub fn is_safe_state(&self) -> bool {
        self.proposed_supply.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
            && self.proposed_demand.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }

    pub fn lock_state(&self) {
        self.locked.store(true, Ordering::SeqCst);
    }

    pub fn force_reset(&self) {
        self.proposed_supply.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.proposed_demand.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.locked.store(false, Ordering::SeqCst);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }
}

/// Caller-supplied reactions to directory-driven keepalive commands.
pub trait ClientCallbacks: Send + Sync + 'static {
    /// `RECONNECT`: re-registration has already happened by the time this
    /// fires, possibly under a new node id; the callback is for the
    /// caller's own bookkeeping (e.g. re-seeding a dependent id
    /// generator).
    fn on_reconnect(&self, new_node_id: i32) {
        let _ = new_node_id;
    }
    /// `SERVER_CHANGE`, once safe: the caller should connect to
    /// `new_broker_addr` and re-open its subscriptions.
    fn on_server_change(&self, new_broker_addr: &str) {
        let _ = new_broker_addr;
    }
    /// `PROVIDER_DISCONNECT` (broker clients only): the directory reports
    /// these provider ids as dead; the broker should close their channels.
    fn on_provider_disconnect(&self, node_ids: &[i32]) {
        let _ = node_ids;
    }
}

pub struct NoopCallbacks;
impl ClientCallbacks for NoopCallbacks {}

pub struct RegistrationInfo {
    pub node_name: String,
    pub node_type: NodeType,
    pub server_info: String,
    pub channel_types: Vec<u32>,
    pub gw_info: String,
    pub pbase_version: String,
    pub bin_version: String,
}

impl<C: ClientCallbacks> std::fmt::Debug for ProviderClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderClient")
            .field("directory_addr", &self.directory_addr)
            .field("node_id", &self.node_id())
            .field("broker_addr", &self.broker_addr())
            .finish_non_exhaustive()
    }
}

pub struct ProviderClient<C: ClientCallbacks = NoopCallbacks> {
    directory_addr: String,
    info: RegistrationInfo,
    callbacks: Arc<C>,

    node_id: AtomicI32,
    secret: AtomicU64,
    keepalive_interval: AtomicI32,
    broker_addr: RwLock<String>,
    update_count: AtomicI64,

    pub state: Arc<NodeState>,
    system: Mutex<System>,
}

impl<C: ClientCallbacks> ProviderClient<C> {
    pub fn new(directory_addr: String, info: RegistrationInfo, callbacks: Arc<C>) -> Self {
        Self {
            directory_addr,
            info,
            callbacks,
            node_id: AtomicI32::new(-1),
            secret: AtomicU64::new(0),
            keepalive_interval: AtomicI32::new(0),
            broker_addr: RwLock::new(String::new()),
            update_count: AtomicI64::new(0),
            state: Arc::new(NodeState::new()),
            system: Mutex::new(System::new()),
        }
    }

    pub fn node_id(&self) -> i32 {
        self.node_id.load(Ordering::SeqCst)
    }

    pub fn broker_addr(&self) -> String {
        self.broker_addr.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn node_client(&self) -> anyhow::Result<NodeClient<Channel>> {
        Ok(NodeClient::connect(format!("http://{}", self.directory_addr)).await?)
    }

    pub async fn fabric_client(&self) -> anyhow::Result<FabricClient<Channel>> {
        let addr = self.broker_addr();
        Ok(FabricClient::connect(format!("http://{addr}")).await?)
    }

    /// Registers (or re-registers, preserving the previously assigned id
    /// so a `RECONNECT` round trip is idempotent) and stores the result.
    pub async fn register(&self) -> anyhow::Result<()> {
        let mut client = self.node_client().await?;
        let with_node_id = self.node_id();
        let req = NodeInfo {
            node_name: self.info.node_name.clone(),
            node_type: node::NodeType::from(self.info.node_type) as i32,
            server_info: self.info.server_info.clone(),
            pbase_version: self.info.pbase_version.clone(),
            with_node_id,
            cluster_id: 0,
            area_id: String::new(),
            channel_types: self.info.channel_types.clone(),
            gw_info: self.info.gw_info.clone(),
            bin_version: self.info.bin_version.clone(),
        };
        let resp = client.register(Request::new(req)).await?.into_inner();
        self.node_id.store(resp.node_id, Ordering::SeqCst);
        self.secret.store(resp.secret, Ordering::SeqCst);
        self.keepalive_interval.store(resp.keepalive_duration, Ordering::SeqCst);
        *self.broker_addr.write().unwrap_or_else(|e| e.into_inner()) = resp.server_info;
        info!("registered as node {} (broker {})", resp.node_id, self.broker_addr());
        Ok(())
    }

    pub async fn unregister(&self) -> anyhow::Result<()> {
        let mut client = self.node_client().await?;
        client
            .unregister(Request::new(crate::synerex::node::NodeId {
                node_id: self.node_id(),
                secret: self.secret.load(Ordering::SeqCst),
                server_info: String::new(),
                keepalive_duration: 0,
            }))
            .await?;
        self.keepalive_interval.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn sample_status(&self) -> ServerStatus {
        if self.info.node_type != NodeType::Server {
            return ServerStatus { cpu: 0.0, memory: 0.0, msg_count: 0 };
        }
        let mut sys = self.system.lock().unwrap_or_else(|e| e.into_inner());
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        let cpu = sys.global_cpu_usage() as f64;
        let memory = sys.used_memory() as f64;
        ServerStatus { cpu, memory, msg_count: 0 }
    }

    /// The heartbeat coroutine: sleeps for `keepalive_interval` seconds
    /// (not a fixed-rate ticker) between sends, matching `time.Sleep` in
    /// `startKeepAliveWithCmd`. Returns once the node has been
    /// unregistered (`keepalive_interval` reset to 0) or a transport error
    /// is deemed unrecoverable.
    pub async fn run_heartbeat_loop(self: Arc<Self>) {
        loop {
            let interval = self.keepalive_interval.load(Ordering::SeqCst);
            if interval <= 0 {
                debug!("heartbeat loop exiting: node unregistered");
                return;
            }
            tokio::time::sleep(Duration::from_secs(interval as u64)).await;

            let status = self.sample_status();
            let update_count = self.update_count.fetch_add(1, Ordering::SeqCst) + 1;
            let req = NodeUpdate {
                node_id: self.node_id(),
                secret: self.secret.load(Ordering::SeqCst),
                update_count: update_count as i32,
                node_status: 0,
                node_arg: String::new(),
                status: Some(status),
            };

            let sent = match self.node_client().await {
                Ok(mut client) => client.heartbeat(Request::new(req)).await,
                Err(e) => {
                    warn!("heartbeat: directory unreachable: {e}");
                    tokio::time::sleep(RECONNECT_WAIT).await;
                    continue;
                }
            };

            match sent {
                Ok(resp) => Self::handle_command(Arc::clone(&self), resp.into_inner()).await,
                Err(e) => {
                    warn!("heartbeat rpc failed: {e}");
                    tokio::time::sleep(RECONNECT_WAIT).await;
                }
            }
        }
    }

    async fn handle_command(this: Arc<Self>, resp: crate::synerex::node::Response) {
        let command = KeepaliveCommand::try_from(resp.command).unwrap_or(KeepaliveCommand::None);
        match command {
            KeepaliveCommand::None => {}
            KeepaliveCommand::Reconnect => {
                info!("directory requested RECONNECT");
                if let Err(e) = this.register().await {
                    warn!("re-registration after RECONNECT failed: {e}");
                    return;
                }
                this.callbacks.on_reconnect(this.node_id());
            }
            KeepaliveCommand::ServerChange => {
                if this.state.is_safe_state() {
                    Self::complete_server_change(Arc::clone(&this)).await;
                } else {
                    info!("SERVER_CHANGE deferred: outstanding proposals present, locking state");
                    this.state.lock_state();
                    let locked_handle = Arc::clone(&this);
                    tokio::spawn(async move {
                        tokio::time::sleep(SERVER_CHANGE_LOCK_TIMEOUT).await;
                        if locked_handle.state.is_locked() {
                            warn!("SERVER_CHANGE lock timed out, forcing reset");
                            locked_handle.state.force_reset();
                            Self::complete_server_change(locked_handle).await;
                        }
                    });
                }
            }
            KeepaliveCommand::ProviderDisconnect => {
                if this.info.node_type == NodeType::Server {
                    let ids: Vec<i32> = serde_json::from_str(&resp.err).unwrap_or_default();
                    this.callbacks.on_provider_disconnect(&ids);
                } else {
                    warn!("PROVIDER_DISCONNECT received by a non-broker client, ignoring");
                }
            }
        }
    }

    async fn complete_server_change(this: Arc<Self>) {
        if let Err(e) = this.unregister().await {
            warn!("unregister before SERVER_CHANGE failed: {e}");
        }
        this.state.force_reset();
        if let Err(e) = this.register().await {
            warn!("re-registration after SERVER_CHANGE failed: {e}");
            return;
        }
        this.callbacks.on_server_change(&this.broker_addr());
    }

    /// While `Locked`, inbound subscription callbacks are suppressed;
    /// providers should not react mid-handoff.
    pub fn should_deliver(&self) -> bool {
        !self.state.is_locked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_state_holds_only_when_both_lists_empty() {
        let state = NodeState::new();
        assert!(state.is_safe_state());
        state.add_proposed_supply(1);
        assert!(!state.is_safe_state());
        state.resolve(1);
        assert!(state.is_safe_state());
    }

    #[test]
    fn force_reset_clears_lock_and_proposals() {
        let state = NodeState::new();
        state.add_proposed_demand(7);
        state.lock_state();
        assert!(state.is_locked());
        state.force_reset();
        assert!(!state.is_locked());
        assert!(state.is_safe_state());
    }
}
