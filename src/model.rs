//! Data model shared by the directory and the broker.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Channel type zero is reserved/invalid; types run `[1, CHANNEL_TYPE_MAX)`.
pub const CHANNEL_TYPE_MAX: u32 = 20;

/// Version string reported by every node, carried over from the original
/// `synerex_proto.ChannelTypeVersion`.
pub const FABRIC_VERSION: &str = "0.1.9";

pub const RIDE_SHARE: u32 = 1;
pub const AD: u32 = 2;
pub const LIB: u32 = 3;
pub const PT: u32 = 4;
pub const ROUTING: u32 = 5;
pub const MARKETING: u32 = 6;
pub const FLUENTD: u32 = 7;
pub const MEETING: u32 = 8;
pub const STORAGE: u32 = 9;
pub const RETRIEVAL: u32 = 10;
pub const PEOPLE_COUNTER: u32 = 11;
pub const AREA_COUNTER: u32 = 12;
pub const PEOPLE_AGENT: u32 = 13;
pub const GEOGRAPHIC: u32 = 14;
pub const JSON_DATA: u32 = 15;
pub const MQTT_GATEWAY: u32 = 16;
pub const WAREHOUSE: u32 = 17;

/// `[0, MAX_SERVER_ID)` is reserved for brokers.
pub const MAX_SERVER_ID: i32 = 10;
/// `[0, MAX_NODE_NUM)` bounds every node id.
pub const MAX_NODE_NUM: i32 = 1024;

pub fn channel_type_in_range(channel_type: u32) -> bool {
    channel_type > 0 && channel_type < CHANNEL_TYPE_MAX
}

pub fn now_unix_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    Provider,
    Server,
    Gateway,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: i32,
    pub node_name: String,
    pub node_type: NodeType,
    pub addr: String,
    pub pbase_version: String,
    pub bin_version: String,
    pub channel_types: Vec<u32>,
    /// Unix millis of the last accepted heartbeat/registration.
    pub last_alive: i64,
    pub keepalive_interval: i32,
    pub status_counter: i32,
    pub status_arg: String,
    pub secret: u64,
    /// Unix millis of the last `--verbose` listing line printed for this
    /// node; `0` means never printed.
    #[serde(default)]
    pub last_print: i64,
}

impl NodeRecord {
    pub fn is_live(&self, now_ms: i64, max_misses: i32) -> bool {
        let budget_ms = i64::from(self.keepalive_interval) * i64::from(max_misses) * 1000;
        now_ms - self.last_alive <= budget_ms
    }

    /// Whether a heartbeat at `now_ms` has crossed half the keepalive
    /// window since the last `--verbose` listing line.
    pub fn due_for_verbose_print(&self, now_ms: i64) -> bool {
        let half_window_ms = i64::from(self.keepalive_interval) * 1000 / 2;
        now_ms - self.last_print >= half_window_ms.max(1)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerProfile {
    pub node_id: i32,
    pub server_info: String,
    pub channel_types: Vec<u32>,
    pub cluster_id: i32,
    pub area_id: String,
    pub node_name: String,
    pub pending_nodes: Vec<i32>,
}

#[derive(Debug, Clone, Copy)]
pub struct MigrationRequest {
    pub provider_id: i32,
    pub target_broker_id: i32,
}

#[derive(Debug, Clone, Default)]
pub struct Content {
    pub value: Vec<u8>,
}

/// Supply and Demand are wire-identical except for their name, so they
/// share this shape; the distinction is the channel semantics, not the
/// struct layout (the original `.proto` also defines them identically).
#[derive(Debug, Clone, Default)]
pub struct SupplyOrDemand {
    pub id: u64,
    pub sender_id: u64,
    pub target_id: u64,
    pub channel_type: u32,
    pub name: String,
    pub ts: i64,
    pub arg_json: String,
    pub content: Content,
    pub mbus_id: u64,
}

pub type Supply = SupplyOrDemand;
pub type Demand = SupplyOrDemand;

#[derive(Debug, Clone, Default)]
pub struct Target {
    pub id: u64,
    pub sender_id: u64,
    pub target_id: u64,
    pub channel_type: u32,
    pub mbus_id: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MbusMsg {
    pub msg_id: u64,
    pub sender_id: u64,
    pub target_id: u64,
    pub mbus_id: u64,
    pub payload: Vec<u8>,
    pub msg_type: u32,
}

impl MbusMsg {
    /// `msg_id = 0` is the sentinel used to signal a graceful Mbus close.
    pub fn is_close_sentinel(&self) -> bool {
        self.msg_id == 0
    }

    pub fn close_sentinel() -> Self {
        Self { msg_id: 0, ..Default::default() }
    }
}

/// A tagged union over the message kinds that cross a gateway hop. Only
/// the two arms the router actually dispatches are modeled; selection
/// across a gateway hop is not implemented, so `Target`/`Mbus`/`MbusMsg`
/// never need to cross this boundary.
#[derive(Debug, Clone)]
pub enum GatewayMsg {
    Demand { src_broker_id: i32, demand: Demand },
    Supply { src_broker_id: i32, supply: Supply },
}
