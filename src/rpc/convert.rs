//! Plain conversions between the wire (prost-generated) types and the
//! in-process model. Kept separate from the service impls so neither side
//! needs to know about the other's shape.

use crate::error::FabricError;
use crate::model::{Content, Demand, GatewayMsg, MbusMsg, NodeRecord, NodeType, Supply, Target};
use crate::registry::{self, Command, HeartbeatResult, RegisterInfo, RegisterResult};
use crate::router::{MbusState, MbusStatus};
use crate::synerex::{control, fabric, node};

// -- node package -------------------------------------------------------

impl From<node::NodeType> for NodeType {
    fn from(t: node::NodeType) -> Self {
        match t {
            node::NodeType::Provider => NodeType::Provider,
            node::NodeType::Server => NodeType::Server,
            node::NodeType::Gateway => NodeType::Gateway,
        }
    }
}

impl From<NodeType> for node::NodeType {
    fn from(t: NodeType) -> Self {
        match t {
            NodeType::Provider => node::NodeType::Provider,
            NodeType::Server => node::NodeType::Server,
            NodeType::Gateway => node::NodeType::Gateway,
        }
    }
}

impl From<Command> for node::KeepaliveCommand {
    fn from(c: Command) -> Self {
        match c {
            Command::None => node::KeepaliveCommand::None,
            Command::Reconnect => node::KeepaliveCommand::Reconnect,
            Command::ServerChange => node::KeepaliveCommand::ServerChange,
            Command::ProviderDisconnect => node::KeepaliveCommand::ProviderDisconnect,
        }
    }
}

pub fn node_info_to_register_info(info: node::NodeInfo) -> RegisterInfo {
    let node_type = node::NodeType::try_from(info.node_type).unwrap_or(node::NodeType::Provider).into();
    RegisterInfo {
        node_name: info.node_name,
        node_type,
        addr: info.server_info,
        pbase_version: info.pbase_version,
        bin_version: info.bin_version,
        channel_types: info.channel_types,
        keepalive_interval: registry::DEFAULT_DURATION_SECS as i32,
        with_node_id: if info.with_node_id < 0 { None } else { Some(info.with_node_id) },
        gw_info: if info.gw_info.is_empty() { None } else { Some(info.gw_info) },
    }
}

pub fn register_result_to_node_id(result: RegisterResult) -> node::NodeId {
    node::NodeId {
        node_id: result.node_id,
        secret: result.secret,
        server_info: result.broker_address,
        keepalive_duration: result.keepalive_interval,
    }
}

pub fn heartbeat_result_to_response(result: HeartbeatResult) -> node::Response {
    let err = match result.command {
        Command::ProviderDisconnect => serde_json::to_string(&result.disconnected).unwrap_or_default(),
        _ => String::new(),
    };
    node::Response { ok: true, command: node::KeepaliveCommand::from(result.command) as i32, err }
}

pub fn fabric_error_to_node_response(e: &FabricError) -> node::Response {
    node::Response { ok: false, command: node::KeepaliveCommand::None as i32, err: e.wire_message() }
}

pub fn node_record_to_node_info(record: &NodeRecord) -> node::NodeInfo {
    node::NodeInfo {
        node_name: record.node_name.clone(),
        node_type: node::NodeType::from(record.node_type) as i32,
        server_info: record.addr.clone(),
        pbase_version: record.pbase_version.clone(),
        with_node_id: record.node_id,
        cluster_id: 0,
        area_id: String::new(),
        channel_types: record.channel_types.clone(),
        gw_info: String::new(),
        bin_version: record.bin_version.clone(),
    }
}

// -- fabric package -------------------------------------------------------

pub fn proto_content_to_content(c: Option<fabric::Content>) -> Content {
    Content { value: c.map(|c| c.value).unwrap_or_default() }
}

pub fn content_to_proto(c: Content) -> fabric::Content {
    fabric::Content { value: c.value }
}

pub fn proto_demand_to_model(d: fabric::Demand) -> Demand {
    Demand {
        id: d.id,
        sender_id: d.sender_id,
        target_id: d.target_id,
        channel_type: d.channel_type,
        name: d.name,
        ts: d.ts,
        arg_json: d.arg_json,
        content: proto_content_to_content(d.content),
        mbus_id: d.mbus_id,
    }
}

pub fn model_demand_to_proto(d: Demand) -> fabric::Demand {
    fabric::Demand {
        id: d.id,
        sender_id: d.sender_id,
        target_id: d.target_id,
        channel_type: d.channel_type,
        name: d.name,
        ts: d.ts,
        arg_json: d.arg_json,
        content: Some(content_to_proto(d.content)),
        mbus_id: d.mbus_id,
    }
}

pub fn proto_supply_to_model(s: fabric::Supply) -> Supply {
    Supply {
        id: s.id,
        sender_id: s.sender_id,
        target_id: s.target_id,
        channel_type: s.channel_type,
        name: s.name,
        ts: s.ts,
        arg_json: s.arg_json,
        content: proto_content_to_content(s.content),
        mbus_id: s.mbus_id,
    }
}

pub fn model_supply_to_proto(s: Supply) -> fabric::Supply {
    fabric::Supply {
        id: s.id,
        sender_id: s.sender_id,
        target_id: s.target_id,
        channel_type: s.channel_type,
        name: s.name,
        ts: s.ts,
        arg_json: s.arg_json,
        content: Some(content_to_proto(s.content)),
        mbus_id: s.mbus_id,
    }
}

pub fn proto_target_to_model(t: fabric::Target) -> Target {
    Target { id: t.id, sender_id: t.sender_id, target_id: t.target_id, channel_type: t.channel_type, mbus_id: t.mbus_id }
}

pub fn proto_mbus_msg_to_model(m: fabric::MbusMsg) -> MbusMsg {
    MbusMsg { msg_id: m.msg_id, sender_id: m.sender_id, target_id: m.target_id, mbus_id: m.mbus_id, payload: m.payload, msg_type: m.msg_type }
}

pub fn model_mbus_msg_to_proto(m: MbusMsg) -> fabric::MbusMsg {
    fabric::MbusMsg { msg_id: m.msg_id, sender_id: m.sender_id, target_id: m.target_id, mbus_id: m.mbus_id, payload: m.payload, msg_type: m.msg_type }
}

pub fn fabric_ok_response() -> fabric::Response {
    fabric::Response { ok: true, err: String::new() }
}

pub fn fabric_error_to_response(e: &FabricError) -> fabric::Response {
    fabric::Response { ok: false, err: e.wire_message() }
}

pub fn fabric_error_to_confirm_response(e: &FabricError) -> fabric::ConfirmResponse {
    fabric::ConfirmResponse { ok: false, err: e.wire_message(), mbus_id: 0 }
}

pub fn mbus_state_to_proto(mbus_id: u64, state: MbusState) -> fabric::MbusState {
    let status = match state.status {
        MbusStatus::Invalid | MbusStatus::Closed => fabric::MbusStatus::Invalid,
        MbusStatus::Running => fabric::MbusStatus::Active,
    };
    fabric::MbusState { mbus_id, status: status as i32, subscribers: Vec::new() }
}

pub fn proto_gateway_msg_to_model(msg: fabric::GatewayMsg) -> Result<GatewayMsg, FabricError> {
    use fabric::gateway_msg::MsgOneof;
    match msg.msg_oneof {
        Some(MsgOneof::Demand(d)) => {
            Ok(GatewayMsg::Demand { src_broker_id: msg.src_broker_id, demand: proto_demand_to_model(d) })
        }
        Some(MsgOneof::Supply(s)) => {
            Ok(GatewayMsg::Supply { src_broker_id: msg.src_broker_id, supply: proto_supply_to_model(s) })
        }
        None => Err(FabricError::MessageDrop("empty GatewayMsg".into())),
    }
}

pub fn model_gateway_msg_to_proto(msg: GatewayMsg) -> fabric::GatewayMsg {
    use fabric::gateway_msg::MsgOneof;
    match msg {
        GatewayMsg::Demand { src_broker_id, demand } => fabric::GatewayMsg {
            src_broker_id,
            msg_type: fabric::MsgType::Demand as i32,
            msg_oneof: Some(MsgOneof::Demand(model_demand_to_proto(demand))),
        },
        GatewayMsg::Supply { src_broker_id, supply } => fabric::GatewayMsg {
            src_broker_id,
            msg_type: fabric::MsgType::Supply as i32,
            msg_oneof: Some(MsgOneof::Supply(model_supply_to_proto(supply))),
        },
    }
}

// -- control package -------------------------------------------------------

pub fn control_filter_to_node_type(filter: control::NodeControlFilter) -> Option<NodeType> {
    node::NodeType::try_from(filter.node_type).ok().map(NodeType::from)
}

pub fn node_record_to_control_info(record: &NodeRecord) -> control::NodeControlInfo {
    control::NodeControlInfo {
        node_info: Some(node_record_to_node_info(record)),
        node_id: record.node_id,
        server_id: 0,
        last_alive_unix_ms: record.last_alive,
        count: record.status_counter,
    }
}

pub fn order_to_switch_server(order: control::Order) -> Option<registry::SwitchServerOrder> {
    if order.order_type != control::OrderType::SwitchServer as i32 {
        return None;
    }
    order.switch_info.map(|info| registry::SwitchServerOrder { provider_id: order.target_node_id, target_broker_id: info.target_broker_id })
}
