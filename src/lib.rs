//! Federated publish/subscribe message-exchange fabric: broker routing,
//! directory/liveness, and gateway bridging.

pub mod config;
pub mod error;
pub mod id;
pub mod message_store;
pub mod model;
pub mod registry;
pub mod router;
pub mod subscriber_table;

pub mod client;
pub mod rpc;

/// Generated gRPC types and service traits, nested to match the `.proto`
/// package layout (`synerex.node`, `synerex.fabric`, `synerex.control`) so
/// prost's cross-file references resolve without extra path config.
pub mod synerex {
    pub mod node {
        tonic::include_proto!("synerex.node");
    }
    pub mod fabric {
        tonic::include_proto!("synerex.fabric");
    }
    pub mod control {
        tonic::include_proto!("synerex.control");
    }
}
