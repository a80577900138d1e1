//! gRPC service implementations wiring the core components to the
//! generated `tonic` server traits.

pub mod control_service;
pub mod convert;
pub mod fabric_service;
pub mod node_service;

pub use control_service::ControlService;
pub use fabric_service::FabricService;
pub use node_service::NodeService;
