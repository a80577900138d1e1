//! `Node` service: registration, heartbeat, unregister, single-node query.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::registry::NodeRegistry;
use crate::rpc::convert;
use crate::synerex::node;

pub struct NodeService {
    registry: Arc<NodeRegistry>,
    verbose: bool,
}

impl NodeService {
    pub fn new(registry: Arc<NodeRegistry>, verbose: bool) -> Self {
        Self { registry, verbose }
    }
}

#[tonic::async_trait]
impl node::node_server::Node for NodeService {
    async fn register(&self, request: Request<node::NodeInfo>) -> Result<Response<node::NodeId>, Status> {
        let info = convert::node_info_to_register_info(request.into_inner());
        let result = self.registry.register(info).map_err(|e| Status::resource_exhausted(e.to_string()))?;
        Ok(Response::new(convert::register_result_to_node_id(result)))
    }

    async fn heartbeat(&self, request: Request<node::NodeUpdate>) -> Result<Response<node::Response>, Status> {
        let update = request.into_inner();
        let result = if self.verbose {
            self.registry.heartbeat_verbose(update.node_id, update.secret, update.node_status, update.node_arg)
        } else {
            self.registry.heartbeat(update.node_id, update.secret, update.node_status, update.node_arg)
        };
        let response = match result {
            Ok(result) => convert::heartbeat_result_to_response(result),
            Err(e) => convert::fabric_error_to_node_response(&e),
        };
        Ok(Response::new(response))
    }

    async fn unregister(&self, request: Request<node::NodeId>) -> Result<Response<node::Response>, Status> {
        let req = request.into_inner();
        let response = match self.registry.unregister(req.node_id, req.secret) {
            Ok(()) => node::Response { ok: true, command: node::KeepaliveCommand::None as i32, err: String::new() },
            Err(e) => convert::fabric_error_to_node_response(&e),
        };
        Ok(Response::new(response))
    }

    async fn query_node(&self, request: Request<node::NodeId>) -> Result<Response<node::NodeInfo>, Status> {
        let node_id = request.into_inner().node_id;
        let records = self.registry.query_nodes(None);
        let record = records
            .into_iter()
            .find(|r| r.node_id == node_id)
            .ok_or_else(|| Status::not_found(format!("no such node {node_id}")))?;
        Ok(Response::new(convert::node_record_to_node_info(&record)))
    }
}
