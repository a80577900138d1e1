//! `NodeControl` service: operator-facing `QueryNodeInfos`/`ControlNodes`,
//! used by the `synctl` CLI.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::registry::NodeRegistry;
use crate::rpc::convert;
use crate::synerex::control;

pub struct ControlService {
    registry: Arc<NodeRegistry>,
}

impl ControlService {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self { registry }
    }
}

#[tonic::async_trait]
impl control::node_control_server::NodeControl for ControlService {
    async fn query_node_infos(
        &self,
        request: Request<control::NodeControlFilter>,
    ) -> Result<Response<control::NodeControlInfos>, Status> {
        let filter = convert::control_filter_to_node_type(request.into_inner());
        let infos = self.registry.query_nodes(filter).iter().map(convert::node_record_to_control_info).collect();
        Ok(Response::new(control::NodeControlInfos { infos }))
    }

    async fn control_nodes(&self, request: Request<control::Order>) -> Result<Response<control::NodeControlResponse>, Status> {
        let order = request.into_inner();
        match convert::order_to_switch_server(order) {
            Some(switch) => {
                self.registry.control_switch_server(switch);
                Ok(Response::new(control::NodeControlResponse { ok: true, err: String::new() }))
            }
            None => Ok(Response::new(control::NodeControlResponse { ok: false, err: "unsupported order".into() })),
        }
    }
}
