//! `Fabric` service: `Notify*`/`Propose*`/`Select*`/`Confirm`/`Subscribe*`/
//! `Close*`/Mbus/gateway.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status};

use crate::message_store::MessageRecord;
use crate::router::Router;
use crate::rpc::convert;
use crate::synerex::fabric;

pub struct FabricService {
    router: Arc<Router>,
}

impl FabricService {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    /// Records a call into `MessageStore` before dispatch, so Select can
    /// later resolve this message's id back to its sender.
    fn record(&self, msg_type: &'static str, channel_type: u32, id: u64, src: u64, dst: u64, arg: String) {
        self.router.message_store().add(MessageRecord { msg_type, channel_type, id, src, dst, arg });
    }
}

type DemandStream = Pin<Box<dyn Stream<Item = Result<fabric::Demand, Status>> + Send + 'static>>;
type SupplyStream = Pin<Box<dyn Stream<Item = Result<fabric::Supply, Status>> + Send + 'static>>;
type MbusMsgStream = Pin<Box<dyn Stream<Item = Result<fabric::MbusMsg, Status>> + Send + 'static>>;
type GatewayMsgStream = Pin<Box<dyn Stream<Item = Result<fabric::GatewayMsg, Status>> + Send + 'static>>;

#[tonic::async_trait]
impl fabric::fabric_server::Fabric for FabricService {
    async fn notify_demand(&self, request: Request<fabric::Demand>) -> Result<Response<fabric::Response>, Status> {
        let dm = convert::proto_demand_to_model(request.into_inner());
        self.record("NotifyDemand", dm.channel_type, dm.id, dm.sender_id, dm.target_id, String::new());
        let resp = match self.router.notify_demand(dm) {
            Ok(_) => convert::fabric_ok_response(),
            Err(e) => convert::fabric_error_to_response(&e),
        };
        Ok(Response::new(resp))
    }

    async fn notify_supply(&self, request: Request<fabric::Supply>) -> Result<Response<fabric::Response>, Status> {
        let sp = convert::proto_supply_to_model(request.into_inner());
        self.record("NotifySupply", sp.channel_type, sp.id, sp.sender_id, sp.target_id, String::new());
        let resp = match self.router.notify_supply(sp) {
            Ok(_) => convert::fabric_ok_response(),
            Err(e) => convert::fabric_error_to_response(&e),
        };
        Ok(Response::new(resp))
    }

    async fn propose_demand(&self, request: Request<fabric::Demand>) -> Result<Response<fabric::Response>, Status> {
        let dm = convert::proto_demand_to_model(request.into_inner());
        self.record("ProposeDemand", dm.channel_type, dm.id, dm.sender_id, dm.target_id, String::new());
        let resp = match self.router.propose_demand(dm) {
            Ok(_) => convert::fabric_ok_response(),
            Err(e) => convert::fabric_error_to_response(&e),
        };
        Ok(Response::new(resp))
    }

    async fn propose_supply(&self, request: Request<fabric::Supply>) -> Result<Response<fabric::Response>, Status> {
        let sp = convert::proto_supply_to_model(request.into_inner());
        self.record("ProposeSupply", sp.channel_type, sp.id, sp.sender_id, sp.target_id, String::new());
        let resp = match self.router.propose_supply(sp) {
            Ok(_) => convert::fabric_ok_response(),
            Err(e) => convert::fabric_error_to_response(&e),
        };
        Ok(Response::new(resp))
    }

    type SubscribeDemandStream = DemandStream;

    async fn subscribe_demand(&self, request: Request<fabric::Channel>) -> Result<Response<Self::SubscribeDemandStream>, Status> {
        let ch = request.into_inner();
        let rx = self
            .router
            .subscribe_demand(ch.channel_type, ch.client_id)
            .map_err(|e| Status::already_exists(e.to_string()))?;
        let stream = ReceiverStream::new(rx).map(|d| Ok(convert::model_demand_to_proto(d)));
        Ok(Response::new(Box::pin(stream)))
    }

    type SubscribeSupplyStream = SupplyStream;

    async fn subscribe_supply(&self, request: Request<fabric::Channel>) -> Result<Response<Self::SubscribeSupplyStream>, Status> {
        let ch = request.into_inner();
        let rx = self
            .router
            .subscribe_supply(ch.channel_type, ch.client_id)
            .map_err(|e| Status::already_exists(e.to_string()))?;
        let stream = ReceiverStream::new(rx).map(|s| Ok(convert::model_supply_to_proto(s)));
        Ok(Response::new(Box::pin(stream)))
    }

    async fn select_supply(&self, request: Request<fabric::Target>) -> Result<Response<fabric::ConfirmResponse>, Status> {
        let target = convert::proto_target_to_model(request.into_inner());
        let resp = match self.router.select_supply(target).await {
            Ok(outcome) => fabric::ConfirmResponse { ok: true, err: String::new(), mbus_id: outcome.mbus_id },
            Err(e) => convert::fabric_error_to_confirm_response(&e),
        };
        Ok(Response::new(resp))
    }

    async fn select_demand(&self, request: Request<fabric::Target>) -> Result<Response<fabric::ConfirmResponse>, Status> {
        let target = convert::proto_target_to_model(request.into_inner());
        let resp = match self.router.select_demand(target).await {
            Ok(outcome) => fabric::ConfirmResponse { ok: true, err: String::new(), mbus_id: outcome.mbus_id },
            Err(e) => convert::fabric_error_to_confirm_response(&e),
        };
        Ok(Response::new(resp))
    }

    async fn confirm(&self, request: Request<fabric::Target>) -> Result<Response<fabric::Response>, Status> {
        let target = convert::proto_target_to_model(request.into_inner());
        let resp = match self.router.confirm(target) {
            Ok(()) => convert::fabric_ok_response(),
            Err(e) => convert::fabric_error_to_response(&e),
        };
        Ok(Response::new(resp))
    }

    type SubscribeMbusStream = MbusMsgStream;

    async fn subscribe_mbus(&self, request: Request<fabric::Mbus>) -> Result<Response<Self::SubscribeMbusStream>, Status> {
        let mbus = request.into_inner();
        let rx = self.router.subscribe_mbus(mbus.mbus_id, mbus.client_id).map_err(|e| Status::already_exists(e.to_string()))?;
        let stream = ReceiverStream::new(rx).map(|m| Ok(convert::model_mbus_msg_to_proto(m)));
        Ok(Response::new(Box::pin(stream)))
    }

    async fn send_mbus_msg(&self, request: Request<fabric::MbusMsg>) -> Result<Response<fabric::Response>, Status> {
        let msg = convert::proto_mbus_msg_to_model(request.into_inner());
        let (_, dropped) = self.router.send_mbus_msg(msg);
        let resp = if dropped == 0 {
            convert::fabric_ok_response()
        } else {
            fabric::Response { ok: true, err: format!("dropped for {dropped} subscriber(s)") }
        };
        Ok(Response::new(resp))
    }

    async fn close_mbus(&self, request: Request<fabric::Mbus>) -> Result<Response<fabric::Response>, Status> {
        let mbus = request.into_inner();
        self.router.close_mbus(mbus.mbus_id);
        Ok(Response::new(convert::fabric_ok_response()))
    }

    async fn create_mbus(&self, _request: Request<fabric::MbusOpt>) -> Result<Response<fabric::Mbus>, Status> {
        let mbus_id = self.router.create_mbus();
        Ok(Response::new(fabric::Mbus { client_id: 0, mbus_id }))
    }

    async fn get_mbus_state(&self, request: Request<fabric::Mbus>) -> Result<Response<fabric::MbusState>, Status> {
        let mbus = request.into_inner();
        let state = self.router.get_mbus_state(mbus.mbus_id);
        Ok(Response::new(convert::mbus_state_to_proto(mbus.mbus_id, state)))
    }

    async fn close_demand_channel(&self, request: Request<fabric::Channel>) -> Result<Response<fabric::Response>, Status> {
        let ch = request.into_inner();
        let found = self.router.close_demand_channel(ch.channel_type, ch.client_id);
        Ok(Response::new(close_response(found)))
    }

    async fn close_supply_channel(&self, request: Request<fabric::Channel>) -> Result<Response<fabric::Response>, Status> {
        let ch = request.into_inner();
        let found = self.router.close_supply_channel(ch.channel_type, ch.client_id);
        Ok(Response::new(close_response(found)))
    }

    async fn close_all_channels(&self, request: Request<fabric::ProviderId>) -> Result<Response<fabric::Response>, Status> {
        let req = request.into_inner();
        self.router.close_all_channels(req.client_id);
        Ok(Response::new(convert::fabric_ok_response()))
    }

    type SubscribeGatewayStream = GatewayMsgStream;

    async fn subscribe_gateway(&self, request: Request<fabric::GatewayInfo>) -> Result<Response<Self::SubscribeGatewayStream>, Status> {
        let info = request.into_inner();
        let rx = self.router.subscribe_gateway(info.client_id).map_err(|e| Status::already_exists(e.to_string()))?;
        let stream = ReceiverStream::new(rx).map(|m| Ok(convert::model_gateway_msg_to_proto(m)));
        Ok(Response::new(Box::pin(stream)))
    }

    async fn forward_to_gateway(&self, request: Request<fabric::GatewayMsg>) -> Result<Response<fabric::Response>, Status> {
        let msg = convert::proto_gateway_msg_to_model(request.into_inner()).map_err(|e| Status::invalid_argument(e.to_string()))?;
        let resp = match self.router.forward_to_gateway(msg) {
            Ok(_) => convert::fabric_ok_response(),
            Err(e) => convert::fabric_error_to_response(&e),
        };
        Ok(Response::new(resp))
    }
}

fn close_response(found: bool) -> fabric::Response {
    if found {
        fabric::Response { ok: true, err: String::new() }
    } else {
        fabric::Response { ok: false, err: "not found".into() }
    }
}
