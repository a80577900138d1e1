//! Router: `Notify*`/`Propose*`/`Select*`/`Confirm`/`Subscribe*`/`Close*`,
//! the Mbus lifecycle, and gateway bridging.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::error::FabricError;
use crate::id::IdAllocator;
use crate::message_store::MessageStore;
use crate::model::{channel_type_in_range, Demand, GatewayMsg, MbusMsg, Supply, Target};
use crate::subscriber_table::{Receiver, SubscriberTable};

/// How long `SelectSupply`/`SelectDemand` parks the caller waiting for the
/// producer's `Confirm`.
const SELECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbusStatus {
    Invalid,
    Running,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct MbusState {
    pub status: MbusStatus,
    pub subscriber_count: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NotifyOutcome {
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct SelectOutcome {
    pub mbus_id: u64,
}

/// One lock guards the whole table: select/confirm is rare enough next
/// to fan-out traffic that a single mutex here is not a bottleneck.
#[derive(Debug)]
struct WaitConfirmTable {
    slots: Mutex<HashMap<(u32, u64), oneshot::Sender<Target>>>,
}

impl WaitConfirmTable {
    fn new() -> Self {
        Self { slots: Mutex::new(HashMap::new()) }
    }

    fn insert(&self, channel_type: u32, corr_id: u64) -> oneshot::Receiver<Target> {
        let (tx, rx) = oneshot::channel();
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).insert((channel_type, corr_id), tx);
        rx
    }

    fn remove(&self, channel_type: u32, corr_id: u64) -> Option<oneshot::Sender<Target>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).remove(&(channel_type, corr_id))
    }
}

#[derive(Debug)]
pub struct Router {
    broker_id: i32,
    subscribers: SubscriberTable,
    message_store: MessageStore,
    id_alloc: IdAllocator,
    wait_confirm: WaitConfirmTable,
}

impl Router {
    pub fn new(broker_id: i32) -> Self {
        Self {
            broker_id,
            subscribers: SubscriberTable::new(),
            message_store: MessageStore::new(),
            id_alloc: IdAllocator::new(broker_id),
            wait_confirm: WaitConfirmTable::new(),
        }
    }

    pub fn subscribers(&self) -> &SubscriberTable {
        &self.subscribers
    }

    pub fn message_store(&self) -> &MessageStore {
        &self.message_store
    }

    pub fn next_id(&self) -> u64 {
        self.id_alloc.next()
    }

    /// Re-seeds the id generator's node field after the broker's own
    /// directory registration is renewed under a different node id (a
    /// `RECONNECT` round trip). In-flight ids already generated are
    /// unaffected.
    pub fn reseed_id_allocator(&self, node_id: i32) {
        self.id_alloc.reseed(node_id);
    }

    fn check_channel_type(channel_type: u32) -> Result<(), FabricError> {
        if channel_type_in_range(channel_type) {
            Ok(())
        } else {
            Err(FabricError::ChannelTypeError)
        }
    }

    // -- Notify / Propose ---------------------------------------------

    pub fn notify_demand(&self, dm: Demand) -> Result<NotifyOutcome, FabricError> {
        Self::check_channel_type(dm.channel_type)?;
        self.notify_demand_internal(dm, false)
    }

    pub fn notify_supply(&self, sp: Supply) -> Result<NotifyOutcome, FabricError> {
        Self::check_channel_type(sp.channel_type)?;
        self.notify_supply_internal(sp, false)
    }

    /// `Propose*` performs the same broker-side fanout as `Notify*`; the
    /// producer-side proposal bookkeeping lives entirely in the provider
    /// client library, not here.
    pub fn propose_demand(&self, dm: Demand) -> Result<NotifyOutcome, FabricError> {
        self.notify_demand(dm)
    }

    pub fn propose_supply(&self, sp: Supply) -> Result<NotifyOutcome, FabricError> {
        self.notify_supply(sp)
    }

    fn notify_demand_internal(&self, dm: Demand, exclude_gateway: bool) -> Result<NotifyOutcome, FabricError> {
        let dropped = self.subscribers.fanout_demand(dm.channel_type, &dm);
        if !exclude_gateway {
            self.bridge_to_gateways(GatewayMsg::Demand { src_broker_id: self.broker_id, demand: dm });
        }
        Ok(NotifyOutcome { dropped })
    }

    fn notify_supply_internal(&self, sp: Supply, exclude_gateway: bool) -> Result<NotifyOutcome, FabricError> {
        let dropped = self.subscribers.fanout_supply(sp.channel_type, &sp);
        if !exclude_gateway {
            self.bridge_to_gateways(GatewayMsg::Supply { src_broker_id: self.broker_id, supply: sp });
        }
        Ok(NotifyOutcome { dropped })
    }

    fn bridge_to_gateways(&self, msg: GatewayMsg) {
        for (peer_id, tx) in self.subscribers.gateway_peers() {
            if let Err(e) = tx.try_send(msg.clone()) {
                warn!("gateway bridge drop: peer {peer_id}: {e}");
            }
        }
    }

    // -- Subscribe ------------------------------------------------------

    pub fn subscribe_demand(&self, channel_type: u32, client_id: u64) -> Result<Receiver<Demand>, FabricError> {
        Self::check_channel_type(channel_type)?;
        self.subscribers.add_demand(channel_type, client_id)
    }

    pub fn subscribe_supply(&self, channel_type: u32, client_id: u64) -> Result<Receiver<Supply>, FabricError> {
        Self::check_channel_type(channel_type)?;
        self.subscribers.add_supply(channel_type, client_id)
    }

    pub fn subscribe_gateway(&self, client_id: u64) -> Result<Receiver<GatewayMsg>, FabricError> {
        self.subscribers.add_gateway(client_id)
    }

    // -- Select / Confirm ------------------------------------------------

    pub async fn select_supply(&self, target: Target) -> Result<SelectOutcome, FabricError> {
        self.select(target, true).await
    }

    pub async fn select_demand(&self, target: Target) -> Result<SelectOutcome, FabricError> {
        self.select(target, false).await
    }

    /// `against_demand_producer = true` for `SelectSupply` (resolves the
    /// original *supply* message's sender and routes a synthetic Demand to
    /// it); `false` for `SelectDemand`, the exact mirror against the
    /// *demand* map, resolving a synthetic Supply instead.
    async fn select(&self, target: Target, against_demand_producer: bool) -> Result<SelectOutcome, FabricError> {
        Self::check_channel_type(target.channel_type)?;

        let producer_id = self.message_store.lookup_sender(target.target_id);
        if producer_id == 0 {
            return Err(FabricError::NoProducer);
        }

        let corr_id = self.id_alloc.next();
        let rx = self.wait_confirm.insert(target.channel_type, corr_id);

        if against_demand_producer {
            let Some(tx) = self.subscribers.demand_sender(target.channel_type, producer_id) else {
                self.wait_confirm.remove(target.channel_type, corr_id);
                return Err(FabricError::NoProducer);
            };
            let synthetic = Demand {
                id: corr_id,
                sender_id: target.sender_id,
                target_id: target.target_id,
                channel_type: target.channel_type,
                mbus_id: corr_id,
                ..Default::default()
            };
            if tx.try_send(synthetic).is_err() {
                self.wait_confirm.remove(target.channel_type, corr_id);
                return Err(FabricError::MessageDrop(format!("producer {producer_id} queue full")));
            }
        } else {
            let Some(tx) = self.subscribers.supply_sender(target.channel_type, producer_id) else {
                self.wait_confirm.remove(target.channel_type, corr_id);
                return Err(FabricError::NoProducer);
            };
            let synthetic = Supply {
                id: corr_id,
                sender_id: target.sender_id,
                target_id: target.target_id,
                channel_type: target.channel_type,
                mbus_id: corr_id,
                ..Default::default()
            };
            if tx.try_send(synthetic).is_err() {
                self.wait_confirm.remove(target.channel_type, corr_id);
                return Err(FabricError::MessageDrop(format!("producer {producer_id} queue full")));
            }
        }

        match timeout(SELECT_TIMEOUT, rx).await {
            Ok(Ok(confirmed)) => {
                debug!("select {corr_id} confirmed by {}", confirmed.sender_id);
                Ok(SelectOutcome { mbus_id: if confirmed.mbus_id == corr_id { corr_id } else { 0 } })
            }
            Ok(Err(_)) => {
                // sender dropped without sending: treated like a timeout.
                self.wait_confirm.remove(target.channel_type, corr_id);
                Err(FabricError::Timeout)
            }
            Err(_) => {
                self.wait_confirm.remove(target.channel_type, corr_id);
                Err(FabricError::Timeout)
            }
        }
    }

    pub fn confirm(&self, target: Target) -> Result<(), FabricError> {
        let Some(tx) = self.wait_confirm.remove(target.channel_type, target.target_id) else {
            return Err(FabricError::TargetNotFound { target_id: target.target_id, channel_type: target.channel_type });
        };
        let _ = tx.send(target);
        Ok(())
    }

    // -- Mbus -------------------------------------------------------------

    pub fn create_mbus(&self) -> u64 {
        self.id_alloc.next()
    }

    pub fn subscribe_mbus(&self, mbus_id: u64, client_id: u64) -> Result<Receiver<MbusMsg>, FabricError> {
        self.subscribers.add_mbus(mbus_id, client_id)
    }

    /// The selector and producer are each expected to have called
    /// `SubscribeMbus` before sending on it, so a message simply fans out
    /// to however many subscribers are present. Zero recipients is a
    /// drop, not an error, matching the best-effort delivery policy used
    /// everywhere else in fan-out.
    pub fn send_mbus_msg(&self, msg: MbusMsg) -> (usize, usize) {
        self.subscribers.fanout_mbus(msg.mbus_id, &msg)
    }

    pub fn close_mbus(&self, mbus_id: u64) {
        let sentinel = MbusMsg { mbus_id, ..MbusMsg::close_sentinel() };
        self.subscribers.fanout_mbus(mbus_id, &sentinel);
    }

    pub fn get_mbus_state(&self, mbus_id: u64) -> MbusState {
        let count = self.subscribers.mbus_subscriber_count(mbus_id);
        MbusState { status: if count > 0 { MbusStatus::Running } else { MbusStatus::Invalid }, subscriber_count: count }
    }

    // -- Close --------------------------------------------------------

    pub fn close_demand_channel(&self, channel_type: u32, client_id: u64) -> bool {
        self.subscribers.remove_demand(channel_type, client_id)
    }

    pub fn close_supply_channel(&self, channel_type: u32, client_id: u64) -> bool {
        self.subscribers.remove_supply(channel_type, client_id)
    }

    pub fn close_all_channels(&self, client_id: u64) {
        self.subscribers.close_all(client_id);
    }

    // -- Gateway --------------------------------------------------------

    pub fn forward_to_gateway(&self, msg: GatewayMsg) -> Result<NotifyOutcome, FabricError> {
        match msg {
            GatewayMsg::Demand { demand, .. } => self.notify_demand_internal(demand, true),
            GatewayMsg::Supply { supply, .. } => self.notify_supply_internal(supply, true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supply(id: u64, channel_type: u32, sender_id: u64) -> Supply {
        Supply { id, channel_type, sender_id, ..Default::default() }
    }

    #[test]
    fn notify_out_of_range_channel_is_rejected() {
        let router = Router::new(0);
        let err = router.notify_supply(supply(1, 99, 1)).unwrap_err();
        assert_eq!(err, FabricError::ChannelTypeError);
    }

    #[tokio::test]
    async fn basic_pub_sub_delivers_exactly_one_message() {
        let router = Router::new(0);
        let mut rx = router.subscribe_supply(3, 11).unwrap();
        router.notify_supply(supply(100, 3, 1)).unwrap();
        router.notify_supply(supply(200, 4, 1)).unwrap();
        let got = rx.try_recv().unwrap();
        assert_eq!(got.id, 100);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn select_confirm_happy_path_yields_matching_mbus_id() {
        let router = Router::new(0);

        // Producer 42 publishes Supply id X on channel 6; record it in the
        // message store the way the tracing interceptor would.
        let x = 555u64;
        router.message_store.add(crate::message_store::MessageRecord {
            msg_type: "NotifySupply",
            channel_type: 6,
            id: x,
            src: 42,
            dst: 0,
            arg: String::new(),
        });
        let mut producer_demand_rx = router.subscribe_demand(6, 42).unwrap();

        let target = Target { id: 0, sender_id: 77, target_id: x, channel_type: 6, mbus_id: 0 };
        let select_fut = router.select_supply(target);
        tokio::pin!(select_fut);

        // Drive the select future until the synthetic Demand has been
        // enqueued, then read it and confirm.
        tokio::select! {
            _ = &mut select_fut => panic!("select resolved before confirm"),
            demand = producer_demand_rx.recv() => {
                let demand = demand.unwrap();
                assert_eq!(demand.target_id, x);
                let corr = demand.mbus_id;
                router.confirm(Target { id: 0, sender_id: 42, target_id: corr, channel_type: 6, mbus_id: corr }).unwrap();
            }
        }

        let outcome = select_fut.await.unwrap();
        assert_ne!(outcome.mbus_id, 0);
    }

    #[tokio::test]
    async fn select_without_known_producer_fails_fast() {
        let router = Router::new(0);
        let target = Target { id: 0, sender_id: 1, target_id: 999, channel_type: 3, mbus_id: 0 };
        let err = router.select_supply(target).await.unwrap_err();
        assert_eq!(err, FabricError::NoProducer);
    }

    #[test]
    fn confirm_without_matching_select_is_rejected() {
        let router = Router::new(0);
        let target = Target { id: 0, sender_id: 1, target_id: 42, channel_type: 3, mbus_id: 42 };
        let err = router.confirm(target).unwrap_err();
        assert_eq!(err, FabricError::TargetNotFound { target_id: 42, channel_type: 3 });
    }

    #[tokio::test]
    async fn mbus_fanout_excludes_sender_and_honors_target() {
        let router = Router::new(0);
        let mut a = router.subscribe_mbus(1, 10).unwrap();
        let mut b = router.subscribe_mbus(1, 20).unwrap();
        let msg = MbusMsg { msg_id: 1, sender_id: 10, target_id: 20, mbus_id: 1, ..Default::default() };
        let (delivered, dropped) = router.send_mbus_msg(msg);
        assert_eq!(delivered, 1);
        assert_eq!(dropped, 0);
        assert!(a.try_recv().is_err());
        assert!(b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn close_mbus_delivers_sentinel() {
        let router = Router::new(0);
        let mut rx = router.subscribe_mbus(7, 1).unwrap();
        router.close_mbus(7);
        let got = rx.try_recv().unwrap();
        assert!(got.is_close_sentinel());
    }
}
