//! Per-channel fan-out queues and the bidirectional (slice, client-id map)
//! index pair.
//!
//! Each `(kind, channel_type)` cell owns a `Vec` (fan-out order) and a
//! `HashMap<u64, Queue>` (close / select-target lookup) pointing at the
//! *same* queues: two indexes over one set of owned queues, guarded by a
//! single lock per cell rather than one lock for the whole table.

use std::collections::HashMap;
use std::sync::RwLock;

use log::warn;
use tokio::sync::mpsc;

use crate::error::FabricError;
use crate::model::{Demand, GatewayMsg, MbusMsg, Supply, CHANNEL_TYPE_MAX};

pub const QUEUE_CAPACITY: usize = 100;

pub type Sender<T> = mpsc::Sender<T>;
pub type Receiver<T> = mpsc::Receiver<T>;

#[derive(Debug)]
struct Cell<T> {
    order: Vec<u64>,
    by_client: HashMap<u64, Sender<T>>,
}

impl<T> Default for Cell<T> {
    fn default() -> Self {
        Self { order: Vec::new(), by_client: HashMap::new() }
    }
}

impl<T: Clone> Cell<T> {
    fn add(&mut self, client_id: u64) -> Result<Receiver<T>, FabricError> {
        if self.by_client.contains_key(&client_id) {
            return Err(FabricError::DuplicateSubscriber(client_id));
        }
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        self.order.push(client_id);
        self.by_client.insert(client_id, tx);
        Ok(rx)
    }

    fn remove(&mut self, client_id: u64) -> bool {
        if self.by_client.remove(&client_id).is_some() {
            self.order.retain(|id| *id != client_id);
            true
        } else {
            false
        }
    }

    /// Drop-on-overflow fan-out. Takes `&self` so concurrent fan-outs on the
    /// same cell only contend with subscribe/unsubscribe, never each other.
    /// Returns the number of subscribers the message was dropped for and
    /// the ids of subscribers whose queue has closed, for the caller to
    /// prune under a write lock.
    fn fanout(&self, msg: &T) -> (usize, Vec<u64>) {
        let mut dropped = 0;
        let mut dead = Vec::new();
        for client_id in &self.order {
            let Some(tx) = self.by_client.get(client_id) else { continue };
            match tx.try_send(msg.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped += 1;
                    warn!("fanout drop: subscriber {client_id} queue full");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(*client_id);
                }
            }
        }
        (dropped, dead)
    }
}

/// Per-channel-type table for a single `ChannelKind` (Supply or Demand).
#[derive(Debug, Default)]
struct KindTable<T>(Vec<RwLock<Cell<T>>>);

impl<T: Clone> KindTable<T> {
    fn new() -> Self {
        let mut v = Vec::with_capacity(CHANNEL_TYPE_MAX as usize);
        for _ in 0..CHANNEL_TYPE_MAX {
            v.push(RwLock::new(Cell::default()));
        }
        Self(v)
    }

    fn cell(&self, channel_type: u32) -> &RwLock<Cell<T>> {
        &self.0[channel_type as usize]
    }
}

#[derive(Debug)]
pub struct SubscriberTable {
    supply: KindTable<Supply>,
    demand: KindTable<Demand>,
    /// mbus_id -> fan-out cell, created lazily on first subscribe.
    mbus: RwLock<HashMap<u64, Cell<MbusMsg>>>,
    gateway: RwLock<Cell<GatewayMsg>>,
}

impl Default for SubscriberTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriberTable {
    pub fn new() -> Self {
        Self {
            supply: KindTable::new(),
            demand: KindTable::new(),
            mbus: RwLock::new(HashMap::new()),
            gateway: RwLock::new(Cell::default()),
        }
    }

    pub fn add_supply(&self, channel_type: u32, client_id: u64) -> Result<Receiver<Supply>, FabricError> {
        self.supply.cell(channel_type).write().unwrap_or_else(|e| e.into_inner()).add(client_id)
    }

    pub fn add_demand(&self, channel_type: u32, client_id: u64) -> Result<Receiver<Demand>, FabricError> {
        self.demand.cell(channel_type).write().unwrap_or_else(|e| e.into_inner()).add(client_id)
    }

    pub fn remove_supply(&self, channel_type: u32, client_id: u64) -> bool {
        self.supply.cell(channel_type).write().unwrap_or_else(|e| e.into_inner()).remove(client_id)
    }

    pub fn remove_demand(&self, channel_type: u32, client_id: u64) -> bool {
        self.demand.cell(channel_type).write().unwrap_or_else(|e| e.into_inner()).remove(client_id)
    }

    pub fn fanout_supply(&self, channel_type: u32, msg: &Supply) -> usize {
        let cell = self.supply.cell(channel_type);
        let (dropped, dead) = cell.read().unwrap_or_else(|e| e.into_inner()).fanout(msg);
        if !dead.is_empty() {
            let mut cell = cell.write().unwrap_or_else(|e| e.into_inner());
            for id in dead {
                cell.remove(id);
            }
        }
        dropped
    }

    pub fn fanout_demand(&self, channel_type: u32, msg: &Demand) -> usize {
        let cell = self.demand.cell(channel_type);
        let (dropped, dead) = cell.read().unwrap_or_else(|e| e.into_inner()).fanout(msg);
        if !dead.is_empty() {
            let mut cell = cell.write().unwrap_or_else(|e| e.into_inner());
            for id in dead {
                cell.remove(id);
            }
        }
        dropped
    }

    /// Used by Select to resolve `(channel_type, producer_id)` to a live
    /// demand queue.
    pub fn demand_sender(&self, channel_type: u32, client_id: u64) -> Option<Sender<Demand>> {
        self.demand.cell(channel_type).read().unwrap_or_else(|e| e.into_inner()).by_client.get(&client_id).cloned()
    }

    pub fn supply_sender(&self, channel_type: u32, client_id: u64) -> Option<Sender<Supply>> {
        self.supply.cell(channel_type).read().unwrap_or_else(|e| e.into_inner()).by_client.get(&client_id).cloned()
    }

    pub fn add_mbus(&self, mbus_id: u64, client_id: u64) -> Result<Receiver<MbusMsg>, FabricError> {
        let mut mbus = self.mbus.write().unwrap_or_else(|e| e.into_inner());
        mbus.entry(mbus_id).or_default().add(client_id)
    }

    pub fn mbus_subscriber_count(&self, mbus_id: u64) -> usize {
        self.mbus.read().unwrap_or_else(|e| e.into_inner()).get(&mbus_id).map_or(0, |c| c.by_client.len())
    }

    /// Fans out to every mbus subscriber except `sender_id`, honoring
    /// `target_id == 0` (broadcast) or `target_id == <some subscriber>`
    /// (unicast). Returns the number of recipients the message was
    /// delivered to and the number it was dropped for.
    pub fn fanout_mbus(&self, mbus_id: u64, msg: &MbusMsg) -> (usize, usize) {
        let mut mbus = self.mbus.write().unwrap_or_else(|e| e.into_inner());
        let Some(cell) = mbus.get_mut(&mbus_id) else { return (0, 0) };
        let mut delivered = 0;
        let mut dropped = 0;
        let mut dead = Vec::new();
        for client_id in cell.order.clone() {
            if client_id == msg.sender_id {
                continue;
            }
            if msg.target_id != 0 && msg.target_id != client_id {
                continue;
            }
            let Some(tx) = cell.by_client.get(&client_id) else { continue };
            match tx.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped += 1;
                    warn!("mbus {mbus_id} fanout drop: subscriber {client_id} queue full");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(client_id),
            }
        }
        for id in dead {
            cell.remove(id);
        }
        (delivered, dropped)
    }

    pub fn add_gateway(&self, client_id: u64) -> Result<Receiver<GatewayMsg>, FabricError> {
        self.gateway.write().unwrap_or_else(|e| e.into_inner()).add(client_id)
    }

    pub fn remove_gateway(&self, client_id: u64) -> bool {
        self.gateway.write().unwrap_or_else(|e| e.into_inner()).remove(client_id)
    }

    pub fn gateway_peers(&self) -> Vec<(u64, Sender<GatewayMsg>)> {
        let cell = self.gateway.read().unwrap_or_else(|e| e.into_inner());
        cell.order.iter().filter_map(|id| cell.by_client.get(id).map(|tx| (*id, tx.clone()))).collect()
    }

    /// Removes and closes every queue owned by `client_id` across every
    /// channel type and kind. Once this returns, no further message will
    /// be delivered to that client id.
    pub fn close_all(&self, client_id: u64) {
        for ct in 1..CHANNEL_TYPE_MAX {
            self.remove_supply(ct, client_id);
            self.remove_demand(ct, client_id);
        }
        let mut mbus = self.mbus.write().unwrap_or_else(|e| e.into_inner());
        mbus.retain(|_, cell| {
            cell.remove(client_id);
            !cell.by_client.is_empty()
        });
        self.remove_gateway(client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Supply;

    fn supply(id: u64) -> Supply {
        Supply { id, channel_type: 3, ..Default::default() }
    }

    #[tokio::test]
    async fn duplicate_subscribe_is_rejected() {
        let table = SubscriberTable::new();
        let _rx = table.add_supply(3, 11).unwrap();
        let err = table.add_supply(3, 11).unwrap_err();
        assert_eq!(err, FabricError::DuplicateSubscriber(11));
    }

    #[tokio::test]
    async fn basic_pub_sub_delivers_to_matching_channel_only() {
        let table = SubscriberTable::new();
        let mut rx = table.add_supply(3, 11).unwrap();
        table.fanout_supply(3, &supply(100));
        table.fanout_supply(4, &supply(200));
        let got = rx.try_recv().unwrap();
        assert_eq!(got.id, 100);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_consumer_drops_without_blocking_others() {
        let table = SubscriberTable::new();
        let mut fast = table.add_supply(3, 1).unwrap();
        let _slow = table.add_supply(3, 2).unwrap(); // never drained

        let mut total_dropped = 0;
        for i in 0..150u64 {
            total_dropped += table.fanout_supply(3, &supply(i));
        }

        let mut fast_count = 0;
        while fast.try_recv().is_ok() {
            fast_count += 1;
        }
        assert_eq!(fast_count, 150);
        assert_eq!(total_dropped, 50);
    }

    #[tokio::test]
    async fn close_all_removes_every_channel_type() {
        let table = SubscriberTable::new();
        let _rx1 = table.add_supply(3, 42).unwrap();
        let _rx2 = table.add_demand(5, 42).unwrap();
        table.close_all(42);
        assert!(table.add_supply(3, 42).is_ok());
        assert!(table.add_demand(5, 42).is_ok());
    }

    #[tokio::test]
    async fn mbus_never_echoes_to_sender() {
        let table = SubscriberTable::new();
        let mut a = table.add_mbus(1, 10).unwrap();
        let mut b = table.add_mbus(1, 20).unwrap();
        let msg = MbusMsg { msg_id: 1, sender_id: 10, target_id: 0, mbus_id: 1, ..Default::default() };
        let (delivered, dropped) = table.fanout_mbus(1, &msg);
        assert_eq!(delivered, 1);
        assert_eq!(dropped, 0);
        assert!(a.try_recv().is_err());
        assert!(b.try_recv().is_ok());
    }
}
