//! In-process BLE simulator
//!
//! Provides a simulated BLE network where peripherals serve GATT services
//! and centrals scan, connect, subscribe and read, entirely in-process.
//! Used for integration testing and the CLI without real BLE hardware.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::gatt::{CharacteristicProperties, GattCharacteristic, GattService};
use super::transport::{
    BleAddress, CentralEvent, CentralTransport, PeripheralEvent, PeripheralTransport, RadioState,
};
use super::BleError;

/// Default ATT MTU of a fresh BLE link.
pub const DEFAULT_MTU: usize = 23;

/// How long a central waits for a peripheral to answer a read.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

const SIM_RSSI: i16 = -50;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn radio_error(state: RadioState) -> BleError {
    match state {
        RadioState::PoweredOff => BleError::PoweredOff,
        RadioState::Unauthorized => BleError::Unauthorized,
        RadioState::Unsupported => BleError::Unsupported,
        other => BleError::ConnectionError(format!("Radio not ready: {:?}", other)),
    }
}

struct PeripheralNode {
    address: BleAddress,
    state: Mutex<PeripheralNodeState>,
    events_tx: mpsc::UnboundedSender<PeripheralEvent>,
}

struct PeripheralNodeState {
    radio: RadioState,
    background_capable: bool,
    services: Vec<GattService>,
    /// (service, local name) while advertising.
    advertising: Option<(Uuid, String)>,
    links: HashSet<BleAddress>,
    subscriptions: HashSet<(BleAddress, Uuid)>,
    restored: Vec<BleAddress>,
    mtu: usize,
    queue_full: bool,
    refused_update: bool,
}

impl PeripheralNodeState {
    fn find_characteristic(&self, uuid: Uuid) -> Option<&GattCharacteristic> {
        self.services.iter().find_map(|s| s.characteristic(uuid))
    }
}

struct CentralNode {
    address: BleAddress,
    state: Mutex<CentralNodeState>,
    events_tx: mpsc::UnboundedSender<CentralEvent>,
}

struct CentralNodeState {
    radio: RadioState,
    scan_filter: Option<Uuid>,
    links: HashSet<BleAddress>,
}

#[derive(Default)]
struct Nodes {
    peripherals: HashMap<BleAddress, Arc<PeripheralNode>>,
    centrals: HashMap<BleAddress, Arc<CentralNode>>,
}

/// The simulated "air" shared by every device created on it.
pub struct SimBleNetwork {
    nodes: Mutex<Nodes>,
}

impl SimBleNetwork {
    /// Create a new simulated BLE network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(Nodes::default()),
        })
    }

    /// Create a powered-on peripheral on this network.
    pub fn create_peripheral(self: &Arc<Self>) -> SimPeripheral {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let node = Arc::new(PeripheralNode {
            address: BleAddress::Simulated(Uuid::new_v4()),
            state: Mutex::new(PeripheralNodeState {
                radio: RadioState::PoweredOn,
                background_capable: true,
                services: Vec::new(),
                advertising: None,
                links: HashSet::new(),
                subscriptions: HashSet::new(),
                restored: Vec::new(),
                mtu: DEFAULT_MTU,
                queue_full: false,
                refused_update: false,
            }),
            events_tx,
        });
        lock(&self.nodes)
            .peripherals
            .insert(node.address.clone(), Arc::clone(&node));

        SimPeripheral {
            node,
            network: Arc::clone(self),
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Create a powered-on central on this network.
    pub fn create_central(self: &Arc<Self>) -> SimCentral {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let node = Arc::new(CentralNode {
            address: BleAddress::Simulated(Uuid::new_v4()),
            state: Mutex::new(CentralNodeState {
                radio: RadioState::PoweredOn,
                scan_filter: None,
                links: HashSet::new(),
            }),
            events_tx,
        });
        lock(&self.nodes)
            .centrals
            .insert(node.address.clone(), Arc::clone(&node));

        SimCentral {
            node,
            network: Arc::clone(self),
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    fn peripheral(&self, address: &BleAddress) -> Option<Arc<PeripheralNode>> {
        lock(&self.nodes).peripherals.get(address).cloned()
    }

    fn central(&self, address: &BleAddress) -> Option<Arc<CentralNode>> {
        lock(&self.nodes).centrals.get(address).cloned()
    }

    fn centrals(&self) -> Vec<Arc<CentralNode>> {
        lock(&self.nodes).centrals.values().cloned().collect()
    }

    fn peripherals(&self) -> Vec<Arc<PeripheralNode>> {
        lock(&self.nodes).peripherals.values().cloned().collect()
    }

    /// Tear down the link between a central and a peripheral, telling the
    /// peripheral about every subscription that ended.
    fn drop_link(&self, central: &BleAddress, peripheral: &BleAddress) {
        let mut ended = Vec::new();
        let mut was_linked = false;
        if let Some(node) = self.peripheral(peripheral) {
            let mut state = lock(&node.state);
            was_linked = state.links.remove(central);
            state.subscriptions.retain(|(c, characteristic)| {
                if c == central {
                    ended.push(*characteristic);
                    false
                } else {
                    true
                }
            });
            for characteristic in ended {
                let _ = node.events_tx.send(PeripheralEvent::Unsubscribed {
                    central: central.clone(),
                    characteristic,
                });
            }
        }
        if let Some(node) = self.central(central) {
            let removed = lock(&node.state).links.remove(peripheral);
            if removed || was_linked {
                let _ = node.events_tx.send(CentralEvent::Disconnected {
                    peer: peripheral.clone(),
                });
            }
        }
    }
}

/// A simulated peripheral device.
pub struct SimPeripheral {
    node: Arc<PeripheralNode>,
    network: Arc<SimBleNetwork>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeripheralEvent>>>,
}

impl SimPeripheral {
    /// Get this device's BLE address.
    pub fn address(&self) -> &BleAddress {
        &self.node.address
    }

    /// Set the ATT MTU used for links to this peripheral.
    pub fn set_mtu(&self, mtu: usize) {
        lock(&self.node.state).mtu = mtu;
    }

    /// Control whether the host grants background peripheral mode.
    pub fn set_background_capable(&self, capable: bool) {
        lock(&self.node.state).background_capable = capable;
    }

    /// Centrals reported as subscribed after a relaunch.
    pub fn set_restored_subscribers(&self, centrals: Vec<BleAddress>) {
        lock(&self.node.state).restored = centrals;
    }

    /// Switch the radio. Anything but `PoweredOn` stops advertising and drops
    /// every link without unsubscribe callbacks, like a radio reset would.
    pub fn set_radio_state(&self, radio: RadioState) {
        let dropped: Vec<BleAddress> = {
            let mut state = lock(&self.node.state);
            state.radio = radio;
            if radio == RadioState::PoweredOn {
                Vec::new()
            } else {
                state.advertising = None;
                state.subscriptions.clear();
                state.links.drain().collect()
            }
        };
        let _ = self.node.events_tx.send(PeripheralEvent::StateChanged(radio));

        for central in dropped {
            if let Some(node) = self.network.central(&central) {
                lock(&node.state).links.remove(&self.node.address);
                let _ = node.events_tx.send(CentralEvent::Disconnected {
                    peer: self.node.address.clone(),
                });
            }
        }
    }

    /// Simulate a full transmit queue: notifications are refused until the
    /// queue drains, then `ReadyToUpdateSubscribers` is delivered.
    pub fn set_transmit_queue_full(&self, full: bool) {
        let ready = {
            let mut state = lock(&self.node.state);
            state.queue_full = full;
            let ready = !full && state.refused_update;
            if ready {
                state.refused_update = false;
            }
            ready
        };
        if ready {
            let _ = self.node.events_tx.send(PeripheralEvent::ReadyToUpdateSubscribers);
        }
    }

    /// Drop the link to a central as if it walked out of range.
    pub fn drop_central(&self, central: &BleAddress) {
        self.network.drop_link(central, &self.node.address);
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.node.state).subscriptions.len()
    }
}

#[async_trait]
impl PeripheralTransport for SimPeripheral {
    fn radio_state(&self) -> RadioState {
        lock(&self.node.state).radio
    }

    fn supports_background_peripheral(&self) -> bool {
        lock(&self.node.state).background_capable
    }

    async fn add_service(&self, service: &GattService) -> Result<(), BleError> {
        let mut state = lock(&self.node.state);
        if state.radio != RadioState::PoweredOn {
            return Err(radio_error(state.radio));
        }
        state.services.retain(|s| s.uuid != service.uuid);
        state.services.push(service.clone());
        Ok(())
    }

    async fn start_advertising(&self, service: Uuid, local_name: &str) -> Result<(), BleError> {
        {
            let mut state = lock(&self.node.state);
            if state.radio != RadioState::PoweredOn {
                return Err(radio_error(state.radio));
            }
            if !state.services.iter().any(|s| s.uuid == service) {
                return Err(BleError::AdvertisingError(format!(
                    "Service {} is not registered",
                    service
                )));
            }
            state.advertising = Some((service, local_name.to_string()));
        }
        let _ = self
            .node
            .events_tx
            .send(PeripheralEvent::AdvertisingStarted(Ok(())));

        for central in self.network.centrals() {
            let scanning = lock(&central.state).scan_filter == Some(service);
            if scanning {
                let _ = central.events_tx.send(CentralEvent::Discovered {
                    peer: self.node.address.clone(),
                    local_name: Some(local_name.to_string()),
                    rssi: Some(SIM_RSSI),
                });
            }
        }
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), BleError> {
        lock(&self.node.state).advertising = None;
        Ok(())
    }

    fn is_advertising(&self) -> bool {
        lock(&self.node.state).advertising.is_some()
    }

    async fn notify(&self, characteristic: Uuid, value: &[u8]) -> Result<bool, BleError> {
        let targets: Vec<BleAddress> = {
            let mut state = lock(&self.node.state);
            if state.radio != RadioState::PoweredOn {
                return Err(radio_error(state.radio));
            }
            let limit = state.mtu.saturating_sub(3);
            if value.len() > limit {
                return Err(BleError::MtuExceeded {
                    size: value.len(),
                    mtu: limit,
                });
            }
            if state.queue_full {
                state.refused_update = true;
                return Ok(false);
            }
            state
                .subscriptions
                .iter()
                .filter(|(_, c)| *c == characteristic)
                .map(|(central, _)| central.clone())
                .collect()
        };

        for central in targets {
            if let Some(node) = self.network.central(&central) {
                let _ = node.events_tx.send(CentralEvent::ValueUpdated {
                    peer: self.node.address.clone(),
                    characteristic,
                    properties: CharacteristicProperties::NOTIFY_READ,
                    value: Some(value.to_vec()),
                });
            }
        }
        Ok(true)
    }

    fn restored_subscribers(&self) -> Vec<BleAddress> {
        lock(&self.node.state).restored.clone()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeripheralEvent>> {
        lock(&self.events_rx).take()
    }
}

/// A simulated central device.
pub struct SimCentral {
    node: Arc<CentralNode>,
    network: Arc<SimBleNetwork>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<CentralEvent>>>,
}

impl SimCentral {
    /// Get this device's BLE address.
    pub fn address(&self) -> &BleAddress {
        &self.node.address
    }

    /// Switch the radio. Anything but `PoweredOn` stops scanning and drops
    /// every link.
    pub fn set_radio_state(&self, radio: RadioState) {
        let dropped: Vec<BleAddress> = {
            let mut state = lock(&self.node.state);
            state.radio = radio;
            if radio == RadioState::PoweredOn {
                Vec::new()
            } else {
                state.scan_filter = None;
                state.links.iter().cloned().collect()
            }
        };
        for peer in dropped {
            self.network.drop_link(&self.node.address, &peer);
        }
        let _ = self.node.events_tx.send(CentralEvent::StateChanged(radio));
    }

    /// Deliver a state-restoration snapshot, as the platform does on relaunch.
    pub fn restore(&self, peers: Vec<BleAddress>) {
        let _ = self.node.events_tx.send(CentralEvent::Restored { peers });
    }

    fn linked_peripheral(&self, peer: &BleAddress) -> Result<Arc<PeripheralNode>, BleError> {
        if !lock(&self.node.state).links.contains(peer) {
            return Err(BleError::Disconnected);
        }
        self.network.peripheral(peer).ok_or(BleError::Disconnected)
    }

    fn ensure_powered(&self) -> Result<(), BleError> {
        let radio = lock(&self.node.state).radio;
        if radio == RadioState::PoweredOn {
            Ok(())
        } else {
            Err(radio_error(radio))
        }
    }
}

#[async_trait]
impl CentralTransport for SimCentral {
    fn radio_state(&self) -> RadioState {
        lock(&self.node.state).radio
    }

    fn is_scanning(&self) -> bool {
        lock(&self.node.state).scan_filter.is_some()
    }

    async fn start_scan(&self, service: Uuid) -> Result<(), BleError> {
        self.ensure_powered()?;
        lock(&self.node.state).scan_filter = Some(service);

        // Peripherals that were already advertising show up right away.
        for peripheral in self.network.peripherals() {
            let advertised = lock(&peripheral.state).advertising.clone();
            if let Some((advertised_service, local_name)) = advertised {
                if advertised_service == service {
                    let _ = self.node.events_tx.send(CentralEvent::Discovered {
                        peer: peripheral.address.clone(),
                        local_name: Some(local_name),
                        rssi: Some(SIM_RSSI),
                    });
                }
            }
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        lock(&self.node.state).scan_filter = None;
        Ok(())
    }

    async fn connect(&self, peer: &BleAddress) -> Result<(), BleError> {
        self.ensure_powered()?;
        let peripheral = self
            .network
            .peripheral(peer)
            .ok_or_else(|| BleError::ConnectionError(format!("No peripheral at {}", peer)))?;

        {
            let mut state = lock(&peripheral.state);
            if state.radio != RadioState::PoweredOn || state.advertising.is_none() {
                return Err(BleError::ConnectionError(format!(
                    "Peripheral {} is not connectable",
                    peer
                )));
            }
            state.links.insert(self.node.address.clone());
        }
        lock(&self.node.state).links.insert(peer.clone());
        Ok(())
    }

    async fn disconnect(&self, peer: &BleAddress) -> Result<(), BleError> {
        self.network.drop_link(&self.node.address, peer);
        Ok(())
    }

    async fn discover_services(&self, peer: &BleAddress) -> Result<Vec<Uuid>, BleError> {
        let peripheral = self.linked_peripheral(peer)?;
        let state = lock(&peripheral.state);
        Ok(state.services.iter().map(|s| s.uuid).collect())
    }

    async fn discover_characteristics(
        &self,
        peer: &BleAddress,
        service: Uuid,
    ) -> Result<Vec<GattCharacteristic>, BleError> {
        let peripheral = self.linked_peripheral(peer)?;
        let state = lock(&peripheral.state);
        state
            .services
            .iter()
            .find(|s| s.uuid == service)
            .map(|s| s.characteristics.clone())
            .ok_or_else(|| BleError::GattError(format!("Service {} not found", service)))
    }

    async fn set_notify(
        &self,
        peer: &BleAddress,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), BleError> {
        let peripheral = self.linked_peripheral(peer)?;
        let key = (self.node.address.clone(), characteristic);

        let event = {
            let mut state = lock(&peripheral.state);
            let notifiable = state
                .find_characteristic(characteristic)
                .map(|c| c.properties.notify)
                .unwrap_or(false);
            if !notifiable {
                return Err(BleError::GattError(format!(
                    "Characteristic {} does not notify",
                    characteristic
                )));
            }

            let central = self.node.address.clone();
            if enabled {
                state
                    .subscriptions
                    .insert(key)
                    .then_some(PeripheralEvent::Subscribed {
                        central,
                        characteristic,
                    })
            } else {
                state
                    .subscriptions
                    .remove(&key)
                    .then_some(PeripheralEvent::Unsubscribed {
                        central,
                        characteristic,
                    })
            }
        };

        if let Some(event) = event {
            let _ = peripheral.events_tx.send(event);
        }
        Ok(())
    }

    async fn read(
        &self,
        peer: &BleAddress,
        characteristic: Uuid,
        offset: usize,
    ) -> Result<Vec<u8>, BleError> {
        let peripheral = self.linked_peripheral(peer)?;
        let chunk_limit = {
            let state = lock(&peripheral.state);
            let readable = state
                .find_characteristic(characteristic)
                .map(|c| c.properties.read)
                .unwrap_or(false);
            if !readable {
                return Err(BleError::GattError(format!(
                    "Characteristic {} is not readable",
                    characteristic
                )));
            }
            state.mtu.saturating_sub(1)
        };

        let (responder, response) = oneshot::channel();
        peripheral
            .events_tx
            .send(PeripheralEvent::ReadRequest {
                central: self.node.address.clone(),
                characteristic,
                offset,
                responder,
            })
            .map_err(|_| BleError::Disconnected)?;

        let result = tokio::time::timeout(READ_TIMEOUT, response)
            .await
            .map_err(|_| BleError::Timeout)?
            .map_err(|_| BleError::Disconnected)?;

        let mut value = result.map_err(BleError::Att)?;
        value.truncate(chunk_limit);
        Ok(value)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<CentralEvent>> {
        lock(&self.events_rx).take()
    }
}
