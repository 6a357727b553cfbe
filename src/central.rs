//! Central role: discovery, connection and message reassembly
//!
//! A connection walks `Connecting -> ServiceDiscovery ->
//! CharacteristicDiscovery -> Subscribed`. Any failure along the way tears
//! the link down and is reported once as `ConnectFailed`.
//!
//! Pushed values shorter than a complete message are identifier hints; the
//! central answers them with a long read of the characteristic and decodes
//! the reassembled payload.

use std::sync::{Arc, Weak};

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::ble::gatt::{HEARTBEAT_CHAR_UUID, NAVIGATION_CHAR_UUID, NAVIGATION_SERVICE_UUID};
use crate::ble::transport::{BleAddress, CentralEvent, CentralTransport, RadioState};
use crate::ble::BleError;
use crate::config::CentralConfig;
use crate::navigation::{CodecError, NavigationMessage};
use crate::store::{KnownPeers, StoreError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CentralError {
    #[error("Navigation service not found on peer")]
    ServiceNotFound,

    #[error("Navigation characteristic not found on peer")]
    CharacteristicNotFound,

    #[error("Connection failed: {0}")]
    ConnectFailed(BleError),

    #[error("Discovery failed: {0}")]
    Discovery(BleError),

    #[error("Read failed: {0}")]
    Read(BleError),

    #[error("Not connected")]
    NotConnected,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CentralPhase {
    Idle,
    Scanning,
    Connecting,
    ServiceDiscovery,
    CharacteristicDiscovery,
    Subscribed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub address: BleAddress,
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
}

/// Observer notifications from the central.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralUpdate {
    /// The full list of peers seen so far.
    PeersDiscovered(Vec<DiscoveredPeer>),
    Connected(BleAddress),
    ConnectFailed {
        peer: BleAddress,
        error: CentralError,
    },
    Disconnected(BleAddress),
    Navigation(NavigationMessage),
    DecodeFailed {
        peer: BleAddress,
        error: CentralError,
    },
}

struct CentralState {
    phase: CentralPhase,
    discovered: Vec<DiscoveredPeer>,
    connected: Option<BleAddress>,
    subscribed_characteristic: Option<Uuid>,
    heartbeat_characteristic: Option<Uuid>,
}

impl CentralState {
    fn clear_link(&mut self) {
        self.connected = None;
        self.subscribed_characteristic = None;
        self.heartbeat_characteristic = None;
        self.phase = CentralPhase::Idle;
    }
}

pub struct CentralService {
    me: Weak<Self>,
    transport: Arc<dyn CentralTransport>,
    config: CentralConfig,
    known_peers: KnownPeers,
    state: Mutex<CentralState>,
    updates: mpsc::UnboundedSender<CentralUpdate>,
}

impl CentralService {
    pub fn new(
        transport: Arc<dyn CentralTransport>,
        known_peers: KnownPeers,
        config: CentralConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<CentralUpdate>) {
        let (updates, rx) = mpsc::unbounded_channel();
        let service = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            transport,
            config,
            known_peers,
            state: Mutex::new(CentralState {
                phase: CentralPhase::Idle,
                discovered: Vec::new(),
                connected: None,
                subscribed_characteristic: None,
                heartbeat_characteristic: None,
            }),
            updates,
        });
        (service, rx)
    }

    /// Spawn the loop that feeds transport events into `handle_event`.
    pub fn run(&self) -> Option<JoinHandle<()>> {
        let mut events = self.transport.take_events()?;
        let this = self.me.clone();
        Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(service) = this.upgrade() else { break };
                service.handle_event(event).await;
            }
            log::debug!("Central event loop finished");
        }))
    }

    /// Scan for peers offering the navigation service. Does nothing while
    /// already scanning or while the radio is not powered on.
    pub async fn start_discovery(&self) -> Result<(), CentralError> {
        let mut state = self.state.lock().await;
        if self.transport.is_scanning() {
            return Ok(());
        }
        let radio = self.transport.radio_state();
        if radio != RadioState::PoweredOn {
            log::warn!("Not scanning, radio is {:?}", radio);
            return Ok(());
        }

        self.transport
            .start_scan(NAVIGATION_SERVICE_UUID)
            .await
            .map_err(CentralError::Discovery)?;
        if state.connected.is_none() {
            state.phase = CentralPhase::Scanning;
        }
        log::info!("Scanning for navigation peripherals");
        Ok(())
    }

    pub async fn stop_discovery(&self) {
        let mut state = self.state.lock().await;
        self.halt_scan(&mut state).await;
    }

    /// Reconnect directly to every remembered peer, without scanning.
    /// Returns how many peers were tried.
    pub async fn restore_last_known_peer(&self) -> usize {
        let peers = self.known_peers.load();
        let mut state = self.state.lock().await;
        for peer in &peers {
            log::info!("Reconnecting to known peer {}", peer);
            let _ = self.connect_locked(&mut state, peer).await;
        }
        peers.len()
    }

    /// Connect to `peer` and subscribe to its navigation characteristic.
    pub async fn connect(&self, peer: &BleAddress) -> Result<(), CentralError> {
        let mut state = self.state.lock().await;
        self.connect_locked(&mut state, peer).await
    }

    /// Unsubscribe and drop the current link, if any.
    pub async fn disconnect_all(&self) {
        let mut state = self.state.lock().await;
        let Some(peer) = state.connected.clone() else {
            return;
        };

        if let Some(characteristic) = state.subscribed_characteristic {
            if let Err(e) = self.transport.set_notify(&peer, characteristic, false).await {
                log::warn!("Failed to unsubscribe from {}: {}", peer, e);
            }
        }
        if let Err(e) = self.transport.disconnect(&peer).await {
            log::warn!("Failed to disconnect {}: {}", peer, e);
        }
        state.clear_link();
        log::info!("Disconnected from {}", peer);
        self.emit(CentralUpdate::Disconnected(peer));
    }

    /// Read and decode the connected peer's latest message on demand.
    pub async fn read_latest(&self) -> Result<NavigationMessage, CentralError> {
        let state = self.state.lock().await;
        let peer = state.connected.clone().ok_or(CentralError::NotConnected)?;
        let payload = self.long_read(&peer).await?;
        Ok(NavigationMessage::decode(&payload)?)
    }

    /// Drop the remembered peer so the next launch scans again.
    pub fn forget_known_peer(&self) -> Result<(), CentralError> {
        self.known_peers.forget()?;
        Ok(())
    }

    pub async fn phase(&self) -> CentralPhase {
        self.state.lock().await.phase
    }

    pub async fn connected_peer(&self) -> Option<BleAddress> {
        self.state.lock().await.connected.clone()
    }

    pub async fn discovered_peers(&self) -> Vec<DiscoveredPeer> {
        self.state.lock().await.discovered.clone()
    }

    /// The heartbeat write characteristic, if the connected peer offers one.
    pub async fn heartbeat_characteristic(&self) -> Option<Uuid> {
        self.state.lock().await.heartbeat_characteristic
    }

    pub async fn handle_event(&self, event: CentralEvent) {
        let mut state = self.state.lock().await;
        match event {
            CentralEvent::StateChanged(RadioState::PoweredOn) => {
                log::info!("Radio powered on");
                if state.connected.is_none() {
                    for peer in self.known_peers.load() {
                        let _ = self.connect_locked(&mut state, &peer).await;
                    }
                }
            }
            CentralEvent::StateChanged(radio) => {
                log::warn!("Radio state changed to {:?}", radio);
                if state.phase == CentralPhase::Scanning {
                    state.phase = CentralPhase::Idle;
                }
            }
            CentralEvent::Discovered {
                peer,
                local_name,
                rssi,
            } => {
                match state.discovered.iter_mut().find(|p| p.address == peer) {
                    Some(known) => {
                        if local_name.is_some() {
                            known.local_name = local_name;
                        }
                        known.rssi = rssi.or(known.rssi);
                    }
                    None => {
                        log::info!("Discovered {} ({:?})", peer, local_name);
                        state.discovered.push(DiscoveredPeer {
                            address: peer,
                            local_name,
                            rssi,
                        });
                    }
                }
                self.emit(CentralUpdate::PeersDiscovered(state.discovered.clone()));
            }
            CentralEvent::ValueUpdated {
                peer,
                characteristic,
                properties,
                value,
            } => {
                let from_link = state.connected.as_ref() == Some(&peer);
                if !from_link || characteristic != NAVIGATION_CHAR_UUID {
                    log::debug!("Ignoring value for {} from {}", characteristic, peer);
                    return;
                }

                let result = match value {
                    Some(value)
                        if !properties.is_read_only()
                            && value.len() >= self.config.complete_notification_len =>
                    {
                        NavigationMessage::decode(&value).map_err(CentralError::from)
                    }
                    _ => self.long_read(&peer).await.and_then(|payload| {
                        NavigationMessage::decode(&payload).map_err(CentralError::from)
                    }),
                };

                match result {
                    Ok(message) => {
                        log::info!("Received {}", message);
                        self.emit(CentralUpdate::Navigation(message));
                    }
                    Err(error) => {
                        log::warn!("Could not decode value from {}: {}", peer, error);
                        self.emit(CentralUpdate::DecodeFailed { peer, error });
                    }
                }
            }
            CentralEvent::Disconnected { peer } => {
                if state.connected.as_ref() != Some(&peer) {
                    return;
                }
                log::info!("Peer {} disconnected", peer);
                state.clear_link();
                self.emit(CentralUpdate::Disconnected(peer));
            }
            CentralEvent::Restored { peers } => {
                log::info!("Restored {} peer(s)", peers.len());
                state.discovered = peers
                    .into_iter()
                    .map(|address| DiscoveredPeer {
                        address,
                        local_name: None,
                        rssi: None,
                    })
                    .collect();
                self.emit(CentralUpdate::PeersDiscovered(state.discovered.clone()));
            }
        }
    }

    async fn connect_locked(
        &self,
        state: &mut CentralState,
        peer: &BleAddress,
    ) -> Result<(), CentralError> {
        if state.connected.as_ref() == Some(peer) {
            return Ok(());
        }
        if let Some(previous) = state.connected.clone() {
            log::info!("Dropping {} to connect to {}", previous, peer);
            let _ = self.transport.disconnect(&previous).await;
            state.clear_link();
            self.emit(CentralUpdate::Disconnected(previous));
        }

        self.halt_scan(state).await;
        state.phase = CentralPhase::Connecting;
        if let Err(e) = self.transport.connect(peer).await {
            state.clear_link();
            return Err(self.connect_failed(peer, CentralError::ConnectFailed(e)));
        }
        state.connected = Some(peer.clone());
        if let Err(e) = self.known_peers.remember(peer) {
            log::warn!("Could not remember {}: {}", peer, e);
        }

        match self.discover_and_subscribe(state, peer).await {
            Ok(()) => {
                state.phase = CentralPhase::Subscribed;
                log::info!("Subscribed to navigation data from {}", peer);
                self.emit(CentralUpdate::Connected(peer.clone()));
                Ok(())
            }
            Err(error) => {
                let _ = self.transport.disconnect(peer).await;
                state.clear_link();
                Err(self.connect_failed(peer, error))
            }
        }
    }

    async fn discover_and_subscribe(
        &self,
        state: &mut CentralState,
        peer: &BleAddress,
    ) -> Result<(), CentralError> {
        state.phase = CentralPhase::ServiceDiscovery;
        let services = self
            .transport
            .discover_services(peer)
            .await
            .map_err(CentralError::Discovery)?;
        if !services.contains(&NAVIGATION_SERVICE_UUID) {
            return Err(CentralError::ServiceNotFound);
        }

        state.phase = CentralPhase::CharacteristicDiscovery;
        let characteristics = self
            .transport
            .discover_characteristics(peer, NAVIGATION_SERVICE_UUID)
            .await
            .map_err(CentralError::Discovery)?;
        if !characteristics.iter().any(|c| c.uuid == NAVIGATION_CHAR_UUID) {
            return Err(CentralError::CharacteristicNotFound);
        }
        state.heartbeat_characteristic = characteristics
            .iter()
            .find(|c| c.uuid == HEARTBEAT_CHAR_UUID)
            .map(|c| c.uuid);

        self.transport
            .set_notify(peer, NAVIGATION_CHAR_UUID, true)
            .await
            .map_err(CentralError::Discovery)?;
        state.subscribed_characteristic = Some(NAVIGATION_CHAR_UUID);
        Ok(())
    }

    /// Read the whole characteristic value, one offset read per chunk,
    /// until the peer answers with an empty chunk.
    async fn long_read(&self, peer: &BleAddress) -> Result<Vec<u8>, CentralError> {
        let mut payload = Vec::new();
        for _ in 0..self.config.max_read_chunks {
            let chunk = self
                .transport
                .read(peer, NAVIGATION_CHAR_UUID, payload.len())
                .await
                .map_err(CentralError::Read)?;
            if chunk.is_empty() {
                return Ok(payload);
            }
            payload.extend_from_slice(&chunk);
        }
        log::warn!(
            "Stopped reading from {} after {} chunks",
            peer,
            self.config.max_read_chunks
        );
        Ok(payload)
    }

    async fn halt_scan(&self, state: &mut CentralState) {
        if self.transport.is_scanning() {
            if let Err(e) = self.transport.stop_scan().await {
                log::warn!("Failed to stop scanning: {}", e);
            }
        }
        if state.phase == CentralPhase::Scanning {
            state.phase = CentralPhase::Idle;
        }
    }

    fn connect_failed(&self, peer: &BleAddress, error: CentralError) -> CentralError {
        log::warn!("Connection to {} failed: {}", peer, error);
        self.emit(CentralUpdate::ConnectFailed {
            peer: peer.clone(),
            error: error.clone(),
        });
        error
    }

    fn emit(&self, update: CentralUpdate) {
        let _ = self.updates.send(update);
    }
}
