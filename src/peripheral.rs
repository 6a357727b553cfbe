//! Peripheral role: advertising, subscriptions and the message cache
//!
//! The peripheral announces each new message by notifying subscribers with
//! its 4-byte identifier only. Subscribers then read the full payload from
//! the navigation characteristic, possibly in several offset reads.
//!
//! Two deadlines run alongside: the advertising timeout (for timed
//! advertising windows) and the connection-lost retry, which restarts
//! advertising when no read has been seen for a while after a send.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::ble::gatt::{navigation_service, NAVIGATION_CHAR_UUID, NAVIGATION_SERVICE_UUID};
use crate::ble::transport::{
    AttError, BleAddress, PeripheralEvent, PeripheralTransport, RadioState, ReadResponder,
};
use crate::ble::BleError;
use crate::config::PeripheralConfig;
use crate::navigation::{identifier_hint, NavigationMessage};
use crate::simulator::NavigationSink;
use crate::timer::OneShot;

/// Outcome of an advertising or send request that did not succeed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Bluetooth is turned off")]
    BluetoothTurnedOff,

    #[error("Bluetooth use is not authorized")]
    BluetoothUnauthorized,

    #[error("Bluetooth is in an unknown state")]
    BluetoothUnknownState,

    #[error("Bluetooth LE is unavailable")]
    BluetoothUnavailable,

    #[error("Peripheral service is not set up")]
    NotConfigured,
}

impl ConnectionError {
    fn from_radio(state: RadioState) -> Self {
        match state {
            RadioState::PoweredOff => ConnectionError::BluetoothTurnedOff,
            RadioState::Unauthorized => ConnectionError::BluetoothUnauthorized,
            RadioState::Unknown => ConnectionError::BluetoothUnknownState,
            _ => ConnectionError::BluetoothUnavailable,
        }
    }
}

/// Failures setting the service up. These are configuration problems and
/// are never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeripheralError {
    #[error("Host does not grant background peripheral mode")]
    MissingCapability,

    #[error("Failed to register navigation service: {0}")]
    Registration(BleError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralRole {
    Idle,
    Advertising,
    Subscribed,
}

/// Observer notifications from the peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralUpdate {
    CentralSubscribed(BleAddress),
    AllCentralsUnsubscribed,
    AdvertisingTimedOut,
    AdvertisingFailed(String),
    /// The transport refused the announcement of a cached message. The
    /// message stays readable and the retry timer stays armed.
    NotifyFailed { identifier: u32, reason: String },
}

struct Session {
    service_registered: bool,
    advertising: bool,
    subscribers: HashSet<BleAddress>,
    cache: VecDeque<NavigationMessage>,
    advertising_deadline: OneShot,
    retry_timer: OneShot,
}

impl Session {
    fn new() -> Self {
        Self {
            service_registered: false,
            advertising: false,
            subscribers: HashSet::new(),
            cache: VecDeque::new(),
            advertising_deadline: OneShot::new(),
            retry_timer: OneShot::new(),
        }
    }
}

pub struct PeripheralService {
    me: Weak<Self>,
    transport: Arc<dyn PeripheralTransport>,
    config: PeripheralConfig,
    session: Mutex<Option<Session>>,
    updates: mpsc::UnboundedSender<PeripheralUpdate>,
}

impl PeripheralService {
    pub fn new(
        transport: Arc<dyn PeripheralTransport>,
        config: PeripheralConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PeripheralUpdate>) {
        let (updates, rx) = mpsc::unbounded_channel();
        let service = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            transport,
            config,
            session: Mutex::new(None),
            updates,
        });
        (service, rx)
    }

    /// Spawn the loop that feeds transport events into [`handle_event`].
    /// Returns `None` if the transport's events were already taken.
    ///
    /// [`handle_event`]: PeripheralService::handle_event
    pub fn run(&self) -> Option<JoinHandle<()>> {
        let mut events = self.transport.take_events()?;
        let this = self.me.clone();
        Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(service) = this.upgrade() else { break };
                service.handle_event(event).await;
            }
            log::debug!("Peripheral event loop finished");
        }))
    }

    /// Create the session and register the navigation service. Registration
    /// is deferred until the radio powers on if it is not on yet. Calling
    /// this on a set-up service does nothing.
    pub async fn set_up_service(&self) -> Result<(), PeripheralError> {
        if !self.transport.supports_background_peripheral() {
            log::error!("Background peripheral mode is not enabled for this host");
            return Err(PeripheralError::MissingCapability);
        }

        let mut guard = self.session.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let mut session = Session::new();
        let restored = self.transport.restored_subscribers();
        if !restored.is_empty() {
            log::info!("Restored {} subscribed central(s)", restored.len());
            session.subscribers.extend(restored);
        }

        if self.transport.radio_state() == RadioState::PoweredOn {
            self.transport
                .add_service(&navigation_service())
                .await
                .map_err(PeripheralError::Registration)?;
            session.service_registered = true;
            log::info!("Navigation service registered");
        }

        *guard = Some(session);
        Ok(())
    }

    /// Set the service up if the host was relaunched to restore BLE state.
    /// Returns whether the service was set up.
    pub async fn restore_launch(&self, launched_for_ble_restore: bool) -> bool {
        if !launched_for_ble_restore {
            return false;
        }
        match self.set_up_service().await {
            Ok(()) => true,
            Err(e) => {
                log::error!("Could not restore peripheral: {}", e);
                false
            }
        }
    }

    /// Start (or restart) advertising. With `with_timeout` advertising is
    /// stopped again after the configured window.
    pub async fn start_advertising(&self, with_timeout: bool) -> Result<(), ConnectionError> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(ConnectionError::NotConfigured)?;
        self.advertise(session, with_timeout).await
    }

    pub async fn stop_advertising(&self) {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_mut() {
            self.halt_advertising(session).await;
        }
    }

    /// Cache `message` and announce it to subscribers by identifier.
    pub async fn send_message(&self, message: NavigationMessage) -> Result<(), ConnectionError> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(ConnectionError::NotConfigured)?;

        let radio = self.transport.radio_state();
        if radio != RadioState::PoweredOn {
            return Err(ConnectionError::from_radio(radio));
        }

        if !session.retry_timer.is_armed() {
            self.arm_retry(session);
        }

        let identifier = message.identifier;
        session.cache.push_back(message);
        while session.cache.len() > self.config.cache_capacity {
            session.cache.pop_front();
        }

        match self
            .transport
            .notify(NAVIGATION_CHAR_UUID, &identifier_hint(identifier))
            .await
        {
            Ok(true) => log::info!("Sent message #{:08x}", identifier),
            Ok(false) => log::info!("Queued message #{:08x} behind a full queue", identifier),
            Err(e) => self.notify_failed(identifier, e),
        }
        Ok(())
    }

    /// Tear the session down: cancel both deadlines, drop the cache and
    /// stop advertising. Safe to call repeatedly.
    pub async fn stop_service(&self) {
        let mut guard = self.session.lock().await;
        if let Some(mut session) = guard.take() {
            session.advertising_deadline.cancel();
            session.retry_timer.cancel();
            if let Err(e) = self.transport.stop_advertising().await {
                log::warn!("Failed to stop advertising: {}", e);
            }
            log::info!("Peripheral service stopped");
        }
    }

    pub async fn role(&self) -> PeripheralRole {
        match self.session.lock().await.as_ref() {
            None => PeripheralRole::Idle,
            Some(session) if !session.subscribers.is_empty() => PeripheralRole::Subscribed,
            Some(session) if session.advertising => PeripheralRole::Advertising,
            Some(_) => PeripheralRole::Idle,
        }
    }

    /// Number of messages currently cached.
    pub async fn cached_messages(&self) -> usize {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.cache.len())
            .unwrap_or(0)
    }

    pub async fn handle_event(&self, event: PeripheralEvent) {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_mut() else {
            // Torn down: answer reads so the requester is not left waiting.
            if let PeripheralEvent::ReadRequest { responder, .. } = event {
                let _ = responder.send(Err(AttError::AttributeNotFound));
            }
            return;
        };

        match event {
            PeripheralEvent::StateChanged(RadioState::PoweredOn) => {
                log::info!("Radio powered on");
                if !session.service_registered {
                    match self.transport.add_service(&navigation_service()).await {
                        Ok(()) => session.service_registered = true,
                        Err(e) => {
                            log::error!("Failed to register navigation service: {}", e);
                            return;
                        }
                    }
                }
                if session.subscribers.is_empty() {
                    if let Err(e) = self.advertise(session, false).await {
                        log::warn!("Could not advertise after power on: {}", e);
                    }
                }
            }
            PeripheralEvent::StateChanged(state) => {
                log::warn!("Radio state changed to {:?}", state);
                session.advertising = false;
                session.advertising_deadline.cancel();
                // The radio drops every link without unsubscribing.
                if !session.subscribers.is_empty() {
                    log::info!("Dropping {} subscriber(s)", session.subscribers.len());
                    session.subscribers.clear();
                    self.emit(PeripheralUpdate::AllCentralsUnsubscribed);
                }
            }
            PeripheralEvent::AdvertisingStarted(Ok(())) => {
                log::debug!("Advertising started");
            }
            PeripheralEvent::AdvertisingStarted(Err(e)) => {
                log::error!("Advertising failed: {}", e);
                session.advertising = false;
                self.emit(PeripheralUpdate::AdvertisingFailed(e.to_string()));
            }
            PeripheralEvent::Subscribed {
                central,
                characteristic,
            } => {
                if characteristic != NAVIGATION_CHAR_UUID {
                    log::debug!("Ignoring subscription to {}", characteristic);
                    return;
                }
                log::info!("Central {} subscribed", central);
                self.halt_advertising(session).await;
                session.retry_timer.cancel();
                session.subscribers.insert(central.clone());
                self.emit(PeripheralUpdate::CentralSubscribed(central));
            }
            PeripheralEvent::Unsubscribed {
                central,
                characteristic,
            } => {
                if characteristic != NAVIGATION_CHAR_UUID {
                    return;
                }
                if !session.subscribers.remove(&central) {
                    return;
                }
                log::info!("Central {} unsubscribed", central);
                if session.subscribers.is_empty() {
                    self.emit(PeripheralUpdate::AllCentralsUnsubscribed);
                    match self.advertise(session, false).await {
                        Ok(()) => {}
                        Err(ConnectionError::BluetoothTurnedOff) => self.arm_retry(session),
                        Err(e) => {
                            log::warn!("Could not restart advertising: {}", e);
                            self.emit(PeripheralUpdate::AdvertisingFailed(e.to_string()));
                        }
                    }
                }
            }
            PeripheralEvent::ReadRequest {
                central,
                characteristic,
                offset,
                responder,
            } => {
                self.answer_read(session, &central, characteristic, offset, responder);
            }
            PeripheralEvent::ReadyToUpdateSubscribers => {
                let Some(identifier) = session.cache.back().map(|m| m.identifier) else {
                    return;
                };
                match self
                    .transport
                    .notify(NAVIGATION_CHAR_UUID, &identifier_hint(identifier))
                    .await
                {
                    Ok(true) => log::info!("Re-announced message #{:08x}", identifier),
                    Ok(false) => log::debug!("Transmit queue still full"),
                    Err(e) => self.notify_failed(identifier, e),
                }
            }
        }
    }

    fn answer_read(
        &self,
        session: &mut Session,
        central: &BleAddress,
        characteristic: Uuid,
        offset: usize,
        responder: ReadResponder,
    ) {
        if characteristic != NAVIGATION_CHAR_UUID {
            log::error!("Read of unknown characteristic {} from {}", characteristic, central);
            let _ = responder.send(Err(AttError::AttributeNotFound));
            return;
        }

        let Some(latest) = session.cache.back() else {
            log::warn!("Read from {} with nothing cached", central);
            let _ = responder.send(Err(AttError::AttributeNotFound));
            return;
        };

        let payload = latest.encode();
        if offset > payload.len() {
            log::warn!(
                "Read from {} at offset {} past payload of {} bytes",
                central,
                offset,
                payload.len()
            );
            let _ = responder.send(Err(AttError::InvalidOffset));
            return;
        }

        let chunk = payload[offset..].to_vec();
        log::debug!("Serving {} at offset {} to {}", hex::encode(&chunk), offset, central);
        let _ = responder.send(Ok(chunk));
        self.arm_retry(session);
    }

    async fn advertise(
        &self,
        session: &mut Session,
        with_timeout: bool,
    ) -> Result<(), ConnectionError> {
        let radio = self.transport.radio_state();
        if radio != RadioState::PoweredOn {
            return Err(ConnectionError::from_radio(radio));
        }

        if self.transport.is_advertising() {
            self.halt_advertising(session).await;
        }

        self.transport
            .start_advertising(NAVIGATION_SERVICE_UUID, &self.config.local_name)
            .await
            .map_err(|e| {
                log::warn!("Transport refused to advertise: {}", e);
                match e {
                    BleError::PoweredOff => ConnectionError::BluetoothTurnedOff,
                    BleError::Unauthorized => ConnectionError::BluetoothUnauthorized,
                    _ => ConnectionError::BluetoothUnavailable,
                }
            })?;
        session.advertising = true;

        if with_timeout {
            self.arm_advertising_deadline(session);
        } else {
            session.advertising_deadline.cancel();
        }
        log::info!("Advertising as {:?}", self.config.local_name);
        Ok(())
    }

    async fn halt_advertising(&self, session: &mut Session) {
        session.advertising_deadline.cancel();
        if self.transport.is_advertising() {
            if let Err(e) = self.transport.stop_advertising().await {
                log::warn!("Failed to stop advertising: {}", e);
            } else {
                log::info!("Stopped advertising");
            }
        }
        session.advertising = false;
    }

    fn emit(&self, update: PeripheralUpdate) {
        let _ = self.updates.send(update);
    }

    fn notify_failed(&self, identifier: u32, error: BleError) {
        log::warn!("Failed to announce message #{:08x}: {}", identifier, error);
        self.emit(PeripheralUpdate::NotifyFailed {
            identifier,
            reason: error.to_string(),
        });
    }

    fn arm_advertising_deadline(&self, session: &mut Session) {
        let this = self.me.clone();
        session
            .advertising_deadline
            .schedule(self.config.advertising_timeout, move |token| async move {
                if let Some(service) = this.upgrade() {
                    service.on_advertising_deadline(token).await;
                }
            });
    }

    fn arm_retry(&self, session: &mut Session) {
        let this = self.me.clone();
        session
            .retry_timer
            .schedule(self.config.connection_lost_retry, move |token| async move {
                if let Some(service) = this.upgrade() {
                    service.on_retry_timer(token).await;
                }
            });
    }

    async fn on_advertising_deadline(&self, token: u64) {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_mut() else { return };
        if !session.advertising_deadline.fire(token) {
            return;
        }
        log::info!("Advertising window elapsed");
        self.halt_advertising(session).await;
        self.emit(PeripheralUpdate::AdvertisingTimedOut);
    }

    async fn on_retry_timer(&self, token: u64) {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_mut() else { return };
        if !session.retry_timer.fire(token) {
            return;
        }
        log::info!("No read seen since last send, restarting advertising");
        match self.advertise(session, false).await {
            Ok(()) => {}
            Err(ConnectionError::BluetoothTurnedOff) => self.arm_retry(session),
            Err(e) => log::warn!("Giving up on advertising restart: {}", e),
        }
    }
}

#[async_trait]
impl NavigationSink for PeripheralService {
    async fn send_message(&self, message: NavigationMessage) -> Result<(), ConnectionError> {
        PeripheralService::send_message(self, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::simulated::{SimBleNetwork, SimPeripheral};
    use crate::ble::transport::{CentralEvent, CentralTransport};
    use crate::navigation::DirectionCode;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn message(n: u32) -> NavigationMessage {
        let street = format!("Street {}", n);
        NavigationMessage::with_identifier(n, DirectionCode::TurnLeft, n * 10, street)
    }

    async fn setup() -> (
        Arc<SimBleNetwork>,
        Arc<SimPeripheral>,
        Arc<PeripheralService>,
        mpsc::UnboundedReceiver<PeripheralUpdate>,
    ) {
        let network = SimBleNetwork::new();
        let transport = Arc::new(network.create_peripheral());
        let (service, updates) =
            PeripheralService::new(transport.clone(), PeripheralConfig::default());
        service.set_up_service().await.unwrap();
        (network, transport, service, updates)
    }

    async fn read(service: &Arc<PeripheralService>, offset: usize) -> Result<Vec<u8>, AttError> {
        let (responder, response) = oneshot::channel();
        service
            .handle_event(PeripheralEvent::ReadRequest {
                central: BleAddress::Simulated(Uuid::nil()),
                characteristic: NAVIGATION_CHAR_UUID,
                offset,
                responder,
            })
            .await;
        response.await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_capability_is_a_setup_error() {
        let network = SimBleNetwork::new();
        let transport = Arc::new(network.create_peripheral());
        transport.set_background_capable(false);
        let (service, _updates) = PeripheralService::new(transport, PeripheralConfig::default());

        assert_eq!(
            service.set_up_service().await,
            Err(PeripheralError::MissingCapability)
        );
        assert!(!service.restore_launch(true).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_configured_before_setup() {
        let network = SimBleNetwork::new();
        let transport = Arc::new(network.create_peripheral());
        let (service, _updates) = PeripheralService::new(transport, PeripheralConfig::default());

        assert_eq!(
            service.send_message(message(1)).await,
            Err(ConnectionError::NotConfigured)
        );
        assert_eq!(
            service.start_advertising(false).await,
            Err(ConnectionError::NotConfigured)
        );
        assert!(!service.restore_launch(false).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_evicts_oldest_after_capacity() {
        let (_network, _transport, service, _updates) = setup().await;

        for n in 1..=11 {
            service.send_message(message(n)).await.unwrap();
        }
        assert_eq!(service.cached_messages().await, 10);

        let guard = service.session.lock().await;
        let cache = &guard.as_ref().unwrap().cache;
        assert_eq!(cache.front().unwrap().identifier, 2);
        assert_eq!(cache.back().unwrap().identifier, 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_serves_latest_message_from_offset() {
        let (_network, _transport, service, _updates) = setup().await;

        assert_eq!(read(&service, 0).await, Err(AttError::AttributeNotFound));

        service.send_message(message(1)).await.unwrap();
        service.send_message(message(2)).await.unwrap();
        let payload = message(2).encode();

        assert_eq!(read(&service, 0).await.unwrap(), payload);
        assert_eq!(read(&service, 5).await.unwrap(), payload[5..].to_vec());
        assert_eq!(read(&service, payload.len()).await.unwrap(), Vec::<u8>::new());
        assert_eq!(
            read(&service, payload.len() + 1).await,
            Err(AttError::InvalidOffset)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_of_other_characteristic_is_not_found() {
        let (_network, _transport, service, _updates) = setup().await;
        service.send_message(message(1)).await.unwrap();

        let (responder, response) = oneshot::channel();
        service
            .handle_event(PeripheralEvent::ReadRequest {
                central: BleAddress::Simulated(Uuid::nil()),
                characteristic: Uuid::new_v4(),
                offset: 0,
                responder,
            })
            .await;
        assert_eq!(response.await.unwrap(), Err(AttError::AttributeNotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_reports_radio_state() {
        let (_network, transport, service, _updates) = setup().await;

        transport.set_radio_state(RadioState::PoweredOff);
        assert_eq!(
            service.send_message(message(1)).await,
            Err(ConnectionError::BluetoothTurnedOff)
        );
        transport.set_radio_state(RadioState::Unauthorized);
        assert_eq!(
            service.start_advertising(true).await,
            Err(ConnectionError::BluetoothUnauthorized)
        );
        transport.set_radio_state(RadioState::Unknown);
        assert_eq!(
            service.start_advertising(true).await,
            Err(ConnectionError::BluetoothUnknownState)
        );
        transport.set_radio_state(RadioState::Unsupported);
        assert_eq!(
            service.start_advertising(true).await,
            Err(ConnectionError::BluetoothUnavailable)
        );
        assert_eq!(service.cached_messages().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_advertising_stops_after_window() {
        let (_network, transport, service, mut updates) = setup().await;

        service.start_advertising(true).await.unwrap();
        assert!(transport.is_advertising());
        assert_eq!(service.role().await, PeripheralRole::Advertising);

        tokio::time::sleep(Duration::from_secs(119)).await;
        assert!(transport.is_advertising());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!transport.is_advertising());
        assert_eq!(updates.recv().await, Some(PeripheralUpdate::AdvertisingTimedOut));
        assert_eq!(service.role().await, PeripheralRole::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_untimed_restart_cancels_deadline() {
        let (_network, transport, service, _updates) = setup().await;

        service.start_advertising(true).await.unwrap();
        service.start_advertising(false).await.unwrap();

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(transport.is_advertising());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_stops_advertising_and_last_unsubscribe_readvertises() {
        let (_network, transport, service, mut updates) = setup().await;
        service.start_advertising(true).await.unwrap();

        let central = BleAddress::Simulated(Uuid::new_v4());
        service
            .handle_event(PeripheralEvent::Subscribed {
                central: central.clone(),
                characteristic: NAVIGATION_CHAR_UUID,
            })
            .await;
        assert!(!transport.is_advertising());
        assert_eq!(service.role().await, PeripheralRole::Subscribed);
        assert_eq!(
            updates.recv().await,
            Some(PeripheralUpdate::CentralSubscribed(central.clone()))
        );

        for _ in 0..2 {
            service
                .handle_event(PeripheralEvent::Unsubscribed {
                    central: central.clone(),
                    characteristic: NAVIGATION_CHAR_UUID,
                })
                .await;
        }

        assert_eq!(updates.recv().await, Some(PeripheralUpdate::AllCentralsUnsubscribed));
        assert!(updates.try_recv().is_err());
        assert!(transport.is_advertising());
        assert_eq!(service.role().await, PeripheralRole::Advertising);

        // The restart is untimed.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(transport.is_advertising());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_timer_readvertises_without_reads() {
        let (_network, transport, service, _updates) = setup().await;

        service.send_message(message(1)).await.unwrap();
        assert!(!transport.is_advertising());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(transport.is_advertising());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_rearms_retry_timer() {
        let (_network, transport, service, _updates) = setup().await;

        service.send_message(message(1)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;
        read(&service, 0).await.unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!transport.is_advertising());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(transport.is_advertising());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_keeps_trying_while_radio_is_off() {
        let (_network, transport, service, _updates) = setup().await;
        service.send_message(message(1)).await.unwrap();

        transport.set_radio_state(RadioState::PoweredOff);
        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(!transport.is_advertising());
        assert!(service.session.lock().await.as_ref().unwrap().retry_timer.is_armed());

        transport.set_radio_state(RadioState::PoweredOn);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(transport.is_advertising());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_on_unauthorized() {
        let (_network, transport, service, _updates) = setup().await;
        service.send_message(message(1)).await.unwrap();

        transport.set_radio_state(RadioState::Unauthorized);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!service.session.lock().await.as_ref().unwrap().retry_timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_service_cancels_everything() {
        let (_network, transport, service, mut updates) = setup().await;
        service.start_advertising(true).await.unwrap();
        service.send_message(message(1)).await.unwrap();

        service.stop_service().await;
        service.stop_service().await;
        assert!(!transport.is_advertising());
        assert_eq!(service.cached_messages().await, 0);
        assert_eq!(service.role().await, PeripheralRole::Idle);

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(!transport.is_advertising());
        assert!(updates.try_recv().is_err());

        // Reads after teardown are still answered.
        assert_eq!(read(&service, 0).await, Err(AttError::AttributeNotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_announcement_is_reported() {
        let (_network, transport, service, mut updates) = setup().await;
        // Too small for even the identifier hint.
        transport.set_mtu(6);

        service.send_message(message(7)).await.unwrap();
        match updates.recv().await {
            Some(PeripheralUpdate::NotifyFailed { identifier, .. }) => assert_eq!(identifier, 7),
            other => panic!("unexpected update {:?}", other),
        }
        assert_eq!(service.cached_messages().await, 1);
        assert_eq!(read(&service, 0).await.unwrap(), message(7).encode());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drained_queue_reannounces_identifier_only() {
        let (network, transport, service, mut updates) = setup().await;
        service.start_advertising(false).await.unwrap();
        let central = network.create_central();
        let mut central_events = central.take_events().unwrap();
        central.connect(transport.address()).await.unwrap();
        central
            .set_notify(transport.address(), NAVIGATION_CHAR_UUID, true)
            .await
            .unwrap();

        let long = NavigationMessage::with_identifier(
            9,
            DirectionCode::TurnStraight,
            1_200,
            "Kiepenheuerallee in Potsdam-Bornstedt",
        );
        transport.set_transmit_queue_full(true);
        service.send_message(long).await.unwrap();
        transport.set_transmit_queue_full(false);

        service
            .handle_event(PeripheralEvent::ReadyToUpdateSubscribers)
            .await;
        match central_events.recv().await.unwrap() {
            CentralEvent::ValueUpdated { value, .. } => {
                assert_eq!(value, Some(identifier_hint(9).to_vec()))
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_radio_loss_drops_subscribers() {
        let (_network, transport, service, mut updates) = setup().await;
        let _event_loop = service.run().unwrap();

        let central = BleAddress::Simulated(Uuid::new_v4());
        service
            .handle_event(PeripheralEvent::Subscribed {
                central: central.clone(),
                characteristic: NAVIGATION_CHAR_UUID,
            })
            .await;
        assert_eq!(
            updates.recv().await,
            Some(PeripheralUpdate::CentralSubscribed(central))
        );

        transport.set_radio_state(RadioState::PoweredOff);
        assert_eq!(updates.recv().await, Some(PeripheralUpdate::AllCentralsUnsubscribed));
        assert_eq!(service.role().await, PeripheralRole::Idle);

        transport.set_radio_state(RadioState::PoweredOn);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(transport.is_advertising());
        assert_eq!(service.role().await, PeripheralRole::Advertising);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restored_subscribers_are_merged() {
        let network = SimBleNetwork::new();
        let transport = Arc::new(network.create_peripheral());
        let restored = BleAddress::Simulated(Uuid::new_v4());
        transport.set_restored_subscribers(vec![restored]);
        let (service, _updates) = PeripheralService::new(transport, PeripheralConfig::default());

        assert!(service.restore_launch(true).await);
        assert_eq!(service.role().await, PeripheralRole::Subscribed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_on_registers_and_advertises() {
        let network = SimBleNetwork::new();
        let transport = Arc::new(network.create_peripheral());
        transport.set_radio_state(RadioState::PoweredOff);
        let (service, _updates) =
            PeripheralService::new(transport.clone(), PeripheralConfig::default());
        let _event_loop = service.run().unwrap();

        service.set_up_service().await.unwrap();
        assert!(!transport.is_advertising());

        transport.set_radio_state(RadioState::PoweredOn);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(transport.is_advertising());

        let central = network.create_central();
        central.start_scan(NAVIGATION_SERVICE_UUID).await.unwrap();
        central.connect(transport.address()).await.unwrap();
    }
}
