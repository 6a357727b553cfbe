//! BLE transport trait definitions and core types
//!
//! Defines the abstract radio interface that the peripheral and central
//! services are written against. The simulated network implements it
//! in-process; a platform stack would implement it on real hardware.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::gatt::{CharacteristicProperties, GattCharacteristic, GattService};
use super::BleError;

/// A BLE device address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BleAddress {
    /// A real 6-byte BLE MAC address.
    Real([u8; 6]),
    /// A simulated address identified by UUID.
    Simulated(Uuid),
}

impl fmt::Display for BleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BleAddress::Real(bytes) => {
                let parts: Vec<String> = bytes.iter().map(|b| format!("{:02x}", b)).collect();
                write!(f, "{}", parts.join(":"))
            }
            BleAddress::Simulated(id) => write!(f, "sim:{}", id),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid BLE address: {0}")]
pub struct AddressParseError(pub String);

impl FromStr for BleAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("sim:") {
            return Uuid::parse_str(rest)
                .map(BleAddress::Simulated)
                .map_err(|_| AddressParseError(s.to_string()));
        }

        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(AddressParseError(s.to_string()));
        }
        let mut bytes = [0u8; 6];
        for (slot, part) in bytes.iter_mut().zip(parts) {
            *slot = u8::from_str_radix(part, 16).map_err(|_| AddressParseError(s.to_string()))?;
        }
        Ok(BleAddress::Real(bytes))
    }
}

/// Power/authorization state of the local radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadioState {
    PoweredOn,
    PoweredOff,
    Unauthorized,
    Unsupported,
    Resetting,
    Unknown,
}

/// ATT-level error codes a peripheral answers read requests with.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttError {
    #[error("invalid offset")]
    InvalidOffset,

    #[error("attribute not found")]
    AttributeNotFound,

    #[error("request not supported")]
    RequestNotSupported,
}

/// Channel the core answers a read request on.
pub type ReadResponder = oneshot::Sender<Result<Vec<u8>, AttError>>;

/// Callbacks the radio delivers to the peripheral role, serially.
#[derive(Debug)]
pub enum PeripheralEvent {
    StateChanged(RadioState),
    AdvertisingStarted(Result<(), BleError>),
    Subscribed {
        central: BleAddress,
        characteristic: Uuid,
    },
    Unsubscribed {
        central: BleAddress,
        characteristic: Uuid,
    },
    ReadRequest {
        central: BleAddress,
        characteristic: Uuid,
        offset: usize,
        responder: ReadResponder,
    },
    /// The transmit queue drained after a notification was refused.
    ReadyToUpdateSubscribers,
}

/// Callbacks the radio delivers to the central role, serially.
#[derive(Debug, Clone)]
pub enum CentralEvent {
    StateChanged(RadioState),
    Discovered {
        peer: BleAddress,
        local_name: Option<String>,
        rssi: Option<i16>,
    },
    ValueUpdated {
        peer: BleAddress,
        characteristic: Uuid,
        properties: CharacteristicProperties,
        value: Option<Vec<u8>>,
    },
    Disconnected {
        peer: BleAddress,
    },
    /// Peers handed back by the platform after a relaunch.
    Restored {
        peers: Vec<BleAddress>,
    },
}

/// BLE peripheral role: serving a GATT service and advertising it.
#[async_trait]
pub trait PeripheralTransport: Send + Sync {
    /// Current radio state.
    fn radio_state(&self) -> RadioState;

    /// Whether the host lets this process keep serving in the background.
    fn supports_background_peripheral(&self) -> bool;

    /// Register a GATT service.
    async fn add_service(&self, service: &GattService) -> Result<(), BleError>;

    /// Start advertising a service under a local name.
    async fn start_advertising(&self, service: Uuid, local_name: &str) -> Result<(), BleError>;

    /// Stop advertising.
    async fn stop_advertising(&self) -> Result<(), BleError>;

    fn is_advertising(&self) -> bool;

    /// Push a value to every subscribed central. Returns whether the value was
    /// queued; `false` means a `ReadyToUpdateSubscribers` event will follow.
    async fn notify(&self, characteristic: Uuid, value: &[u8]) -> Result<bool, BleError>;

    /// Centrals that were subscribed before the process was relaunched.
    fn restored_subscribers(&self) -> Vec<BleAddress>;

    /// Take the event stream. Only the first caller gets it.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeripheralEvent>>;
}

/// BLE central role: scanning, connecting and consuming a GATT service.
#[async_trait]
pub trait CentralTransport: Send + Sync {
    fn radio_state(&self) -> RadioState;

    fn is_scanning(&self) -> bool;

    /// Start scanning for peripherals advertising `service`.
    async fn start_scan(&self, service: Uuid) -> Result<(), BleError>;

    async fn stop_scan(&self) -> Result<(), BleError>;

    async fn connect(&self, peer: &BleAddress) -> Result<(), BleError>;

    async fn disconnect(&self, peer: &BleAddress) -> Result<(), BleError>;

    /// Service UUIDs exposed by a connected peer.
    async fn discover_services(&self, peer: &BleAddress) -> Result<Vec<Uuid>, BleError>;

    async fn discover_characteristics(
        &self,
        peer: &BleAddress,
        service: Uuid,
    ) -> Result<Vec<GattCharacteristic>, BleError>;

    /// Enable or disable notifications for a characteristic.
    async fn set_notify(
        &self,
        peer: &BleAddress,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), BleError>;

    /// Read a characteristic value starting at `offset`.
    async fn read(
        &self,
        peer: &BleAddress,
        characteristic: Uuid,
        offset: usize,
    ) -> Result<Vec<u8>, BleError>;

    /// Take the event stream. Only the first caller gets it.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<CentralEvent>>;
}
