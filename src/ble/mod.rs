//! BLE transport layer for the navigation protocol
//!
//! Provides the radio abstraction traits both roles are written against,
//! the shared GATT identifiers, and an in-process simulated radio used by
//! the tests and the CLI.

pub mod gatt;
pub mod simulated;
pub mod transport;

use thiserror::Error;

use transport::AttError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Advertising error: {0}")]
    AdvertisingError(String),

    #[error("Scan error: {0}")]
    ScanError(String),

    #[error("GATT error: {0}")]
    GattError(String),

    #[error("Payload exceeds MTU ({size} > {mtu})")]
    MtuExceeded { size: usize, mtu: usize },

    #[error("ATT error: {0}")]
    Att(AttError),

    #[error("Bluetooth is powered off")]
    PoweredOff,

    #[error("Bluetooth use is not authorized")]
    Unauthorized,

    #[error("Bluetooth LE is not supported")]
    Unsupported,

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Operation timed out")]
    Timeout,
}
