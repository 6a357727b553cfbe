//! GATT service definition for the navigation protocol
//!
//! Service and characteristic identifiers are process-wide constants shared
//! by both roles.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Primary navigation GATT service UUID.
pub const NAVIGATION_SERVICE_UUID: Uuid = Uuid::from_u128(0x71C1E128_D92F_4FA8_A2B2_0F171DB3436C);

/// Characteristic carrying navigation messages (notify + read).
pub const NAVIGATION_CHAR_UUID: Uuid = Uuid::from_u128(0x503DD605_9BCB_4F6E_B235_270A57483026);

/// Optional characteristic a device exposes for heartbeat writes.
pub const HEARTBEAT_CHAR_UUID: Uuid = Uuid::from_u128(0x6D75DBF0_D763_4147_942A_D97B1BC700CF);

/// Properties advertised for a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
}

impl CharacteristicProperties {
    pub const READ: Self = Self {
        read: true,
        write: false,
        notify: false,
    };

    pub const NOTIFY_READ: Self = Self {
        read: true,
        write: false,
        notify: true,
    };

    pub const WRITE: Self = Self {
        read: false,
        write: true,
        notify: false,
    };

    /// A characteristic that can only be read, never pushed.
    pub fn is_read_only(&self) -> bool {
        self.read && !self.notify && !self.write
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub primary: bool,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn characteristic(&self, uuid: Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// The service the peripheral registers: one notify+read characteristic.
pub fn navigation_service() -> GattService {
    GattService {
        uuid: NAVIGATION_SERVICE_UUID,
        primary: true,
        characteristics: vec![GattCharacteristic {
            uuid: NAVIGATION_CHAR_UUID,
            properties: CharacteristicProperties::NOTIFY_READ,
        }],
    }
}
