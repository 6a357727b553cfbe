//! Navigation message wire format
//!
//! ```text
//! [0-3]  : identifier  (u32 little-endian)
//! [4]    : direction   (DirectionCode byte)
//! [5-8]  : distance    (u32 little-endian, metres)
//! [9..]  : street name (raw UTF-8, length = payload length - 9)
//! ```
//!
//! Notifications carry only the 4-byte identifier; the full payload is
//! fetched by an explicit read.

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::direction::DirectionCode;

/// Size of the fixed header: identifier, direction and distance.
pub const HEADER_LEN: usize = 9;

/// Size of the notification hint.
pub const IDENTIFIER_LEN: usize = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Truncated message: {len} bytes, need at least 9")]
    TruncatedMessage { len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationMessage {
    /// Opaque per-message token, used for liveness and dedup only.
    pub identifier: u32,
    pub direction: DirectionCode,
    pub distance_m: u32,
    pub street_name: String,
}

impl NavigationMessage {
    /// Build an outbound message with a fresh random identifier.
    pub fn new(direction: DirectionCode, distance_m: u32, street_name: impl Into<String>) -> Self {
        Self::with_identifier(rand::random(), direction, distance_m, street_name)
    }

    pub fn with_identifier(
        identifier: u32,
        direction: DirectionCode,
        distance_m: u32,
        street_name: impl Into<String>,
    ) -> Self {
        Self {
            identifier,
            direction,
            distance_m,
            street_name: street_name.into(),
        }
    }

    /// Size of this message on the wire.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.street_name.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32_le(self.identifier);
        buf.put_u8(self.direction.as_byte());
        buf.put_u32_le(self.distance_m);
        buf.put_slice(self.street_name.as_bytes());
        buf.to_vec()
    }

    /// Decode a full payload. Unknown direction bytes decode as `Unknown`;
    /// invalid UTF-8 in the street name is replaced rather than rejected.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < HEADER_LEN {
            return Err(CodecError::TruncatedMessage { len: data.len() });
        }

        let mut buf = data;
        let identifier = buf.get_u32_le();
        let direction = DirectionCode::from_byte_lossy(buf.get_u8());
        let distance_m = buf.get_u32_le();
        let street_name = String::from_utf8_lossy(buf).into_owned();

        Ok(Self {
            identifier,
            direction,
            distance_m,
            street_name,
        })
    }
}

impl fmt::Display for NavigationMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let street = if self.street_name.is_empty() {
            "NONE"
        } else {
            self.street_name.as_str()
        };
        write!(
            f,
            "#{:08x} {:?} {}m {}",
            self.identifier, self.direction, self.distance_m, street
        )
    }
}

/// The notification payload announcing a message: its identifier only.
pub fn identifier_hint(identifier: u32) -> [u8; IDENTIFIER_LEN] {
    identifier.to_le_bytes()
}
