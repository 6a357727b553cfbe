//! Navigation message model and binary codec

pub mod direction;
pub mod message;

pub use direction::DirectionCode;
pub use message::{identifier_hint, CodecError, NavigationMessage, HEADER_LEN, IDENTIFIER_LEN};
