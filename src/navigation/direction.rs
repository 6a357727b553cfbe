//! Direction codes carried in the navigation message
//!
//! The numeric value of each variant is the byte on the wire. The order is
//! part of the protocol and must never be renumbered.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DirectionCode {
    Unknown = 0,
    TurnStraight,
    Start,
    Finish,
    TurnSlightLeft,
    TurnLeft,
    TurnSharpLeft,
    TurnSharpRight,
    TurnRight,
    TurnSlightRight,
    TurnForkRight,
    TurnForkLeft,
    TurnU,
    Poi,
    Roundabout,
    ExitRoundaboutLeft,
    ExitRoundaboutRight,
    RoundaboutCCW11,
    RoundaboutCCW12,
    RoundaboutCCW13,
    RoundaboutCCW22,
    RoundaboutCCW23,
    RoundaboutCCW33,
    RoundaboutCW11,
    RoundaboutCW12,
    RoundaboutCW13,
    RoundaboutCW22,
    RoundaboutCW23,
    RoundaboutCW33,
    RoundaboutFallback,
    LeftRoute,
}

impl DirectionCode {
    /// Number of codes in the enumeration.
    pub const COUNT: u8 = 31;

    /// All codes in wire order.
    pub const ALL: [DirectionCode; 31] = [
        DirectionCode::Unknown,
        DirectionCode::TurnStraight,
        DirectionCode::Start,
        DirectionCode::Finish,
        DirectionCode::TurnSlightLeft,
        DirectionCode::TurnLeft,
        DirectionCode::TurnSharpLeft,
        DirectionCode::TurnSharpRight,
        DirectionCode::TurnRight,
        DirectionCode::TurnSlightRight,
        DirectionCode::TurnForkRight,
        DirectionCode::TurnForkLeft,
        DirectionCode::TurnU,
        DirectionCode::Poi,
        DirectionCode::Roundabout,
        DirectionCode::ExitRoundaboutLeft,
        DirectionCode::ExitRoundaboutRight,
        DirectionCode::RoundaboutCCW11,
        DirectionCode::RoundaboutCCW12,
        DirectionCode::RoundaboutCCW13,
        DirectionCode::RoundaboutCCW22,
        DirectionCode::RoundaboutCCW23,
        DirectionCode::RoundaboutCCW33,
        DirectionCode::RoundaboutCW11,
        DirectionCode::RoundaboutCW12,
        DirectionCode::RoundaboutCW13,
        DirectionCode::RoundaboutCW22,
        DirectionCode::RoundaboutCW23,
        DirectionCode::RoundaboutCW33,
        DirectionCode::RoundaboutFallback,
        DirectionCode::LeftRoute,
    ];

    /// Look up a code by its wire byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.get(byte as usize).copied()
    }

    /// Like [`from_byte`](Self::from_byte), substituting `Unknown` for
    /// out-of-range bytes.
    pub fn from_byte_lossy(byte: u8) -> Self {
        Self::from_byte(byte).unwrap_or(DirectionCode::Unknown)
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Resolve the generic `Roundabout` code from the icon a route export
    /// names. Unrecognised icons fall back to `RoundaboutFallback`.
    pub fn from_roundabout_icon(icon: &str) -> Self {
        match icon {
            "ic_nav_roundabout_ccw1_1" => DirectionCode::RoundaboutCCW11,
            "ic_nav_roundabout_ccw1_2" => DirectionCode::RoundaboutCCW12,
            "ic_nav_roundabout_ccw1_3" => DirectionCode::RoundaboutCCW13,
            "ic_nav_roundabout_ccw2_2" => DirectionCode::RoundaboutCCW22,
            "ic_nav_roundabout_ccw2_3" => DirectionCode::RoundaboutCCW23,
            "ic_nav_roundabout_ccw3_3" => DirectionCode::RoundaboutCCW33,
            "ic_nav_roundabout_cw1_1" => DirectionCode::RoundaboutCW11,
            "ic_nav_roundabout_cw1_2" => DirectionCode::RoundaboutCW12,
            "ic_nav_roundabout_cw1_3" => DirectionCode::RoundaboutCW13,
            "ic_nav_roundabout_cw2_2" => DirectionCode::RoundaboutCW22,
            "ic_nav_roundabout_cw2_3" => DirectionCode::RoundaboutCW23,
            "ic_nav_roundabout_cw3_3" => DirectionCode::RoundaboutCW33,
            "ic_nav_roundabout_exit_ccw" => DirectionCode::ExitRoundaboutRight,
            "ic_nav_roundabout_exit_cw" => DirectionCode::ExitRoundaboutLeft,
            _ => DirectionCode::RoundaboutFallback,
        }
    }

    /// Icon a receiving device shows for this code, if any.
    pub fn icon_name(self) -> Option<&'static str> {
        let name = match self {
            DirectionCode::TurnStraight => "ic_nav_arrow_keep_going",
            DirectionCode::Start => "ic_nav_arrow_start",
            DirectionCode::Finish => "ic_nav_arrow_finish",
            DirectionCode::LeftRoute => "ic_nav_outof_route",
            DirectionCode::TurnLeft => "ic_nav_arrow_turn_left",
            DirectionCode::TurnRight => "ic_nav_arrow_turn_right",
            DirectionCode::TurnU => "ic_nav_arrow_uturn",
            DirectionCode::TurnForkLeft => "ic_nav_arrow_fork_left",
            DirectionCode::TurnForkRight => "ic_nav_arrow_fork_right",
            DirectionCode::TurnSharpRight => "ic_nav_arrow_turn_hard_right",
            DirectionCode::TurnSharpLeft => "ic_nav_arrow_turn_hard_left",
            DirectionCode::TurnSlightLeft => "ic_nav_arrow_keep_left",
            DirectionCode::TurnSlightRight => "ic_nav_arrow_keep_right",
            DirectionCode::RoundaboutCCW11 => "ic_nav_roundabout_ccw1_1",
            DirectionCode::RoundaboutCCW12 => "ic_nav_roundabout_ccw1_2",
            DirectionCode::RoundaboutCCW13 => "ic_nav_roundabout_ccw1_3",
            DirectionCode::RoundaboutCCW22 => "ic_nav_roundabout_ccw2_2",
            DirectionCode::RoundaboutCCW23 => "ic_nav_roundabout_ccw2_3",
            DirectionCode::RoundaboutCCW33 => "ic_nav_roundabout_ccw3_3",
            DirectionCode::RoundaboutCW11 => "ic_nav_roundabout_cw1_1",
            DirectionCode::RoundaboutCW12 => "ic_nav_roundabout_cw1_2",
            DirectionCode::RoundaboutCW13 => "ic_nav_roundabout_cw1_3",
            DirectionCode::RoundaboutCW22 => "ic_nav_roundabout_cw2_2",
            DirectionCode::RoundaboutCW23 => "ic_nav_roundabout_cw2_3",
            DirectionCode::RoundaboutCW33 => "ic_nav_roundabout_cw3_3",
            DirectionCode::ExitRoundaboutLeft => "ic_nav_roundabout_exit_cw",
            DirectionCode::ExitRoundaboutRight => "ic_nav_roundabout_exit_ccw",
            DirectionCode::RoundaboutFallback => "ic_nav_roundabout_fallback",
            DirectionCode::Unknown | DirectionCode::Poi | DirectionCode::Roundabout => {
                return None
            }
        };
        Some(name)
    }
}
