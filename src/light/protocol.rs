//! Triones/HappyLight protocol definitions.
//!
//! The controllers take fixed-size command frames written to a single GATT
//! characteristic with the ATT write command. Nothing is acknowledged, so the
//! only detectable failure is not having a characteristic to write to.
//!
//! Frame layout reference: <https://gitlab.com/madhead/saberlight/-/blob/master/protocols/Triones/protocol.md>

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use uuid::Uuid;

use crate::bluetooth::uuid::from_u16;

/// Encoded command frame. Every frame fits inline.
pub type Packet = SmallVec<[u8; 8]>;

/// Primary service carrying the control characteristic.
pub const LED_SERVICE_UUID: Uuid = from_u16(0xffd5);
/// Characteristic the command frames are written to.
pub const LED_CONTROL_UUID: Uuid = from_u16(0xffd9);

pub const HDR_SET_COLOR: u8 = 0x56;
pub const TRL_SET_COLOR: &[u8] = &[0x00, 0xF0, 0xAA];
pub const PKT_POWER_ON: &[u8] = &[0xCC, 0x23, 0x33];
pub const PKT_POWER_OFF: &[u8] = &[0xCC, 0x24, 0x33];

/// Length of a color frame.
pub const SET_COLOR_LEN: usize = 7;

/// One RGB color value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rgb {
   pub red: u8,
   pub green: u8,
   pub blue: u8,
}

impl Rgb {
   pub const BLACK: Self = Self::new(0, 0, 0);

   pub const fn new(red: u8, green: u8, blue: u8) -> Self {
      Self { red, green, blue }
   }
}

/// A command issued to a light.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
pub enum Frame {
   #[strum(serialize = "set_color")]
   SetColor(Rgb),
   #[strum(serialize = "power_on")]
   PowerOn,
   #[strum(serialize = "power_off")]
   PowerOff,
}

impl Frame {
   /// Builds a color frame from the first color of a sequence.
   ///
   /// The protocol addresses a single logical light per write, so any
   /// further colors are ignored.
   pub fn from_colors(colors: &[Rgb]) -> Option<Self> {
      colors.first().copied().map(Self::SetColor)
   }

   /// Encodes the frame into its wire bytes.
   pub fn encode(self) -> Packet {
      match self {
         Self::SetColor(Rgb { red, green, blue }) => [HDR_SET_COLOR, red, green, blue]
            .into_iter()
            .chain(TRL_SET_COLOR.iter().copied())
            .collect(),
         Self::PowerOn => Packet::from_slice(PKT_POWER_ON),
         Self::PowerOff => Packet::from_slice(PKT_POWER_OFF),
      }
   }
}
