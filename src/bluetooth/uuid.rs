//! UUID helpers for Bluetooth SIG short-form identifiers.
//!
//! 16- and 32-bit identifiers are aliases inside the Bluetooth base UUID
//! `0000xxxx-0000-1000-8000-00805f9b34fb`. Canonical text picks the shortest
//! form that still identifies the UUID exactly.

use smol_str::{SmolStr, format_smolstr};
use uuid::Uuid;

/// Bluetooth base UUID with the alias bits cleared.
const BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;
/// Low 96 bits shared by every aliased UUID.
const BASE_MASK: u128 = (1 << 96) - 1;

/// Expands a 16-bit SIG alias to its full UUID.
pub const fn from_u16(short: u16) -> Uuid {
   from_u32(short as u32)
}

/// Expands a 32-bit SIG alias to its full UUID.
pub const fn from_u32(short: u32) -> Uuid {
   Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// Returns the 32-bit alias if the UUID lives in the Bluetooth base range.
pub const fn as_u32(uuid: &Uuid) -> Option<u32> {
   let value = uuid.as_u128();
   if value & BASE_MASK == BASE_UUID {
      Some((value >> 96) as u32)
   } else {
      None
   }
}

/// Returns the 16-bit alias if the UUID fits one.
pub const fn as_u16(uuid: &Uuid) -> Option<u16> {
   match as_u32(uuid) {
      Some(v) if v <= u16::MAX as u32 => Some(v as u16),
      _ => None,
   }
}

/// Renders the comparable text form of a UUID.
///
/// `0x` plus lower-case hex of the 16-bit alias, else of the 32-bit alias,
/// else the full hyphenated UUID without braces.
pub fn canonical(uuid: &Uuid) -> SmolStr {
   if let Some(short) = as_u16(uuid) {
      format_smolstr!("0x{short:x}")
   } else if let Some(short) = as_u32(uuid) {
      format_smolstr!("0x{short:x}")
   } else {
      let mut buf = Uuid::encode_buffer();
      SmolStr::new(uuid.hyphenated().encode_lower(&mut buf))
   }
}
