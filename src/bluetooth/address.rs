//! Hardware address of a BLE peripheral.

use std::{fmt, str::FromStr};

use crate::error::LightError;

/// 48-bit peripheral address.
///
/// The text form is six hex byte pairs separated by `:` or `-`, case
/// insensitive (`AA:BB:CC:DD:EE:FF`, `aa-bb-cc-dd-ee-ff`). It always
/// displays as upper-case, colon separated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PeripheralAddress([u8; 6]);

const fn hex_value(c: u8) -> Option<u8> {
   match c {
      b'0'..=b'9' => Some(c - b'0'),
      b'a'..=b'f' => Some(c - b'a' + 10),
      b'A'..=b'F' => Some(c - b'A' + 10),
      _ => None,
   }
}

impl FromStr for PeripheralAddress {
   type Err = LightError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      let invalid = || LightError::InvalidAddress(s.to_string());
      let bytes = s.as_bytes();
      if bytes.len() != 17 {
         return Err(invalid());
      }

      let mut octets = [0u8; 6];
      for (i, octet) in octets.iter_mut().enumerate() {
         let at = i * 3;
         let hi = hex_value(bytes[at]).ok_or_else(invalid)?;
         let lo = hex_value(bytes[at + 1]).ok_or_else(invalid)?;
         if i < 5 && !matches!(bytes[at + 2], b':' | b'-') {
            return Err(invalid());
         }
         *octet = (hi << 4) | lo;
      }
      Ok(Self(octets))
   }
}

impl fmt::Display for PeripheralAddress {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let [a, b, c, d, e, g] = self.0;
      write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
   }
}

#[cfg(feature = "bluez")]
impl From<bluer::Address> for PeripheralAddress {
   fn from(addr: bluer::Address) -> Self {
      Self(addr.0)
   }
}

#[cfg(feature = "bluez")]
impl From<PeripheralAddress> for bluer::Address {
   fn from(addr: PeripheralAddress) -> Self {
      Self(addr.0)
   }
}
