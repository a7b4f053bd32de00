//! GATT service and characteristic descriptors.
//!
//! Descriptors are snapshots taken while a session discovers a peripheral.
//! The display helpers render them for diagnostics.

use std::fmt;

use serde_json::json;
use smallvec::SmallVec;
use smol_str::{SmolStr, format_smolstr};
use uuid::Uuid;

use crate::bluetooth::{ServiceState, uuid::canonical};

/// Characteristic properties bitmask, bit values as in the GATT declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct CharProps(u8);

impl CharProps {
   pub const BROADCAST: u8 = 0x01;
   pub const READ: u8 = 0x02;
   pub const WRITE_NO_RESPONSE: u8 = 0x04;
   pub const WRITE: u8 = 0x08;
   pub const NOTIFY: u8 = 0x10;
   pub const INDICATE: u8 = 0x20;
   pub const WRITE_SIGNED: u8 = 0x40;
   pub const EXTENDED_PROPERTY: u8 = 0x80;

   /// Display order of the property names.
   const NAMES: [(u8, &'static str); 8] = [
      (Self::READ, "Read"),
      (Self::WRITE, "Write"),
      (Self::NOTIFY, "Notify"),
      (Self::INDICATE, "Indicate"),
      (Self::EXTENDED_PROPERTY, "ExtendedProperty"),
      (Self::BROADCAST, "Broadcast"),
      (Self::WRITE_NO_RESPONSE, "WriteNoResp"),
      (Self::WRITE_SIGNED, "WriteSigned"),
   ];

   pub const fn from_bits(bits: u8) -> Self {
      Self(bits)
   }

   pub const fn contains(self, flag: u8) -> bool {
      self.0 & flag == flag
   }

   pub const fn with(self, flag: u8) -> Self {
      Self(self.0 | flag)
   }
}

impl fmt::Display for CharProps {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str("(")?;
      for (flag, name) in Self::NAMES {
         if self.contains(flag) {
            write!(f, " {name}")?;
         }
      }
      f.write_str(" )")
   }
}

/// A service reported by the peripheral during a connect cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
   pub uuid: Uuid,
   pub state: ServiceState,
}

impl ServiceDescriptor {
   pub const fn new(uuid: Uuid, state: ServiceState) -> Self {
      Self { uuid, state }
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "uuid": canonical(&self.uuid).as_str(),
          "state": <&'static str>::from(self.state),
      })
   }
}

/// A characteristic enumerated from a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
   /// Service the characteristic belongs to.
   pub service: Uuid,
   pub uuid: Uuid,
   pub handle: u16,
   pub properties: CharProps,
   /// Last known value.
   pub value: SmallVec<[u8; 20]>,
   /// Name announced by the transport, if any.
   pub name: Option<SmolStr>,
   /// Content of the Characteristic User Description descriptor.
   pub user_description: Option<SmolStr>,
   pub descriptors: Vec<Uuid>,
}

impl CharacteristicDescriptor {
   pub fn new(service: Uuid, uuid: Uuid, handle: u16, properties: CharProps) -> Self {
      Self {
         service,
         uuid,
         handle,
         properties,
         value: SmallVec::new(),
         name: None,
         user_description: None,
         descriptors: Vec::new(),
      }
   }

   pub fn canonical_uuid(&self) -> SmolStr {
      canonical(&self.uuid)
   }

   /// Transport name, else the user description, else `Unknown`.
   pub fn display_name(&self) -> SmolStr {
      self
         .name
         .as_ref()
         .filter(|n| !n.is_empty())
         .or(self.user_description.as_ref().filter(|n| !n.is_empty()))
         .cloned()
         .unwrap_or_else(|| SmolStr::new_static("Unknown"))
   }

   pub fn display_handle(&self) -> SmolStr {
      format_smolstr!("0x{:x}", self.handle)
   }

   /// Raw value as text, then as hex on the next line.
   pub fn display_value(&self) -> String {
      if self.value.is_empty() {
         return "<none>".to_string();
      }
      format!(
         "{}\n{}",
         String::from_utf8_lossy(&self.value),
         hex::encode(&self.value)
      )
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "service": canonical(&self.service).as_str(),
          "uuid": self.canonical_uuid().as_str(),
          "name": self.display_name().as_str(),
          "handle": self.display_handle().as_str(),
          "properties": self.properties.to_string(),
          "value": hex::encode(&self.value),
      })
   }
}
