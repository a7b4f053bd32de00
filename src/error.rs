//! Error types for the light driver.
//!
//! This module defines every failure a light, the aggregate device or the
//! daemon around them can report, from configuration problems to transport
//! and D-Bus errors.

use smol_str::SmolStr;
use thiserror::Error;

use crate::bluetooth::address::PeripheralAddress;

/// Main error type for the light driver.
#[derive(Error, Debug)]
pub enum LightError {
   #[error("Device mac address is not valid [{0}]")]
   InvalidAddress(String),

   #[error("No peripheral matched {0} within the discovery window")]
   DiscoveryTimeout(PeripheralAddress),

   #[error("Connect error: {0}")]
   ConnectError(SmolStr),

   #[error("Service discovery incomplete: {0}")]
   DiscoveryIncomplete(SmolStr),

   #[error("No control characteristic bound or no live connection")]
   WriteUnavailable,

   #[error("Timed out waiting for the light to become ready")]
   OpenTimeout,

   #[error("{failed} of {total} lights failed")]
   PartialFailure { failed: usize, total: usize },

   #[error("Color frame is empty")]
   EmptyFrame,

   #[error("Light session has been shut down")]
   SessionShutdown,

   #[error("Transport error: {0}")]
   Transport(SmolStr),

   #[cfg(feature = "bluez")]
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[cfg(feature = "bluez")]
   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[cfg(feature = "bluez")]
   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

impl LightError {
   /// Wraps an arbitrary transport failure, keeping only its text.
   pub fn transport(err: impl std::fmt::Display) -> Self {
      Self::Transport(smol_str::format_smolstr!("{err}"))
   }
}

/// Convenience type alias for Results with `LightError`.
pub type Result<T> = std::result::Result<T, LightError>;
