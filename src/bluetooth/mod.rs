//! Bluetooth Low Energy transport layer.
//!
//! This module defines the central/peripheral interface the light sessions
//! are driven through, together with address and UUID handling, the
//! address-filtering scanner and the BlueZ backend.

use std::future::Future;

use ::uuid::Uuid;
use futures::stream::BoxStream;
use smol_str::SmolStr;

use crate::{error::Result, light::characteristic::CharacteristicDescriptor};

pub mod address;
#[cfg(feature = "bluez")]
pub mod bluez;
pub mod scanner;
#[cfg(test)]
pub(crate) mod testing;
pub mod uuid;

use address::PeripheralAddress;

/// Identity of a peripheral as reported by discovery.
///
/// Only lives between discovery and connect; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralInfo {
   pub address: PeripheralAddress,
   pub name: Option<SmolStr>,
   /// Whether the peripheral advertised a Low Energy core configuration.
   pub low_energy: bool,
}

/// Discovery state of a remote GATT service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::IntoStaticStr)]
pub enum ServiceState {
   #[default]
   Unknown,
   DiscoveryRequired,
   Discovering,
   Discovered,
}

/// Local adapter acting as the GATT central.
pub trait Central: Send + Sync + 'static {
   type Peripheral: Peripheral;

   /// Starts LE discovery.
   ///
   /// The stream yields every peripheral seen until it is dropped. An `Err`
   /// item reports a discovery error; the stream ending early means the
   /// discovery was canceled underneath us.
   fn discover(
      &self,
   ) -> impl Future<Output = Result<BoxStream<'static, Result<Self::Peripheral>>>> + Send;
}

/// Connection-oriented GATT client view of one peripheral.
pub trait Peripheral: Clone + Send + Sync + 'static {
   fn info(&self) -> &PeripheralInfo;

   fn connect(&self) -> impl Future<Output = Result<()>> + Send;

   fn disconnect(&self) -> impl Future<Output = Result<()>> + Send;

   /// Resolves once the link to the peripheral drops.
   fn disconnected(&self) -> impl Future<Output = ()> + Send;

   /// Runs primary service discovery and reports every service found with
   /// its current detail discovery state.
   fn discover_services(&self) -> impl Future<Output = Result<Vec<(Uuid, ServiceState)>>> + Send;

   /// Discovers the characteristics of a service whose state is
   /// [`ServiceState::DiscoveryRequired`] and returns the resulting state.
   fn discover_details(&self, service: Uuid) -> impl Future<Output = Result<ServiceState>> + Send;

   fn characteristics(
      &self,
      service: Uuid,
   ) -> impl Future<Output = Result<Vec<CharacteristicDescriptor>>> + Send;

   /// Writes a value with the ATT write command; the peripheral sends no
   /// acknowledgement.
   fn write_without_response(
      &self,
      characteristic: &CharacteristicDescriptor,
      data: &[u8],
   ) -> impl Future<Output = Result<()>> + Send;
}
