//! BlueZ backend for the transport traits.
//!
//! bluetoothd resolves every GATT service right after connecting, so services
//! are reported as already discovered and detail discovery is a no-op.

use std::{collections::HashMap, future, sync::Arc};

use bluer::{
   Adapter, AdapterEvent, AddressType, Device, DeviceEvent, DeviceProperty, DiscoveryFilter,
   DiscoveryTransport, Session,
   gatt::{
      CharacteristicFlags, WriteOp,
      remote::{Characteristic, CharacteristicWriteRequest, Service},
   },
};
use futures::{StreamExt, stream::BoxStream};
use log::{debug, info, warn};
use smol_str::{SmolStr, format_smolstr};
use uuid::Uuid;

use crate::{
   bluetooth::{
      Central, Peripheral, PeripheralInfo, ServiceState,
      uuid::{canonical, from_u16},
   },
   error::{LightError, Result},
   light::characteristic::{CharProps, CharacteristicDescriptor},
};

/// Characteristic User Description descriptor.
const USER_DESCRIPTION_UUID: Uuid = from_u16(0x2901);

pub struct BluezCentral {
   _session: Session,
   adapter: Adapter,
}

impl BluezCentral {
   /// Opens the named adapter, or the default one, and powers it on.
   pub async fn new(adapter_name: Option<&str>) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = match adapter_name {
         Some(name) => session.adapter(name)?,
         None => session.default_adapter().await?,
      };
      let name = adapter.name().to_owned();

      if let Ok(powered) = adapter.is_powered().await
         && !powered
      {
         match adapter.set_powered(true).await {
            Ok(()) => info!("Powered on adapter: {name}"),
            Err(e) => warn!("Failed to power on adapter {name}: {e}"),
         }
      }
      info!("Using adapter: {name}");

      Ok(Self {
         _session: session,
         adapter,
      })
   }
}

impl Central for BluezCentral {
   type Peripheral = BluezPeripheral;

   async fn discover(&self) -> Result<BoxStream<'static, Result<BluezPeripheral>>> {
      self
         .adapter
         .set_discovery_filter(DiscoveryFilter {
            transport: DiscoveryTransport::Le,
            ..Default::default()
         })
         .await?;
      let events = self.adapter.discover_devices().await?;

      let adapter = self.adapter.clone();
      let found = events.filter_map(move |event| {
         let adapter = adapter.clone();
         async move {
            let AdapterEvent::DeviceAdded(address) = event else {
               return None;
            };
            match BluezPeripheral::probe(&adapter, address).await {
               Ok(peripheral) => Some(Ok(peripheral)),
               Err(e) => {
                  debug!("Skipping {address}: {e}");
                  None
               },
            }
         }
      });
      Ok(found.boxed())
   }
}

struct PeripheralInner {
   info: PeripheralInfo,
   device: Device,
   /// Remote characteristics seen so far, by handle.
   characteristics: parking_lot::Mutex<HashMap<u16, Characteristic>>,
}

#[derive(Clone)]
pub struct BluezPeripheral(Arc<PeripheralInner>);

impl BluezPeripheral {
   async fn probe(adapter: &Adapter, address: bluer::Address) -> Result<Self> {
      let device = adapter.device(address)?;
      let name = device.name().await?.map(SmolStr::from);
      let low_energy = device.address_type().await? != AddressType::BrEdr;

      Ok(Self(Arc::new(PeripheralInner {
         info: PeripheralInfo {
            address: address.into(),
            name,
            low_energy,
         },
         device,
         characteristics: parking_lot::Mutex::new(HashMap::new()),
      })))
   }

   async fn service(&self, uuid: Uuid) -> Result<Service> {
      for service in self.0.device.services().await? {
         if service.uuid().await? == uuid {
            return Ok(service);
         }
      }
      Err(LightError::transport(format_smolstr!(
         "service {} not found",
         canonical(&uuid)
      )))
   }
}

fn char_props(flags: &CharacteristicFlags) -> CharProps {
   let mut bits = 0;
   if flags.broadcast {
      bits |= CharProps::BROADCAST;
   }
   if flags.read {
      bits |= CharProps::READ;
   }
   if flags.write_without_response {
      bits |= CharProps::WRITE_NO_RESPONSE;
   }
   if flags.write {
      bits |= CharProps::WRITE;
   }
   if flags.notify {
      bits |= CharProps::NOTIFY;
   }
   if flags.indicate {
      bits |= CharProps::INDICATE;
   }
   if flags.authenticated_signed_writes {
      bits |= CharProps::WRITE_SIGNED;
   }
   if flags.extended_properties {
      bits |= CharProps::EXTENDED_PROPERTY;
   }
   CharProps::from_bits(bits)
}

impl Peripheral for BluezPeripheral {
   fn info(&self) -> &PeripheralInfo {
      &self.0.info
   }

   async fn connect(&self) -> Result<()> {
      self.0.device.connect().await?;
      Ok(())
   }

   async fn disconnect(&self) -> Result<()> {
      self.0.device.disconnect().await?;
      Ok(())
   }

   async fn disconnected(&self) {
      let Ok(mut events) = self.0.device.events().await else {
         return future::pending().await;
      };
      while let Some(event) = events.next().await {
         if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
            return;
         }
      }
      // Event stream ends when the device object goes away.
   }

   async fn discover_services(&self) -> Result<Vec<(Uuid, ServiceState)>> {
      let device = &self.0.device;
      let mut events = device.events().await?;
      if !device.is_services_resolved().await? {
         loop {
            match events.next().await {
               Some(DeviceEvent::PropertyChanged(DeviceProperty::ServicesResolved(true))) => break,
               Some(_) => {},
               None => return Err(LightError::transport("services were never resolved")),
            }
         }
      }

      let mut found = Vec::new();
      for service in device.services().await? {
         if service.primary().await? {
            found.push((service.uuid().await?, ServiceState::Discovered));
         }
      }
      Ok(found)
   }

   async fn discover_details(&self, _service: Uuid) -> Result<ServiceState> {
      Ok(ServiceState::Discovered)
   }

   async fn characteristics(&self, service: Uuid) -> Result<Vec<CharacteristicDescriptor>> {
      let remote = self.service(service).await?;

      let mut found = Vec::new();
      for ch in remote.characteristics().await? {
         let flags = ch.flags().await?;
         let mut desc =
            CharacteristicDescriptor::new(service, ch.uuid().await?, ch.id(), char_props(&flags));
         if flags.read {
            desc.value = ch.cached_value().await.unwrap_or_default().into();
         }

         for descriptor in ch.descriptors().await? {
            let uuid = descriptor.uuid().await?;
            if uuid == USER_DESCRIPTION_UUID
               && let Ok(text) = descriptor.read().await
            {
               desc.user_description = Some(SmolStr::new(String::from_utf8_lossy(&text)));
            }
            desc.descriptors.push(uuid);
         }

         self.0.characteristics.lock().insert(desc.handle, ch);
         found.push(desc);
      }
      Ok(found)
   }

   async fn write_without_response(
      &self,
      characteristic: &CharacteristicDescriptor,
      data: &[u8],
   ) -> Result<()> {
      let ch = self
         .0
         .characteristics
         .lock()
         .get(&characteristic.handle)
         .cloned()
         .ok_or(LightError::WriteUnavailable)?;

      ch.write_ext(
         data,
         &CharacteristicWriteRequest {
            op_type: WriteOp::Command,
            ..Default::default()
         },
      )
      .await?;
      Ok(())
   }
}
