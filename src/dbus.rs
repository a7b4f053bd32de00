//! D-Bus control surface for the configured lights.

use std::{str::FromStr, sync::Arc};

use log::{info, warn};
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   bluetooth::{address::PeripheralAddress, bluez::BluezCentral},
   light::{device::HappyLight, protocol::Rgb},
};

pub const SERVICE_NAME: &str = "org.happylight";
pub const OBJECT_PATH: &str = "/org/happylight/device";

pub struct HappyLightService {
   device: Arc<HappyLight<BluezCentral>>,
}

impl HappyLightService {
   pub const fn new(device: Arc<HappyLight<BluezCentral>>) -> Self {
      Self { device }
   }
}

fn failed(e: impl ToString) -> zbus::fdo::Error {
   zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.happylight.Device")]
impl HappyLightService {
   async fn open(
      &self,
      #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
   ) -> zbus::fdo::Result<bool> {
      let result = self.device.open().await;
      if let Err(e) = self.ready_changed(&emitter).await {
         warn!("Failed to announce Ready: {e}");
      }
      result.map_err(failed)?;
      Ok(true)
   }

   async fn close(
      &self,
      #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
   ) -> zbus::fdo::Result<bool> {
      self.device.close().await;
      if let Err(e) = self.ready_changed(&emitter).await {
         warn!("Failed to announce Ready: {e}");
      }
      Ok(true)
   }

   async fn set_color(&self, red: u8, green: u8, blue: u8) -> zbus::fdo::Result<bool> {
      self
         .device
         .write(&[Rgb::new(red, green, blue)])
         .await
         .map_err(failed)?;
      Ok(true)
   }

   async fn power_on(&self) -> zbus::fdo::Result<bool> {
      self.device.power_on().await.map_err(failed)?;
      info!("Lights powered on");
      Ok(true)
   }

   async fn power_off(&self) -> zbus::fdo::Result<bool> {
      self.device.power_off().await.map_err(failed)?;
      info!("Lights powered off");
      Ok(true)
   }

   async fn get_lights(&self) -> String {
      self.device.to_json().to_string()
   }

   async fn inspect_light(&self, address: String) -> zbus::fdo::Result<String> {
      let addr = PeripheralAddress::from_str(&address)
         .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;

      let light = self
         .device
         .light(addr)
         .ok_or_else(|| zbus::fdo::Error::Failed("Light not found".into()))?;
      let report = light.inspect().await.map_err(failed)?;
      Ok(report.to_json().to_string())
   }

   // Signals
   #[zbus(signal)]
   pub async fn light_state_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      state: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn control_bound(
      emitter: &SignalEmitter<'_>,
      address: &str,
      handle: u16,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn light_error(
      emitter: &SignalEmitter<'_>,
      address: &str,
      message: &str,
   ) -> zbus::Result<()>;

   #[zbus(property)]
   async fn ready(&self) -> bool {
      self.device.is_ready()
   }
}
