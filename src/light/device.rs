//! Several lights driven as one logical device.
//!
//! Every operation fans out to all configured lights and succeeds only if it
//! succeeded for each of them.

use std::sync::{
   Arc,
   atomic::{AtomicBool, Ordering},
};

use futures::future::join_all;
use log::{error, info, warn};
use serde_json::json;
use tokio::time::Instant;

use crate::{
   bluetooth::{
      Central,
      address::PeripheralAddress,
      scanner::{Scanner, wind_down},
   },
   config::{Config, Timing},
   error::{LightError, Result},
   event::{EventSender, LightInfo},
   light::{
      protocol::{Frame, Rgb},
      session::Session,
   },
};

/// The configured lights, one [`Session`] each.
pub struct HappyLight<C: Central> {
   central: Arc<C>,
   timing: Timing,
   lights: Vec<Session<C>>,
   ready: AtomicBool,
}

impl<C: Central> HappyLight<C> {
   /// Creates one session per configured light.
   ///
   /// Every address is validated first; a single malformed one fails the
   /// whole device and no session is created.
   pub fn new(central: Arc<C>, config: &Config, event_tx: EventSender) -> Result<Self> {
      let mut infos = Vec::new();
      for entry in config.entries() {
         let address = entry
            .mac_address
            .parse::<PeripheralAddress>()
            .inspect_err(|e| error!("{e}"))?;
         infos.push(LightInfo {
            address,
            name: entry.name.into(),
         });
      }

      if infos.is_empty() {
         warn!("No lights configured");
      }

      let timing = config.timing();
      let lights = infos
         .into_iter()
         .map(|info| Session::new(info, central.clone(), timing, event_tx.clone()))
         .collect();

      Ok(Self {
         central,
         timing,
         lights,
         ready: AtomicBool::new(false),
      })
   }

   /// Opens every light within one shared deadline.
   ///
   /// A light counts as open once its services were discovered and its
   /// control characteristic is bound.
   pub async fn open(&self) -> Result<()> {
      let deadline = Instant::now() + self.timing.open_timeout;
      let mut scanner = Scanner::new(
         self.central.clone(),
         self.timing.discovery_window.min(self.timing.open_timeout),
      );
      let mut scanning = false;

      let mut pending = Vec::with_capacity(self.lights.len());
      for light in &self.lights {
         pending.push(match light.begin_open().await {
            Ok((ready, needs_scan)) => {
               if needs_scan {
                  scanner = scanner.target(light.clone());
                  scanning = true;
               }
               Ok(ready)
            },
            Err(e) => Err(e),
         });
      }
      let scan = scanning.then(|| scanner.start());

      let waits = self
         .lights
         .iter()
         .zip(pending)
         .map(|(light, ready)| async move {
            let ready = match ready {
               Ok(ready) => ready,
               Err(e) => return Err(Some(e)),
            };
            if !light.await_ready(ready, deadline).await {
               return Err(None);
            }
            if light.wait_for_control(deadline).await {
               Ok(())
            } else {
               Err(Some(LightError::WriteUnavailable))
            }
         });
      let outcomes = join_all(waits).await;

      // Let the scan report unmatched lights before their faults are read.
      if outcomes.iter().any(|o| o.is_err())
         && let Some(scan) = scan
      {
         wind_down(scan).await;
      }

      let mut results = Vec::with_capacity(outcomes.len());
      for (light, outcome) in self.lights.iter().zip(outcomes) {
         results.push(match outcome {
            Ok(()) => Ok(()),
            Err(Some(e)) => Err(e),
            Err(None) => Err(light.open_error().await),
         });
      }

      match self.settle("open", results) {
         Ok(()) => {
            info!("BLE device successfully opened");
            self.ready.store(true, Ordering::Relaxed);
            Ok(())
         },
         Err(e) => {
            error!("Failed to open device: {e}");
            self.ready.store(false, Ordering::Relaxed);
            Err(e)
         },
      }
   }

   /// Closes every light. Always succeeds.
   pub async fn close(&self) {
      join_all(self.lights.iter().map(|light| light.close())).await;
      self.ready.store(false, Ordering::Relaxed);
      info!("BLE device closed");
   }

   /// Sends the first color of `colors` to every light.
   pub async fn write(&self, colors: &[Rgb]) -> Result<()> {
      let frame = Frame::from_colors(colors).ok_or(LightError::EmptyFrame)?;
      self.send(frame).await
   }

   pub async fn power_on(&self) -> Result<()> {
      self.send(Frame::PowerOn).await
   }

   pub async fn power_off(&self) -> Result<()> {
      self.send(Frame::PowerOff).await
   }

   async fn send(&self, frame: Frame) -> Result<()> {
      let results = join_all(self.lights.iter().map(|light| light.send(frame))).await;
      self.settle(frame.into(), results)
   }

   fn settle(&self, op: &str, results: Vec<Result<()>>) -> Result<()> {
      let total = results.len();
      let mut failed = 0;
      for (light, result) in self.lights.iter().zip(results) {
         if let Err(e) = result {
            failed += 1;
            warn!("{op} failed for {} ({}): {e}", light.name(), light.address());
         }
      }

      if failed == 0 {
         Ok(())
      } else {
         Err(LightError::PartialFailure { failed, total })
      }
   }

   pub fn is_ready(&self) -> bool {
      self.ready.load(Ordering::Relaxed)
   }

   pub fn lights(&self) -> &[Session<C>] {
      &self.lights
   }

   pub fn light(&self, address: PeripheralAddress) -> Option<&Session<C>> {
      self.lights.iter().find(|light| light.address() == address)
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "ready": self.is_ready(),
          "lights": self.lights.iter().map(Session::to_json).collect::<Vec<_>>(),
      })
   }
}
