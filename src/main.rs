//! HappyLight D-Bus service
//!
//! This service drives Triones/HappyLight Bluetooth LE light controllers and
//! exposes them on the session bus as one logical device.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{connection, object_server::InterfaceRef};

use happylight::{
   bluetooth::bluez::BluezCentral,
   config::Config,
   dbus::{HappyLightService, HappyLightServiceSignals, OBJECT_PATH, SERVICE_NAME},
   error::Result,
   event::{EventBus, LightEvent, LightInfo},
   light::device::HappyLight,
};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting HappyLight D-Bus service...");

   // Load configuration
   let config = Config::load()?;
   info!("Loaded configuration with {} lights", config.entries().len());

   let event_bus = EventProcessor::new();

   let central = Arc::new(BluezCentral::new(config.adapter.as_deref()).await?);
   let device = Arc::new(HappyLight::new(central, &config, event_bus.clone())?);

   let connection = connection::Builder::session()?
      .name(SERVICE_NAME)?
      .serve_at(OBJECT_PATH, HappyLightService::new(device.clone()))?
      .build()
      .await?;

   info!("HappyLight D-Bus service started at {SERVICE_NAME}");

   let iface = connection
      .object_server()
      .interface::<_, HappyLightService>(OBJECT_PATH)
      .await?;
   event_bus.spawn_dispatcher(iface.clone());

   if config.open_on_start {
      match device.open().await {
         Ok(()) => {
            if let Err(e) = device.power_on().await {
               warn!("Failed to power on lights: {e}");
            }
         },
         Err(e) => warn!("Lights not opened on start: {e}"),
      }
      iface.get().await.ready_changed(iface.signal_emitter()).await?;
   }

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down HappyLight service...");
   device.close().await;

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<(LightInfo, LightEvent)>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   async fn recv(self: &Arc<Self>) -> Option<(LightInfo, LightEvent)> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<HappyLightService>,
      (light, event): (LightInfo, LightEvent),
   ) -> Result<()> {
      let address = light.address.to_string();
      match event {
         LightEvent::StateChanged(state) => {
            iface
               .light_state_changed(&address, state.into())
               .await?;
         },
         LightEvent::ControlBound(handle) => {
            iface.control_bound(&address, handle).await?;
         },
         LightEvent::Error(message) => {
            iface.light_error(&address, &message).await?;
         },
      }
      Ok(())
   }

   fn spawn_dispatcher(self: Arc<Self>, iface: InterfaceRef<HappyLightService>) {
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, light: &LightInfo, event: LightEvent) {
      self.queue.push((light.clone(), event));
      self.notifier.notify_waiters();
   }
}
