//! Scripted in-memory transport for tests.

use std::{
   future,
   sync::{
      Arc,
      atomic::{AtomicUsize, Ordering},
   },
   time::Duration,
};

use futures::{
   StreamExt,
   stream::{self, BoxStream},
};
use parking_lot::Mutex;
use tokio::{sync::Notify, time};
use uuid::Uuid;

use crate::{
   bluetooth::{
      Central, Peripheral, PeripheralInfo, ServiceState, address::PeripheralAddress,
      uuid::from_u16,
   },
   error::{LightError, Result},
   event::{EventBus, LightEvent, LightInfo},
   light::{
      characteristic::{CharProps, CharacteristicDescriptor},
      protocol::{LED_CONTROL_UUID, LED_SERVICE_UUID},
   },
};

/// Outcome of one scripted transport request.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Step {
   Succeed,
   Fail(&'static str),
   /// Succeeds after the given delay.
   Delay(Duration),
   Hang,
}

impl Step {
   async fn run(self) -> Result<()> {
      match self {
         Self::Succeed => Ok(()),
         Self::Fail(msg) => Err(LightError::transport(msg)),
         Self::Delay(delay) => {
            time::sleep(delay).await;
            Ok(())
         },
         Self::Hang => future::pending().await,
      }
   }
}

#[derive(Debug, Clone)]
struct FakeService {
   uuid: Uuid,
   state: ServiceState,
   details: Step,
   characteristics: Vec<CharacteristicDescriptor>,
}

/// Builder for a scripted light.
#[derive(Debug, Clone)]
pub(crate) struct FakeLight {
   info: PeripheralInfo,
   connect: Step,
   discovery: Step,
   services: Vec<FakeService>,
}

pub(crate) const CONTROL_HANDLE: u16 = 0x0013;

impl FakeLight {
   /// An LE light exposing a generic access service and the LED service
   /// with its control characteristic, all already discovered.
   pub(crate) fn new(address: &str) -> Self {
      let address: PeripheralAddress = address.parse().expect("test address");
      let gap = from_u16(0x1800);
      Self {
         info: PeripheralInfo {
            address,
            name: Some("Triones-Test".into()),
            low_energy: true,
         },
         connect: Step::Succeed,
         discovery: Step::Succeed,
         services: vec![
            FakeService {
               uuid: gap,
               state: ServiceState::Discovered,
               details: Step::Succeed,
               characteristics: vec![CharacteristicDescriptor::new(
                  gap,
                  from_u16(0x2a00),
                  0x0003,
                  CharProps::from_bits(CharProps::READ),
               )],
            },
            FakeService {
               uuid: LED_SERVICE_UUID,
               state: ServiceState::Discovered,
               details: Step::Succeed,
               characteristics: vec![
                  CharacteristicDescriptor::new(
                     LED_SERVICE_UUID,
                     from_u16(0xffda),
                     0x0010,
                     CharProps::from_bits(CharProps::NOTIFY),
                  ),
                  CharacteristicDescriptor::new(
                     LED_SERVICE_UUID,
                     LED_CONTROL_UUID,
                     CONTROL_HANDLE,
                     CharProps::from_bits(CharProps::WRITE | CharProps::WRITE_NO_RESPONSE),
                  ),
               ],
            },
         ],
      }
   }

   pub(crate) fn classic(mut self) -> Self {
      self.info.low_energy = false;
      self
   }

   pub(crate) fn connect(mut self, step: Step) -> Self {
      self.connect = step;
      self
   }

   pub(crate) fn discovery(mut self, step: Step) -> Self {
      self.discovery = step;
      self
   }

   /// The LED service reports `DiscoveryRequired`; detail discovery runs `step`.
   pub(crate) fn led_details(mut self, step: Step) -> Self {
      if let Some(svc) = self.led_service() {
         svc.state = ServiceState::DiscoveryRequired;
         svc.details = step;
      }
      self
   }

   pub(crate) fn without_control(mut self) -> Self {
      if let Some(svc) = self.led_service() {
         svc.characteristics.retain(|c| c.uuid != LED_CONTROL_UUID);
      }
      self
   }

   fn led_service(&mut self) -> Option<&mut FakeService> {
      self.services.iter_mut().find(|s| s.uuid == LED_SERVICE_UUID)
   }

   pub(crate) fn build(self) -> FakePeripheral {
      FakePeripheral(Arc::new(FakeInner {
         light: self,
         writes: Mutex::new(Vec::new()),
         connects: AtomicUsize::new(0),
         disconnects: AtomicUsize::new(0),
         link: Notify::new(),
      }))
   }
}

struct FakeInner {
   light: FakeLight,
   writes: Mutex<Vec<Vec<u8>>>,
   connects: AtomicUsize,
   disconnects: AtomicUsize,
   link: Notify,
}

#[derive(Clone)]
pub(crate) struct FakePeripheral(Arc<FakeInner>);

impl FakePeripheral {
   pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
      self.0.writes.lock().clone()
   }

   pub(crate) fn connects(&self) -> usize {
      self.0.connects.load(Ordering::Relaxed)
   }

   pub(crate) fn disconnects(&self) -> usize {
      self.0.disconnects.load(Ordering::Relaxed)
   }

   /// Simulates the peripheral dropping the link.
   pub(crate) fn drop_link(&self) {
      self.0.link.notify_one();
   }

   fn service(&self, uuid: Uuid) -> Result<&FakeService> {
      self
         .0
         .light
         .services
         .iter()
         .find(|s| s.uuid == uuid)
         .ok_or_else(|| LightError::transport("no such service"))
   }
}

impl Peripheral for FakePeripheral {
   fn info(&self) -> &PeripheralInfo {
      &self.0.light.info
   }

   async fn connect(&self) -> Result<()> {
      self.0.connects.fetch_add(1, Ordering::Relaxed);
      self.0.light.connect.run().await
   }

   async fn disconnect(&self) -> Result<()> {
      self.0.disconnects.fetch_add(1, Ordering::Relaxed);
      Ok(())
   }

   async fn disconnected(&self) {
      self.0.link.notified().await;
   }

   async fn discover_services(&self) -> Result<Vec<(Uuid, ServiceState)>> {
      self.0.light.discovery.run().await?;
      Ok(self
         .0
         .light
         .services
         .iter()
         .map(|s| (s.uuid, s.state))
         .collect())
   }

   async fn discover_details(&self, service: Uuid) -> Result<ServiceState> {
      let details = self.service(service)?.details;
      details.run().await?;
      Ok(ServiceState::Discovered)
   }

   async fn characteristics(&self, service: Uuid) -> Result<Vec<CharacteristicDescriptor>> {
      Ok(self.service(service)?.characteristics.clone())
   }

   async fn write_without_response(
      &self,
      _characteristic: &CharacteristicDescriptor,
      data: &[u8],
   ) -> Result<()> {
      self.0.writes.lock().push(data.to_vec());
      Ok(())
   }
}

/// How the scripted discovery stream behaves after its advertisements.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ScanTail {
   /// Keeps scanning until dropped.
   Open,
   /// Stream ends on its own.
   Cancel,
   /// Stream yields an error.
   Fail(&'static str),
   /// `discover()` itself fails.
   Refuse,
   /// `discover()` never returns.
   Stall,
}

pub(crate) struct FakeCentral {
   advertised: Vec<(Duration, FakePeripheral)>,
   tail: ScanTail,
   scans: AtomicUsize,
}

impl FakeCentral {
   pub(crate) fn new(peripherals: &[&FakePeripheral]) -> Self {
      Self {
         advertised: peripherals
            .iter()
            .map(|p| (Duration::from_millis(10), (*p).clone()))
            .collect(),
         tail: ScanTail::Open,
         scans: AtomicUsize::new(0),
      }
   }

   pub(crate) fn tail(mut self, tail: ScanTail) -> Self {
      self.tail = tail;
      self
   }

   pub(crate) fn scans(&self) -> usize {
      self.scans.load(Ordering::Relaxed)
   }
}

impl Central for FakeCentral {
   type Peripheral = FakePeripheral;

   async fn discover(&self) -> Result<BoxStream<'static, Result<FakePeripheral>>> {
      self.scans.fetch_add(1, Ordering::Relaxed);
      let found = stream::iter(self.advertised.clone()).then(|(delay, p)| async move {
         time::sleep(delay).await;
         Ok(p)
      });
      let tail: BoxStream<'static, Result<FakePeripheral>> = match self.tail {
         ScanTail::Open => stream::pending().boxed(),
         ScanTail::Cancel => stream::empty().boxed(),
         ScanTail::Fail(msg) => stream::once(async move { Err(LightError::transport(msg)) }).boxed(),
         ScanTail::Refuse => return Err(LightError::transport("adapter not ready")),
         ScanTail::Stall => return future::pending().await,
      };
      Ok(found.chain(tail).boxed())
   }
}

/// Event bus remembering everything emitted.
#[derive(Default)]
pub(crate) struct RecordingBus {
   events: Mutex<Vec<(PeripheralAddress, LightEvent)>>,
}

impl RecordingBus {
   pub(crate) fn events(&self) -> Vec<(PeripheralAddress, LightEvent)> {
      self.events.lock().clone()
   }
}

impl EventBus for RecordingBus {
   fn emit(&self, light: &LightInfo, event: LightEvent) {
      self.events.lock().push((light.address, event));
   }
}
