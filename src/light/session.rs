//! Per-light connection state machine.
//!
//! A [`Session`] owns one peripheral connection from discovery to the bound
//! control characteristic. Transitions are computed by [`SessionMachine`], a
//! pure transition table, and driven by a per-session actor that consumes
//! transport notifications and user requests from a single queue, so no two
//! transitions of the same light ever race.

use std::{future::Future, sync::Arc, time::Duration};

use log::{debug, error, info, warn};
use serde_json::json;
use smallvec::SmallVec;
use smol_str::{SmolStr, format_smolstr};
use tokio::{
   select,
   sync::{mpsc, oneshot, watch},
   task::JoinSet,
   time::{self, Instant},
};
use uuid::Uuid;

use crate::{
   bluetooth::{
      Central, Peripheral, PeripheralInfo, ServiceState, address::PeripheralAddress,
      scanner::{Scanner, wind_down},
      uuid::canonical,
   },
   config::Timing,
   error::{LightError, Result},
   event::{EventSender, LightEvent, LightInfo},
   light::{
      characteristic::{CharacteristicDescriptor, ServiceDescriptor},
      protocol::{Frame, LED_CONTROL_UUID, LED_SERVICE_UUID, Rgb},
   },
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 64;
/// Maximum time to wait for the link to drop when the session stops
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of one light.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::IntoStaticStr,
)]
pub enum SessionState {
   #[default]
   Idle,
   Discovering,
   Connecting,
   ServicesDiscovering,
   /// Detail discovery of the LED service, nested under `ServicesDiscovering`.
   CharacteristicsDiscovering,
   Ready,
   Disconnected,
   Error,
   Closed,
}

/// Last failure observed by a session, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionFault {
   #[error("scan ended without a match")]
   DiscoveryTimeout,
   #[error("connect failed: {0}")]
   Connect(SmolStr),
   #[error("discovery incomplete: {0}")]
   DiscoveryIncomplete(SmolStr),
}

impl SessionFault {
   pub fn into_error(self, address: PeripheralAddress) -> LightError {
      match self {
         Self::DiscoveryTimeout => LightError::DiscoveryTimeout(address),
         Self::Connect(reason) => LightError::ConnectError(reason),
         Self::DiscoveryIncomplete(reason) => LightError::DiscoveryIncomplete(reason),
      }
   }
}

/// Snapshot published after every transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatus {
   pub state: SessionState,
   pub connected: bool,
   pub ready: bool,
   /// Handle of the bound control characteristic.
   pub control: Option<u16>,
   pub fault: Option<SessionFault>,
}

// === State Machine ===

/// Everything that can move a session.
#[derive(Debug, strum::IntoStaticStr)]
pub(crate) enum Input {
   Start,
   PeripheralMatched(PeripheralInfo),
   ScanEnded,
   Connected,
   ConnectFailed(SmolStr),
   ServiceDiscovered {
      uuid: Uuid,
      state: ServiceState,
   },
   ServiceDiscoveryFailed(SmolStr),
   DiscoveryFinished,
   ServiceDetails {
      service: Uuid,
      state: ServiceState,
      characteristics: Vec<CharacteristicDescriptor>,
   },
   DetailsFailed {
      service: Uuid,
      reason: SmolStr,
   },
   Disconnected,
   Close,
}

/// Transport work requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
   /// The peripheral has to be found by a scan pass.
   Scan,
   Connect,
   DiscoverServices,
   DiscoverDetails(Uuid),
   ReadCharacteristics(Uuid),
   SignalReady,
   /// Drops transport work still running for a link that is gone.
   CancelTransport,
   Disconnect,
}

pub(crate) type Actions = SmallVec<[Action; 2]>;

#[derive(Debug, Default)]
pub(crate) struct SessionMachine {
   state: SessionState,
   connected: bool,
   ready: bool,
   peripheral: Option<PeripheralInfo>,
   services: Vec<ServiceDescriptor>,
   characteristics: Vec<CharacteristicDescriptor>,
   /// Index into `characteristics`.
   control: Option<usize>,
   fault: Option<SessionFault>,
}

impl SessionMachine {
   pub(crate) fn handle(&mut self, input: Input) -> Actions {
      use SessionState as S;

      let mut actions = Actions::new();
      match (self.state, input) {
         (S::Ready, Input::Start) => actions.push(Action::SignalReady),
         (S::Discovering, Input::Start) if self.fault.is_none() => {},
         (S::Connecting | S::ServicesDiscovering | S::CharacteristicsDiscovering, Input::Start) => {},
         (_, Input::Start) => {
            self.state = S::Discovering;
            self.fault = None;
            actions.push(Action::Scan);
         },

         (S::Discovering, Input::PeripheralMatched(info)) => {
            self.peripheral = Some(info);
            self.state = S::Connecting;
            actions.push(Action::Connect);
         },
         (S::Discovering, Input::ScanEnded) => self.fault = Some(SessionFault::DiscoveryTimeout),

         (S::Connecting, Input::Connected) => {
            self.connected = true;
            self.state = S::ServicesDiscovering;
            actions.push(Action::DiscoverServices);
         },
         (S::Closed, Input::Connected) => actions.push(Action::Disconnect),
         (S::Connecting, Input::ConnectFailed(reason)) => {
            self.state = S::Error;
            self.fault = Some(SessionFault::Connect(reason));
         },

         (
            S::ServicesDiscovering | S::CharacteristicsDiscovering | S::Ready,
            Input::ServiceDiscovered { uuid, state },
         ) => self.service_discovered(uuid, state, &mut actions),
         (
            S::ServicesDiscovering | S::CharacteristicsDiscovering,
            Input::ServiceDiscoveryFailed(reason),
         ) => {
            self.state = S::Error;
            self.connected = false;
            self.fault = Some(SessionFault::DiscoveryIncomplete(reason));
            actions.push(Action::Disconnect);
         },
         (S::ServicesDiscovering | S::CharacteristicsDiscovering, Input::DiscoveryFinished) => {
            // Fires whether or not the control characteristic is bound yet.
            self.state = S::Ready;
            self.ready = true;
            actions.push(Action::SignalReady);
         },
         (
            S::ServicesDiscovering | S::CharacteristicsDiscovering | S::Ready,
            Input::ServiceDetails {
               service,
               state,
               characteristics,
            },
         ) => self.service_details(service, state, characteristics),
         (
            S::ServicesDiscovering | S::CharacteristicsDiscovering | S::Ready,
            Input::DetailsFailed { service, reason },
         ) => {
            self.fault = Some(SessionFault::DiscoveryIncomplete(format_smolstr!(
               "{}: {reason}",
               canonical(&service)
            )));
            self.leave_details();
         },

         (S::Closed, Input::Disconnected) => {},
         (_, Input::Disconnected) => {
            self.state = S::Disconnected;
            self.connected = false;
            self.ready = false;
            actions.push(Action::CancelTransport);
         },

         (_, Input::Close) => {
            self.state = S::Closed;
            self.connected = false;
            self.ready = false;
            actions.push(Action::Disconnect);
         },

         // Stale notification from an earlier attempt.
         (state, input) => {
            debug!("Ignoring {} in state {state}", <&'static str>::from(&input));
         },
      }
      actions
   }

   fn service_discovered(&mut self, uuid: Uuid, state: ServiceState, actions: &mut Actions) {
      let needs_details = uuid == LED_SERVICE_UUID && state == ServiceState::DiscoveryRequired;
      let state = if needs_details {
         ServiceState::Discovering
      } else {
         state
      };
      match self.services.iter_mut().find(|s| s.uuid == uuid) {
         Some(service) => service.state = state,
         None => self.services.push(ServiceDescriptor::new(uuid, state)),
      }

      if uuid != LED_SERVICE_UUID {
         return;
      }

      // The binding indexes into the characteristic set, both restart here.
      self.characteristics.clear();
      self.control = None;
      if needs_details {
         if self.state == SessionState::ServicesDiscovering {
            self.state = SessionState::CharacteristicsDiscovering;
         }
         actions.push(Action::DiscoverDetails(uuid));
      } else {
         actions.push(Action::ReadCharacteristics(uuid));
      }
   }

   fn service_details(
      &mut self,
      service: Uuid,
      state: ServiceState,
      found: Vec<CharacteristicDescriptor>,
   ) {
      if let Some(svc) = self.services.iter_mut().find(|s| s.uuid == service) {
         svc.state = state;
      }

      match state {
         ServiceState::Discovered => {
            self.characteristics.retain(|c| c.service != service);
            self.characteristics.extend(found);
            if let Some(idx) = self
               .characteristics
               .iter()
               .rposition(|c| c.service == LED_SERVICE_UUID && c.uuid == LED_CONTROL_UUID)
            {
               self.control = Some(idx);
            }
         },
         ServiceState::Discovering => return,
         other => {
            self.fault = Some(SessionFault::DiscoveryIncomplete(format_smolstr!(
               "{} ended in state {other}",
               canonical(&service)
            )));
         },
      }
      self.leave_details();
   }

   fn leave_details(&mut self) {
      if self.state == SessionState::CharacteristicsDiscovering {
         self.state = SessionState::ServicesDiscovering;
      }
   }

   pub(crate) const fn state(&self) -> SessionState {
      self.state
   }

   pub(crate) const fn is_connected(&self) -> bool {
      self.connected
   }

   /// A write can only go out with a live link and a bound control
   /// characteristic.
   pub(crate) const fn is_writable(&self) -> bool {
      self.connected && self.control.is_some()
   }

   pub(crate) fn control(&self) -> Option<&CharacteristicDescriptor> {
      self.control.and_then(|idx| self.characteristics.get(idx))
   }

   pub(crate) fn status(&self) -> SessionStatus {
      SessionStatus {
         state: self.state,
         connected: self.connected,
         ready: self.ready,
         control: self.control().map(|c| c.handle),
         fault: self.fault.clone(),
      }
   }
}

// === Session Actor ===

enum SessionMsg<P> {
   Open {
      ready: oneshot::Sender<()>,
      then: oneshot::Sender<bool>,
   },
   Matched(P),
   ScanEnded,
   Close(oneshot::Sender<()>),
   Send {
      frame: Frame,
      then: oneshot::Sender<Result<()>>,
   },
   Inspect(oneshot::Sender<SessionReport>),
}

struct SessionActor<P: Peripheral> {
   info: LightInfo,
   machine: SessionMachine,
   peripheral: Option<P>,
   event_tx: EventSender,
   inbox: mpsc::Receiver<SessionMsg<P>>,
   loopback_rx: mpsc::Receiver<Input>,
   loopback_tx: mpsc::Sender<Input>,
   tasks: JoinSet<()>,
   ready_tx: Option<oneshot::Sender<()>>,
   status: watch::Sender<SessionStatus>,
}

impl<P: Peripheral> SessionActor<P> {
   async fn run(mut self) {
      loop {
         select! {
             msg = self.inbox.recv() => {
                 let Some(msg) = msg else {
                     break;
                 };
                 self.handle_message(msg).await;
             }
             Some(input) = self.loopback_rx.recv() => {
                 self.apply(input);
             }
             Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                 if let Err(e) = joined
                    && e.is_panic()
                 {
                    error!("{}: transport task panicked: {e}", self.info.address);
                 }
             }
         }
      }

      self.cleanup().await;
   }

   async fn handle_message(&mut self, msg: SessionMsg<P>) {
      match msg {
         SessionMsg::Open { ready, then } => {
            if self.ready_tx.replace(ready).is_some() {
               debug!("{}: superseding pending open", self.info.address);
            }
            let actions = self.apply(Input::Start);
            let _ = then.send(actions.contains(&Action::Scan));
         },
         SessionMsg::Matched(peripheral) => {
            if self.machine.state() == SessionState::Discovering {
               let info = peripheral.info().clone();
               self.peripheral = Some(peripheral);
               self.apply(Input::PeripheralMatched(info));
            } else {
               debug!(
                  "{}: peripheral matched in state {}, ignoring",
                  self.info.address,
                  self.machine.state()
               );
            }
         },
         SessionMsg::ScanEnded => {
            self.apply(Input::ScanEnded);
         },
         SessionMsg::Close(ack) => {
            self.apply(Input::Close);
            let _ = ack.send(());
         },
         SessionMsg::Send { frame, then } => {
            let _ = then.send(self.write(frame).await);
         },
         SessionMsg::Inspect(reply) => {
            let _ = reply.send(self.report());
         },
      }
   }

   /// Feeds one input through the machine and runs the resulting actions.
   fn apply(&mut self, input: Input) -> Actions {
      let before = self.machine.status();
      let actions = self.machine.handle(input);
      for action in &actions {
         self.execute(*action);
      }
      self.publish(&before);
      actions
   }

   fn execute(&mut self, action: Action) {
      match action {
         Action::Scan => debug!("{}: waiting for scan", self.info.address),
         Action::Connect => self.spawn(|p, loopback| async move {
            match p.connect().await {
               Ok(()) => {
                  let _ = loopback.send(Input::Connected).await;
                  p.disconnected().await;
                  let _ = loopback.send(Input::Disconnected).await;
               },
               Err(e) => {
                  let _ = loopback
                     .send(Input::ConnectFailed(format_smolstr!("{e}")))
                     .await;
               },
            }
         }),
         Action::DiscoverServices => self.spawn(|p, loopback| async move {
            match p.discover_services().await {
               Ok(services) => {
                  for (uuid, state) in services {
                     let _ = loopback
                        .send(Input::ServiceDiscovered { uuid, state })
                        .await;
                  }
                  let _ = loopback.send(Input::DiscoveryFinished).await;
               },
               Err(e) => {
                  let _ = loopback
                     .send(Input::ServiceDiscoveryFailed(format_smolstr!("{e}")))
                     .await;
               },
            }
         }),
         Action::DiscoverDetails(service) => self.spawn(move |p, loopback| async move {
            let input = match p.discover_details(service).await {
               Ok(ServiceState::Discovered) => read_characteristics(&p, service).await,
               Ok(state) => Input::ServiceDetails {
                  service,
                  state,
                  characteristics: Vec::new(),
               },
               Err(e) => Input::DetailsFailed {
                  service,
                  reason: format_smolstr!("{e}"),
               },
            };
            let _ = loopback.send(input).await;
         }),
         Action::ReadCharacteristics(service) => self.spawn(move |p, loopback| async move {
            let _ = loopback.send(read_characteristics(&p, service).await).await;
         }),
         Action::SignalReady => match self.ready_tx.take() {
            Some(tx) => {
               if tx.send(()).is_err() {
                  debug!(
                     "{}: ready after the open deadline, nobody waiting",
                     self.info.address
                  );
               }
            },
            None => debug!("{}: ready without a pending open", self.info.address),
         },
         Action::CancelTransport => {
            if !self.tasks.is_empty() {
               debug!(
                  "{}: canceling {} transport task(s) of the dropped link",
                  self.info.address,
                  self.tasks.len()
               );
            }
            self.tasks.abort_all();
         },
         Action::Disconnect => {
            self.tasks.abort_all();
            if let Some(p) = self.peripheral.clone() {
               let address = self.info.address;
               tokio::spawn(async move {
                  if let Err(e) = p.disconnect().await {
                     warn!("{address}: disconnect failed: {e}");
                  }
               });
            }
         },
      }
   }

   fn spawn<F, Fut>(&mut self, task: F)
   where
      F: FnOnce(P, mpsc::Sender<Input>) -> Fut,
      Fut: Future<Output = ()> + Send + 'static,
   {
      match self.peripheral.clone() {
         Some(p) => {
            self.tasks.spawn(task(p, self.loopback_tx.clone()));
         },
         None => warn!("{}: no peripheral bound", self.info.address),
      }
   }

   fn publish(&mut self, before: &SessionStatus) {
      let address = self.info.address;
      let status = self.machine.status();

      if status.state != before.state {
         debug!("{address}: {} -> {}", before.state, status.state);
         match status.state {
            SessionState::Ready => info!("{address}: services ready"),
            SessionState::Disconnected => info!("{address}: disconnected"),
            _ => {},
         }
         self
            .event_tx
            .emit(&self.info, LightEvent::StateChanged(status.state));
      }

      if status.control != before.control {
         match (status.control, self.machine.control()) {
            (Some(handle), Some(ch)) => {
               info!("{address}: control characteristic bound at {}", ch.display_handle());
               let descriptors: Vec<_> = ch.descriptors.iter().map(canonical).collect();
               debug!("{address}: control descriptors {descriptors:?}");
               self
                  .event_tx
                  .emit(&self.info, LightEvent::ControlBound(handle));
            },
            _ => debug!("{address}: control characteristic released"),
         }
      }

      if status.fault != before.fault
         && let Some(fault) = &status.fault
      {
         warn!("{address}: {fault}");
         self
            .event_tx
            .emit(&self.info, LightEvent::Error(format_smolstr!("{fault}")));
      }

      self.status.send_replace(status);
   }

   async fn write(&self, frame: Frame) -> Result<()> {
      let (Some(p), Some(ch)) = (&self.peripheral, self.machine.control()) else {
         return Err(LightError::WriteUnavailable);
      };
      if !self.machine.is_writable() {
         return Err(LightError::WriteUnavailable);
      }

      let packet = frame.encode();
      debug!("{}: {frame} {}", self.info.address, hex::encode(&packet));
      p.write_without_response(ch, &packet).await
   }

   fn report(&self) -> SessionReport {
      let report = SessionReport {
         info: self.info.clone(),
         status: self.machine.status(),
         peripheral: self.machine.peripheral.clone(),
         services: self.machine.services.clone(),
         characteristics: self.machine.characteristics.clone(),
      };
      for ch in &report.characteristics {
         debug!(
            "{}: {} {} {} {} {}",
            self.info.address,
            ch.display_name(),
            ch.canonical_uuid(),
            ch.display_handle(),
            ch.properties,
            ch.display_value()
         );
      }
      report
   }

   async fn cleanup(&mut self) {
      self.tasks.shutdown().await;
      if self.machine.is_connected()
         && let Some(p) = &self.peripheral
      {
         match time::timeout(DISCONNECT_TIMEOUT, p.disconnect()).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => warn!("{}: disconnect failed: {e}", self.info.address),
            Err(_) => warn!("{}: disconnect timed out", self.info.address),
         }
      }
      debug!("{}: session stopped", self.info.address);
   }
}

async fn read_characteristics<P: Peripheral>(p: &P, service: Uuid) -> Input {
   match p.characteristics(service).await {
      Ok(characteristics) => Input::ServiceDetails {
         service,
         state: ServiceState::Discovered,
         characteristics,
      },
      Err(e) => Input::DetailsFailed {
         service,
         reason: format_smolstr!("{e}"),
      },
   }
}

/// Diagnostic view of everything a session discovered.
#[derive(Debug, Clone)]
pub struct SessionReport {
   pub info: LightInfo,
   pub status: SessionStatus,
   /// Peripheral as last seen by discovery.
   pub peripheral: Option<PeripheralInfo>,
   pub services: Vec<ServiceDescriptor>,
   pub characteristics: Vec<CharacteristicDescriptor>,
}

impl SessionReport {
   pub fn control(&self) -> Option<&CharacteristicDescriptor> {
      let handle = self.status.control?;
      self
         .characteristics
         .iter()
         .find(|c| c.handle == handle && c.uuid == LED_CONTROL_UUID)
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "address": self.info.address.to_string(),
          "name": self.info.name.as_str(),
          "state": <&'static str>::from(self.status.state),
          "advertised_name": self.peripheral.as_ref().and_then(|p| p.name.as_deref()),
          "services": self.services.iter().map(ServiceDescriptor::to_json).collect::<Vec<_>>(),
          "characteristics": self
             .characteristics
             .iter()
             .map(CharacteristicDescriptor::to_json)
             .collect::<Vec<_>>(),
          "control": self.control().map(|c| c.display_handle().to_string()),
      })
   }
}

// === Session Handle ===

struct SessionInner<C: Central> {
   info: LightInfo,
   central: Arc<C>,
   timing: Timing,
   inbox: mpsc::Sender<SessionMsg<C::Peripheral>>,
   status: watch::Receiver<SessionStatus>,
}

/// One configured light.
///
/// This type is cheaply cloneable. The session actor stops, and drops the
/// link, once the last clone is gone.
pub struct Session<C: Central>(Arc<SessionInner<C>>);

impl<C: Central> Clone for Session<C> {
   fn clone(&self) -> Self {
      Self(self.0.clone())
   }
}

impl<C: Central> Session<C> {
   pub fn new(info: LightInfo, central: Arc<C>, timing: Timing, event_tx: EventSender) -> Self {
      let (inbox_tx, inbox) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (status_tx, status_rx) = watch::channel(SessionStatus::default());

      tokio::spawn(
         SessionActor::<C::Peripheral> {
            info: info.clone(),
            machine: SessionMachine::default(),
            peripheral: None,
            event_tx,
            inbox,
            loopback_rx,
            loopback_tx,
            tasks: JoinSet::new(),
            ready_tx: None,
            status: status_tx,
         }
         .run(),
      );

      Self(Arc::new(SessionInner {
         info,
         central,
         timing,
         inbox: inbox_tx,
         status: status_rx,
      }))
   }

   pub fn info(&self) -> &LightInfo {
      &self.0.info
   }

   pub fn address(&self) -> PeripheralAddress {
      self.0.info.address
   }

   pub fn name(&self) -> &SmolStr {
      &self.0.info.name
   }

   pub fn status(&self) -> SessionStatus {
      self.0.status.borrow().clone()
   }

   pub fn state(&self) -> SessionState {
      self.0.status.borrow().state
   }

   pub fn is_ready(&self) -> bool {
      self.0.status.borrow().ready
   }

   pub fn has_control(&self) -> bool {
      self.0.status.borrow().control.is_some()
   }

   pub fn is_writable(&self) -> bool {
      let status = self.0.status.borrow();
      status.connected && status.control.is_some()
   }

   /// Scans for the light, connects and discovers its services.
   ///
   /// Succeeds once service discovery finished within the open timeout,
   /// which does not imply a bound control characteristic; probe
   /// [`Session::has_control`] before relying on writes.
   pub async fn open(&self) -> Result<()> {
      let timing = self.0.timing;
      let deadline = Instant::now() + timing.open_timeout;
      let (ready, needs_scan) = self.begin_open().await?;

      let scan = needs_scan.then(|| {
         Scanner::new(
            self.0.central.clone(),
            timing.discovery_window.min(timing.open_timeout),
         )
         .target(self.clone())
         .start()
      });

      if self.await_ready(ready, deadline).await {
         info!("{}: opened", self.address());
         return Ok(());
      }

      if let Some(scan) = scan {
         wind_down(scan).await;
      }
      let err = self.open_error().await;
      warn!("{}: open failed: {err}", self.address());
      Err(err)
   }

   /// Disconnects the light. Always succeeds.
   pub async fn close(&self) {
      let (tx, rx) = oneshot::channel();
      if self.request(SessionMsg::Close(tx)).await.is_ok() {
         let _ = rx.await;
      }
   }

   pub async fn send(&self, frame: Frame) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self.request(SessionMsg::Send { frame, then: tx }).await?;
      rx.await.map_err(|_| LightError::SessionShutdown)?
   }

   /// Writes the first color of `colors`.
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

   /// Waits until a control characteristic is bound, up to `deadline`.
   pub async fn wait_for_control(&self, deadline: Instant) -> bool {
      let mut status = self.0.status.clone();
      matches!(
         time::timeout_at(deadline, status.wait_for(|s| s.control.is_some())).await,
         Ok(Ok(_))
      )
   }

   pub async fn inspect(&self) -> Result<SessionReport> {
      let (tx, rx) = oneshot::channel();
      self.request(SessionMsg::Inspect(tx)).await?;
      rx.await.map_err(|_| LightError::SessionShutdown)
   }

   pub fn to_json(&self) -> serde_json::Value {
      let status = self.status();
      json!({
          "address": self.address().to_string(),
          "name": self.name().as_str(),
          "state": <&'static str>::from(status.state),
          "connected": status.connected,
          "ready": status.ready,
          "control": status.control.map(|h| format!("0x{h:x}")),
          "fault": status.fault.map(|f| f.to_string()),
      })
   }

   async fn request(&self, msg: SessionMsg<C::Peripheral>) -> Result<()> {
      self
         .0
         .inbox
         .send(msg)
         .await
         .map_err(|_| LightError::SessionShutdown)
   }

   /// Arms a new ready signal; also reports whether a scan has to run.
   pub(crate) async fn begin_open(&self) -> Result<(oneshot::Receiver<()>, bool)> {
      let (ready_tx, ready_rx) = oneshot::channel();
      let (then_tx, then_rx) = oneshot::channel();
      self
         .request(SessionMsg::Open {
            ready: ready_tx,
            then: then_tx,
         })
         .await?;
      let needs_scan = then_rx.await.map_err(|_| LightError::SessionShutdown)?;
      Ok((ready_rx, needs_scan))
   }

   /// True when the ready signal fired before `deadline`.
   pub(crate) async fn await_ready(&self, ready: oneshot::Receiver<()>, deadline: Instant) -> bool {
      matches!(time::timeout_at(deadline, ready).await, Ok(Ok(())))
   }

   /// Error describing a failed open, read after every queued notification
   /// was applied.
   pub(crate) async fn open_error(&self) -> LightError {
      let fault = match self.inspect().await {
         Ok(report) => report.status.fault,
         Err(e) => return e,
      };
      fault.map_or(LightError::OpenTimeout, |f| f.into_error(self.address()))
   }

   pub(crate) async fn peripheral_matched(&self, peripheral: C::Peripheral) {
      let _ = self.0.inbox.send(SessionMsg::Matched(peripheral)).await;
   }

   pub(crate) async fn scan_ended(&self) {
      let _ = self.0.inbox.send(SessionMsg::ScanEnded).await;
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{
      bluetooth::testing::{
         CONTROL_HANDLE, FakeCentral, FakeLight, FakePeripheral, RecordingBus, ScanTail, Step,
      },
      event::Discard,
      light::characteristic::CharProps,
   };

   const ADDRESS: &str = "AA:BB:CC:DD:EE:01";

   fn open_session(p: &FakePeripheral, event_tx: EventSender) -> (Arc<FakeCentral>, Session<FakeCentral>) {
      let central = Arc::new(FakeCentral::new(&[p]));
      let session = Session::new(
         LightInfo {
            address: p.info().address,
            name: "desk".into(),
         },
         central.clone(),
         Timing::default(),
         event_tx,
      );
      (central, session)
   }

   fn soon() -> Instant {
      Instant::now() + Duration::from_secs(1)
   }

   fn matched() -> Input {
      Input::PeripheralMatched(PeripheralInfo {
         address: ADDRESS.parse().unwrap(),
         name: None,
         low_energy: true,
      })
   }

   fn control_char() -> CharacteristicDescriptor {
      CharacteristicDescriptor::new(
         LED_SERVICE_UUID,
         LED_CONTROL_UUID,
         CONTROL_HANDLE,
         CharProps::from_bits(CharProps::WRITE_NO_RESPONSE),
      )
   }

   fn connected_machine() -> SessionMachine {
      let mut m = SessionMachine::default();
      m.handle(Input::Start);
      m.handle(matched());
      m.handle(Input::Connected);
      m
   }

   #[test]
   fn test_machine_happy_path() {
      let mut m = SessionMachine::default();
      assert_eq!(m.handle(Input::Start).as_slice(), &[Action::Scan]);
      assert_eq!(m.state(), SessionState::Discovering);
      assert_eq!(m.handle(matched()).as_slice(), &[Action::Connect]);
      assert_eq!(m.handle(Input::Connected).as_slice(), &[Action::DiscoverServices]);
      assert_eq!(m.state(), SessionState::ServicesDiscovering);

      let actions = m.handle(Input::ServiceDiscovered {
         uuid: LED_SERVICE_UUID,
         state: ServiceState::Discovered,
      });
      assert_eq!(actions.as_slice(), &[Action::ReadCharacteristics(LED_SERVICE_UUID)]);

      assert_eq!(m.handle(Input::DiscoveryFinished).as_slice(), &[Action::SignalReady]);
      let status = m.status();
      assert_eq!(status.state, SessionState::Ready);
      assert!(status.ready);
      assert_eq!(status.control, None);
      assert!(!m.is_writable());

      m.handle(Input::ServiceDetails {
         service: LED_SERVICE_UUID,
         state: ServiceState::Discovered,
         characteristics: vec![control_char()],
      });
      assert_eq!(m.status().control, Some(CONTROL_HANDLE));
      assert!(m.is_writable());
   }

   #[test]
   fn test_details_required_nests_under_service_discovery() {
      let mut m = connected_machine();
      let actions = m.handle(Input::ServiceDiscovered {
         uuid: LED_SERVICE_UUID,
         state: ServiceState::DiscoveryRequired,
      });
      assert_eq!(actions.as_slice(), &[Action::DiscoverDetails(LED_SERVICE_UUID)]);
      assert_eq!(m.state(), SessionState::CharacteristicsDiscovering);
      assert_eq!(m.services[0].state, ServiceState::Discovering);

      m.handle(Input::ServiceDetails {
         service: LED_SERVICE_UUID,
         state: ServiceState::Discovered,
         characteristics: vec![control_char()],
      });
      assert_eq!(m.state(), SessionState::ServicesDiscovering);
      assert_eq!(m.services[0].state, ServiceState::Discovered);
      assert_eq!(m.status().control, Some(CONTROL_HANDLE));
   }

   #[test]
   fn test_unexpected_detail_state_records_fault() {
      let mut m = connected_machine();
      m.handle(Input::ServiceDiscovered {
         uuid: LED_SERVICE_UUID,
         state: ServiceState::DiscoveryRequired,
      });
      m.handle(Input::ServiceDetails {
         service: LED_SERVICE_UUID,
         state: ServiceState::Unknown,
         characteristics: Vec::new(),
      });
      assert_eq!(m.state(), SessionState::ServicesDiscovering);
      assert!(matches!(m.status().fault, Some(SessionFault::DiscoveryIncomplete(_))));
      assert_eq!(m.status().control, None);
   }

   #[test]
   fn test_last_control_characteristic_wins() {
      let mut m = connected_machine();
      m.handle(Input::ServiceDiscovered {
         uuid: LED_SERVICE_UUID,
         state: ServiceState::Discovered,
      });
      let mut second = control_char();
      second.handle = 0x0020;
      m.handle(Input::ServiceDetails {
         service: LED_SERVICE_UUID,
         state: ServiceState::Discovered,
         characteristics: vec![control_char(), second],
      });
      assert_eq!(m.status().control, Some(0x0020));
   }

   #[test]
   fn test_disconnect_keeps_descriptors() {
      let mut m = connected_machine();
      m.handle(Input::ServiceDiscovered {
         uuid: LED_SERVICE_UUID,
         state: ServiceState::Discovered,
      });
      m.handle(Input::ServiceDetails {
         service: LED_SERVICE_UUID,
         state: ServiceState::Discovered,
         characteristics: vec![control_char()],
      });
      m.handle(Input::DiscoveryFinished);

      assert_eq!(m.handle(Input::Disconnected).as_slice(), &[Action::CancelTransport]);
      assert_eq!(m.state(), SessionState::Disconnected);
      assert!(!m.status().ready);
      assert!(!m.is_writable());
      assert_eq!(m.services.len(), 1);
      assert!(m.control().is_some());
   }

   #[test]
   fn test_close_from_any_state() {
      let mut m = SessionMachine::default();
      assert_eq!(m.handle(Input::Close).as_slice(), &[Action::Disconnect]);
      assert_eq!(m.state(), SessionState::Closed);

      let mut m = connected_machine();
      m.handle(Input::DiscoveryFinished);
      assert!(m.status().ready);
      m.handle(Input::Close);
      let status = m.status();
      assert_eq!(status.state, SessionState::Closed);
      assert!(!status.ready);
      assert!(!status.connected);
   }

   #[test]
   fn test_connect_completing_after_close_disconnects() {
      let mut m = SessionMachine::default();
      m.handle(Input::Start);
      m.handle(matched());
      m.handle(Input::Close);
      assert_eq!(m.handle(Input::Connected).as_slice(), &[Action::Disconnect]);
      assert_eq!(m.state(), SessionState::Closed);
      assert!(!m.is_connected());
   }

   #[test]
   fn test_start_rescans_after_scan_timeout() {
      let mut m = SessionMachine::default();
      m.handle(Input::Start);
      assert!(m.handle(Input::Start).is_empty());
      m.handle(Input::ScanEnded);
      assert_eq!(m.state(), SessionState::Discovering);
      assert_eq!(m.status().fault, Some(SessionFault::DiscoveryTimeout));

      assert_eq!(m.handle(Input::Start).as_slice(), &[Action::Scan]);
      assert_eq!(m.status().fault, None);
   }

   #[test]
   fn test_stale_inputs_are_ignored() {
      let mut m = SessionMachine::default();
      assert!(m.handle(Input::Connected).is_empty());
      assert!(m.handle(Input::DiscoveryFinished).is_empty());
      assert!(m.handle(matched()).is_empty());
      assert_eq!(m.state(), SessionState::Idle);
      assert!(!m.status().ready);
   }

   #[tokio::test(start_paused = true)]
   async fn test_open_bind_and_write() {
      let p = FakeLight::new(ADDRESS).build();
      let (central, session) = open_session(&p, Discard::sender());

      session.open().await.unwrap();
      assert!(session.is_ready());
      assert!(session.wait_for_control(soon()).await);
      assert!(session.is_writable());

      session.write(&[Rgb::new(1, 2, 3), Rgb::BLACK]).await.unwrap();
      session.power_off().await.unwrap();
      assert_eq!(
         p.writes(),
         vec![
            vec![0x56, 1, 2, 3, 0x00, 0xF0, 0xAA],
            vec![0xCC, 0x24, 0x33]
         ]
      );
      assert_eq!(central.scans(), 1);
      assert_eq!(p.connects(), 1);
   }

   #[tokio::test(start_paused = true)]
   async fn test_ready_without_control_refuses_writes() {
      let p = FakeLight::new(ADDRESS).led_details(Step::Hang).build();
      let (_central, session) = open_session(&p, Discard::sender());

      session.open().await.unwrap();
      assert!(session.is_ready());
      assert!(!session.has_control());

      for _ in 0..3 {
         assert!(matches!(
            session.write(&[Rgb::new(9, 9, 9)]).await,
            Err(LightError::WriteUnavailable)
         ));
      }
      assert!(matches!(
         session.power_on().await,
         Err(LightError::WriteUnavailable)
      ));
      assert!(p.writes().is_empty());
   }

   #[tokio::test(start_paused = true)]
   async fn test_write_before_open_fails() {
      let p = FakeLight::new(ADDRESS).build();
      let (_central, session) = open_session(&p, Discard::sender());
      assert!(matches!(
         session.power_on().await,
         Err(LightError::WriteUnavailable)
      ));
      assert!(matches!(session.write(&[]).await, Err(LightError::EmptyFrame)));
      assert!(p.writes().is_empty());
   }

   #[tokio::test(start_paused = true)]
   async fn test_open_fails_exactly_at_deadline() {
      let p = FakeLight::new(ADDRESS).connect(Step::Hang).build();
      let (_central, session) = open_session(&p, Discard::sender());

      let started = Instant::now();
      let err = session.open().await.unwrap_err();
      assert_eq!(started.elapsed(), Duration::from_millis(5000));
      assert!(matches!(err, LightError::OpenTimeout));
      assert_eq!(session.state(), SessionState::Connecting);
      assert!(!session.is_ready());
   }

   #[tokio::test(start_paused = true)]
   async fn test_connect_failure_is_captured() {
      let p = FakeLight::new(ADDRESS)
         .connect(Step::Fail("connection refused"))
         .build();
      let (_central, session) = open_session(&p, Discard::sender());

      let err = session.open().await.unwrap_err();
      assert!(matches!(err, LightError::ConnectError(ref reason) if reason.contains("connection refused")));
      assert_eq!(session.state(), SessionState::Error);
      assert_eq!(p.connects(), 1);
   }

   #[tokio::test(start_paused = true)]
   async fn test_service_discovery_failure_disconnects() {
      let p = FakeLight::new(ADDRESS)
         .discovery(Step::Fail("gatt error"))
         .build();
      let (_central, session) = open_session(&p, Discard::sender());

      let err = session.open().await.unwrap_err();
      assert!(matches!(err, LightError::DiscoveryIncomplete(_)));
      assert_eq!(session.state(), SessionState::Error);
      assert_eq!(p.disconnects(), 1);
   }

   #[tokio::test(start_paused = true)]
   async fn test_ready_after_deadline_is_ignored_then_reused() {
      let p = FakeLight::new(ADDRESS)
         .connect(Step::Delay(Duration::from_secs(6)))
         .build();
      let (central, session) = open_session(&p, Discard::sender());

      assert!(matches!(session.open().await, Err(LightError::OpenTimeout)));
      time::sleep(Duration::from_secs(2)).await;
      assert!(session.is_ready());

      let started = Instant::now();
      session.open().await.unwrap();
      assert_eq!(started.elapsed(), Duration::ZERO);
      assert_eq!(central.scans(), 1);
   }

   #[tokio::test(start_paused = true)]
   async fn test_link_drop_clears_writable() {
      let p = FakeLight::new(ADDRESS).build();
      let (_central, session) = open_session(&p, Discard::sender());
      session.open().await.unwrap();
      assert!(session.wait_for_control(soon()).await);

      p.drop_link();
      time::sleep(Duration::from_millis(1)).await;

      let status = session.status();
      assert_eq!(status.state, SessionState::Disconnected);
      assert!(!status.ready);
      assert!(!session.is_writable());
      assert!(matches!(
         session.power_on().await,
         Err(LightError::WriteUnavailable)
      ));

      let report = session.inspect().await.unwrap();
      assert_eq!(report.services.len(), 2);
      assert!(report.control().is_some());
   }

   #[tokio::test(start_paused = true)]
   async fn test_link_drop_cancels_discovery_of_the_old_connection() {
      let p = FakeLight::new(ADDRESS)
         .discovery(Step::Delay(Duration::from_secs(6)))
         .build();
      let (central, session) = open_session(&p, Discard::sender());

      assert!(matches!(session.open().await, Err(LightError::OpenTimeout)));
      assert_eq!(session.state(), SessionState::ServicesDiscovering);
      p.drop_link();
      time::sleep(Duration::from_millis(1)).await;
      assert_eq!(session.state(), SessionState::Disconnected);

      // The first connection's discovery would have finished one second in.
      let started = Instant::now();
      assert!(matches!(session.open().await, Err(LightError::OpenTimeout)));
      assert_eq!(started.elapsed(), Duration::from_millis(5000));
      assert!(!session.is_ready());
      assert_eq!(central.scans(), 2);
      assert_eq!(p.connects(), 2);

      time::sleep(Duration::from_secs(2)).await;
      assert!(session.is_ready());
      assert!(session.has_control());
   }

   #[tokio::test(start_paused = true)]
   async fn test_open_returns_when_discovery_never_starts() {
      let p = FakeLight::new(ADDRESS).build();
      let central = Arc::new(FakeCentral::new(&[&p]).tail(ScanTail::Stall));
      let session = Session::new(
         LightInfo {
            address: ADDRESS.parse().unwrap(),
            name: "desk".into(),
         },
         central.clone(),
         Timing::default(),
         Discard::sender(),
      );

      let started = Instant::now();
      let err = session.open().await.unwrap_err();
      assert_eq!(started.elapsed(), Duration::from_millis(5000));
      assert!(matches!(err, LightError::DiscoveryTimeout(_)));
      assert_eq!(p.connects(), 0);
   }

   #[tokio::test(start_paused = true)]
   async fn test_close_never_opened_session() {
      let p = FakeLight::new(ADDRESS).build();
      let (_central, session) = open_session(&p, Discard::sender());

      session.close().await;
      assert!(!session.is_ready());
      assert_eq!(session.state(), SessionState::Closed);
      assert_eq!(p.disconnects(), 0);
   }

   #[tokio::test(start_paused = true)]
   async fn test_close_after_open() {
      let p = FakeLight::new(ADDRESS).build();
      let (_central, session) = open_session(&p, Discard::sender());
      session.open().await.unwrap();

      session.close().await;
      time::sleep(Duration::from_millis(1)).await;
      let status = session.status();
      assert_eq!(status.state, SessionState::Closed);
      assert!(!status.ready);
      assert!(!status.connected);
      assert_eq!(p.disconnects(), 1);

      session.open().await.unwrap();
      assert_eq!(p.connects(), 2);
   }

   #[tokio::test(start_paused = true)]
   async fn test_events_and_report() {
      let bus = Arc::new(RecordingBus::default());
      let p = FakeLight::new(ADDRESS).build();
      let (_central, session) = open_session(&p, bus.clone());
      session.open().await.unwrap();
      assert!(session.wait_for_control(soon()).await);

      let events: Vec<_> = bus.events().into_iter().map(|(_, e)| e).collect();
      assert_eq!(events[0], LightEvent::StateChanged(SessionState::Discovering));
      assert!(events.contains(&LightEvent::StateChanged(SessionState::Ready)));
      assert!(events.contains(&LightEvent::ControlBound(CONTROL_HANDLE)));

      let report = session.inspect().await.unwrap();
      let json = report.to_json();
      assert_eq!(json["services"][1]["uuid"], "0xffd5");
      assert_eq!(json["control"], "0x13");
      assert_eq!(session.to_json()["control"], "0x13");
   }

   #[tokio::test(start_paused = true)]
   async fn test_dropping_last_handle_disconnects() {
      let p = FakeLight::new(ADDRESS).build();
      let (_central, session) = open_session(&p, Discard::sender());
      session.open().await.unwrap();

      drop(session);
      time::sleep(Duration::from_millis(1)).await;
      assert_eq!(p.disconnects(), 1);
   }
}
