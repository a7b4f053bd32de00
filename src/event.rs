//! Event handling for light status updates.
//!
//! Session actors report state transitions, control characteristic bindings
//! and failures through an [`EventBus`]; the daemon forwards them to D-Bus.

use std::sync::Arc;

use smol_str::SmolStr;

use crate::{bluetooth::address::PeripheralAddress, light::session::SessionState};

/// Configured identity of a light.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LightInfo {
   pub address: PeripheralAddress,
   pub name: SmolStr,
}

/// Events that can be emitted by a light session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LightEvent {
   StateChanged(SessionState),
   ControlBound(u16),
   Error(SmolStr),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, light: &LightInfo, event: LightEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

/// Bus that drops every event, for library users without listeners.
pub struct Discard;

impl EventBus for Discard {
   fn emit(&self, _light: &LightInfo, _event: LightEvent) {}
}

impl Discard {
   pub fn sender() -> EventSender {
      Arc::new(Self)
   }
}
