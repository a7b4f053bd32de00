//! Driver for Triones/HappyLight Bluetooth LE RGB light controllers.
//!
//! A [`HappyLight`] owns one [`Session`] per configured light and drives them
//! as a single logical device: open, close, color writes and power frames fan
//! out to every light and succeed only if each light succeeded.

pub mod bluetooth;
pub mod config;
#[cfg(feature = "bluez")]
pub mod dbus;
pub mod error;
pub mod event;
pub mod light;

pub use crate::{
   bluetooth::address::PeripheralAddress,
   config::Config,
   error::{LightError, Result},
   light::{
      device::HappyLight,
      protocol::{Frame, Rgb},
      session::{Session, SessionState},
   },
};
