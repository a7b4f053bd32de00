//! Triones/HappyLight light control.

pub mod characteristic;
pub mod device;
pub mod protocol;
pub mod session;
