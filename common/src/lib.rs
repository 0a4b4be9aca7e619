//! Code shared between the device-manager clients and the hardware sdk

pub mod error;
pub mod lock;
pub mod ports;
pub mod protocol;
pub mod types;
