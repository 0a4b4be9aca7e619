//! Peripheral access for the pi-top
//!
//! Everything hardware facing hangs off a [`board::Board`], which is passed to each
//! component when it is built. The device manager daemon is reached through the
//! `networking` crate for state the pi-top's hub owns.

pub mod adc;
pub mod board;
pub mod buttons;
pub mod component;
pub mod digital;
pub mod imu;
pub mod motor;
pub mod navigation;
pub mod oled;
pub mod peripheral;
pub mod plate;
pub mod ports;
pub mod robotics;
pub mod servo;
pub mod settings;
pub mod system;
pub mod ultrasonic;

#[cfg(test)]
pub mod mock;

pub use board::Board;
pub use settings::Settings;
