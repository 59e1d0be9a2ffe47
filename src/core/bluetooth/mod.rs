//! Bluetooth layer: discovery, the per-controller GATT session and the
//! controller's binary protocols.

pub mod commands;
pub mod constants;
pub mod decoder;
pub mod scanner;
pub mod session;
