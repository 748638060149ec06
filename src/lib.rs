//! Patient location tracking against an RFID/beacon gateway.

pub mod beacon;
pub mod config;
pub mod mqtt;
pub mod presence;
pub mod resolver;
pub mod roster;
pub mod scheduler;
pub mod settings;
