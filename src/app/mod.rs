//! Usage: Process wiring (logging, settings-driven bootstrap).

pub mod bootstrap;
pub mod logging;
