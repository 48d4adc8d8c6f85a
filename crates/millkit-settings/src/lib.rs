//! Millkit Settings Crate
//!
//! Handles startup configuration: file loading, environment overlay and
//! validation.

pub mod config;

pub use config::{
    default_config_path, ActuationSettings, Config, ConnectionSettings, LoggingSettings,
    SimulationSettings, TimingSettings,
};
