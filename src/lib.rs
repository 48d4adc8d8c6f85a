//! # Millkit
//!
//! A headless host for a GRBL-driven CNC mill:
//! - Streams G-code with character-counting flow control
//! - Drives spindle speed/direction and the vacuum outside the controller
//! - Keeps one authoritative machine state and broadcasts snapshots
//! - Runs against a real serial controller or a built-in simulator
//!
//! ## Architecture
//!
//! 1. **millkit-core** - errors, data model, events, G-code words
//! 2. **millkit-communication** - transports and the GRBL controller link
//! 3. **millkit-settings** - startup configuration
//! 4. **millkit-machine** - actuation, job streaming, state store, facade
//! 5. **millkit** - logging setup and the headless runner

pub use millkit_communication::{
    list_ports, CommandKind, ConnectionParams, ControllerLink, FrameTag, GrblLink, LinkEvent,
    RealLink, RealtimeCommand, SerialPortInfo, SimulatedLink, SimulationParams, StatusReport,
    RX_BUFFER_SIZE,
};
pub use millkit_core::{
    ActuatorError, Axis, ConnectionError, ConnectionKind, Error, EventDispatcher, FaultReport,
    JobError, JobState, MachineEvent, MachineSnapshot, MachineState, MachineStatus, Position,
    ProtocolError, Result, SpindleDirection, ToolDefaults, ToolLookup, ToolTable,
};
pub use millkit_machine::{
    ActuationIntent, ActuationShim, ActuatorOutputs, JobStreamer, Machine, NoOpActuators,
    Program, SpindleScale, StateStore,
};
pub use millkit_settings::{default_config_path, Config};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Initialize logging
///
/// Honours `RUST_LOG` and falls back to `info`. Events carry target, level,
/// thread ids and line numbers; `json` switches to one JSON object per line.
pub fn init_logging(json: bool) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_level(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_line_number(true),
            )
            .try_init()
    };
    result.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}
