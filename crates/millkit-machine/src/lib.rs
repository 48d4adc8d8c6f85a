//! # Millkit Machine
//!
//! Job streaming, spindle and vacuum actuation, the machine state store and
//! the [`Machine`] facade that runs them on tokio.
//!
//! ## Modules
//! - `actuation`: analog spindle reference, direction and vacuum lines
//! - `store`: the authoritative [`MachineState`](millkit_core::MachineState) and event fan-out
//! - `streamer`: the job state machine driving a controller link
//! - `machine`: the facade and its dispatch, status poll and broadcast loops

pub mod actuation;
pub mod machine;
pub mod store;
pub mod streamer;

pub use actuation::{
    ActuationIntent, ActuationShim, ActuatorOutputs, NoOpActuators, SpindleScale, DAC_MAX_CODE,
};
pub use machine::Machine;
pub use store::StateStore;
pub use streamer::{JobStreamer, Program};
