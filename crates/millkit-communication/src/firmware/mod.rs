//! Controller firmware protocols
//!
//! - `link`: the protocol-neutral controller link contract
//! - `grbl`: GRBL 1.1 line protocol over any [`Transport`](crate::Transport)

pub mod grbl;
pub mod link;

pub use link::{CommandKind, ControllerLink, FrameTag, LinkEvent, RealtimeCommand, StatusReport};
