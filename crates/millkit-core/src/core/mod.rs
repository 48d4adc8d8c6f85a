//! Core runtime abstractions shared by every crate

pub mod event;
