//! Error types shared by every subsystem of the relay.

pub mod types;
