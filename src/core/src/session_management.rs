//! Session management core module.
//!
//! One [`ConnectionSession`] per accepted connection, driven by its own
//! [`ConnectionSupervisor`].

/// Submodule for session data structures.
pub mod session;
/// Submodule for the per-connection supervisor.
pub mod supervisor;

pub use session::ConnectionSession;
pub use supervisor::{ConnectionSupervisor, SessionOutcome};
