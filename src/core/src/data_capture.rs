pub mod forwarder;
pub mod hex_dump;
pub mod logger;
pub mod types;

pub use forwarder::{DirectionChannel, ForwardStats, Forwarder, SessionClose};
pub use hex_dump::hex_dump;
pub use logger::{LogSender, LogSummary, Logger};
pub use types::{Direction, LogEvent, LogRole};
