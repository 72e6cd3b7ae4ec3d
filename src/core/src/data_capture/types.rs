//! Common data types used across the data_capture subsystem.

use chrono::{DateTime, Local, TimeDelta};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Format shared by log file names and the text log events.
pub const TIMESTAMP_FORMAT: &str = "%Y.%m.%d-%H.%M.%S";

/// Direction of TCP flow for relayed bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Bytes flowing from the accepted client to the target service.
    ClientToTarget,
    /// Bytes flowing from the target service back to the client.
    TargetToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToTarget => write!(f, "C->T"),
            Direction::TargetToClient => write!(f, "T->C"),
        }
    }
}

/// What a log file records, used to derive its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRole {
    /// Human readable events and hex dumps for both directions.
    Text { local: String, remote: String },
    /// Raw bytes of one direction, named after one participant.
    Binary { peer: String },
}

impl LogRole {
    /// `log-<ts>-<id>-<local>-<remote>.log` or `log-binary-<ts>-<id>-<peer>.log`.
    pub fn file_name(&self, created: &DateTime<Local>, conn_id: u64) -> String {
        let ts = format_time(created);
        match self {
            LogRole::Text { local, remote } => {
                format!("log-{}-{:04}-{}-{}.log", ts, conn_id, local, remote)
            }
            LogRole::Binary { peer } => format!("log-binary-{}-{:04}-{}.log", ts, conn_id, peer),
        }
    }

    pub fn path_in(&self, dir: &Path, created: &DateTime<Local>, conn_id: u64) -> PathBuf {
        dir.join(self.file_name(created, conn_id))
    }
}

/// One line of the text log.
#[derive(Debug, Clone)]
pub enum LogEvent<'a> {
    Connected {
        target: &'a str,
        at: &'a DateTime<Local>,
    },
    Received {
        seq: u64,
        offset: u64,
        len: usize,
        from: &'a str,
    },
    Sent {
        seq: u64,
        to: &'a str,
    },
    WriteFailed {
        to: &'a str,
        error: &'a std::io::Error,
    },
    Disconnected {
        from: &'a str,
    },
    Finished {
        started: &'a DateTime<Local>,
        duration: TimeDelta,
    },
}

impl fmt::Display for LogEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogEvent::Connected { target, at } => {
                writeln!(f, "Connected to {} at {}", target, format_time(at))
            }
            LogEvent::Received {
                seq,
                offset,
                len,
                from,
            } => writeln!(
                f,
                "Received (#{}, {:08X}) {} bytes from {}",
                seq, offset, len, from
            ),
            LogEvent::Sent { seq, to } => writeln!(f, "Sent (#{}) to {}", seq, to),
            LogEvent::WriteFailed { to, error } => writeln!(f, "Write to {} failed: {}", to, error),
            LogEvent::Disconnected { from } => writeln!(f, "Disconnected from {}", from),
            LogEvent::Finished { started, duration } => writeln!(
                f,
                "Finished at {}, duration {}",
                format_time(started),
                format_duration(*duration)
            ),
        }
    }
}

impl LogEvent<'_> {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

pub fn format_time(t: &DateTime<Local>) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

/// Address rendering safe for file names: every `:` becomes `-`.
pub fn printable_addr(addr: &SocketAddr) -> String {
    addr.to_string().replace(':', "-")
}

/// Renders an elapsed time as `250ms`, `1.503s`, `2m3.25s` or `1h0m2s`.
///
/// Sub-second values use the largest unit below a second (`ns`, `µs`, `ms`);
/// fractions keep nanosecond precision with trailing zeros removed.
pub fn format_duration(elapsed: TimeDelta) -> String {
    // Only overflows past ~292 years.
    let nanos = elapsed.num_nanoseconds().unwrap_or(i64::MAX).max(0) as u64;
    match nanos {
        0 => "0s".to_string(),
        n if n < 1_000 => format!("{}ns", n),
        n if n < 1_000_000 => format!("{}µs", decimal(n, 1_000)),
        n if n < 1_000_000_000 => format!("{}ms", decimal(n, 1_000_000)),
        n => {
            let secs = n / 1_000_000_000;
            let hours = secs / 3600;
            let minutes = (secs / 60) % 60;
            let seconds = decimal(n % 60_000_000_000, 1_000_000_000);
            if hours > 0 {
                format!("{}h{}m{}s", hours, minutes, seconds)
            } else if minutes > 0 {
                format!("{}m{}s", minutes, seconds)
            } else {
                format!("{}s", seconds)
            }
        }
    }
}

/// `value / unit` as a decimal without trailing zeros; `unit` is a power of ten.
fn decimal(value: u64, unit: u64) -> String {
    let whole = value / unit;
    let frac = value % unit;
    if frac == 0 {
        return whole.to_string();
    }
    let width = unit.ilog10() as usize;
    let s = format!("{}.{:0width$}", whole, frac, width = width);
    s.trim_end_matches('0').to_string()
}
