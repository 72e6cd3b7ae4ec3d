use std::path::PathBuf;

use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::data_capture::forwarder::{DirectionChannel, ForwardStats, Forwarder, SessionClose};
use crate::data_capture::logger::{LogSender, LogSummary, Logger};
use crate::data_capture::types::{format_duration, printable_addr, Direction, LogEvent, LogRole};
use crate::error_handling::types::{CaptureError, SessionError};

use super::session::ConnectionSession;

/// Drives one session from dial to logger shutdown.
///
/// The supervisor dials the target, opens one text log and two binary logs,
/// starts one [`Forwarder`] per direction and waits for exactly two completion
/// signals. It then sends the sentinel to every logger without waiting for
/// them to close their files; the returned [`SessionOutcome`] carries the
/// logger handles for whoever wants to.
pub struct ConnectionSupervisor {
    conn_id: u64,
    target: String,
    log_dir: PathBuf,
}

/// Result of a session that got past the dial step.
#[derive(Debug)]
pub struct SessionOutcome {
    pub session: ConnectionSession,
    pub stats: Vec<ForwardStats>,
    pub loggers: Vec<JoinHandle<LogSummary>>,
}

struct SessionLogs {
    text: LogSender,
    client_to_target: LogSender,
    target_to_client: LogSender,
    handles: Vec<JoinHandle<LogSummary>>,
}

impl ConnectionSupervisor {
    pub fn new(conn_id: u64, target: impl Into<String>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            conn_id,
            target: target.into(),
            log_dir: log_dir.into(),
        }
    }

    /// Runs the whole session for an accepted `client` connection.
    ///
    /// # Errors
    ///
    /// - [`SessionError::DialFailed`]: the target refused; `client` is closed
    ///   and no log file exists for this session.
    /// - [`SessionError::Capture`]: a log file could not be created
    ///   (see [`SessionError::is_fatal`]) or a socket address was unavailable.
    pub async fn run(self, client: TcpStream) -> Result<SessionOutcome, SessionError> {
        let target_stream = match TcpStream::connect(&self.target).await {
            Ok(s) => s,
            Err(source) => {
                drop(client);
                return Err(SessionError::DialFailed {
                    target: self.target,
                    source,
                });
            }
        };

        let client_addr = client
            .peer_addr()
            .map_err(CaptureError::AddressUnavailable)?;
        let local_addr = target_stream
            .local_addr()
            .map_err(CaptureError::AddressUnavailable)?;
        let target_addr = target_stream
            .peer_addr()
            .map_err(CaptureError::AddressUnavailable)?;

        let mut session = ConnectionSession::new(self.conn_id, client_addr, local_addr, target_addr);
        let logs = self.open_logs(&session).await?;

        info!(
            "[{:04}] {} connected, relaying to {} via {}",
            self.conn_id, client_addr, target_addr, local_addr
        );
        let connected = LogEvent::Connected {
            target: &self.target,
            at: &session.start_time,
        }
        .to_bytes();
        self.text(&logs.text, connected).await;

        let (client_read, client_write) = client.into_split();
        let (target_read, target_write) = target_stream.into_split();
        let (done_tx, mut done_rx) = mpsc::channel(2);
        let close = SessionClose::new();

        let forwarders = [
            Forwarder::new(
                self.conn_id,
                DirectionChannel {
                    direction: Direction::TargetToClient,
                    source: target_read,
                    destination: client_write,
                    source_name: target_addr.to_string(),
                    destination_name: client_addr.to_string(),
                    text_log: logs.text.clone(),
                    binary_log: logs.target_to_client.clone(),
                    done: done_tx.clone(),
                    close: close.clone(),
                },
            )
            .spawn(),
            Forwarder::new(
                self.conn_id,
                DirectionChannel {
                    direction: Direction::ClientToTarget,
                    source: client_read,
                    destination: target_write,
                    source_name: client_addr.to_string(),
                    destination_name: target_addr.to_string(),
                    text_log: logs.text.clone(),
                    binary_log: logs.client_to_target.clone(),
                    done: done_tx,
                    close,
                },
            )
            .spawn(),
        ];

        let mut completed = Vec::with_capacity(2);
        while completed.len() < 2 {
            match done_rx.recv().await {
                Some(direction) => {
                    debug!("[{:04}] {} completed", self.conn_id, direction);
                    completed.push(direction);
                }
                None => {
                    error!(
                        "[{:04}] forwarder exited without signalling completion",
                        self.conn_id
                    );
                    break;
                }
            }
        }

        let mut stats = Vec::with_capacity(2);
        for handle in forwarders {
            match handle.await {
                Ok(s) => stats.push(s),
                Err(e) => warn!("[{:04}] forwarder task failed: {}", self.conn_id, e),
            }
        }

        let duration = session.finish();
        let finished = LogEvent::Finished {
            started: &session.start_time,
            duration,
        }
        .to_bytes();
        self.text(&logs.text, finished).await;

        for sender in [&logs.text, &logs.client_to_target, &logs.target_to_client] {
            if let Err(e) = sender.close().await {
                warn!("[{:04}] {}", self.conn_id, e);
            }
        }

        let relayed: u64 = stats.iter().map(|s| s.bytes).sum();
        info!(
            "[{:04}] {} finished after {}, {} bytes relayed",
            self.conn_id,
            client_addr,
            format_duration(duration),
            relayed
        );

        Ok(SessionOutcome {
            session,
            stats,
            loggers: logs.handles,
        })
    }

    /// Creates the three log files of the session and starts their loggers.
    async fn open_logs(&self, session: &ConnectionSession) -> Result<SessionLogs, CaptureError> {
        let local = printable_addr(&session.local_addr);
        let remote = printable_addr(&session.target_addr);

        let text_role = LogRole::Text {
            local: local.clone(),
            remote: remote.clone(),
        };
        let (text_logger, text) = Logger::create(&self.log_dir, &text_role, self.conn_id).await?;
        let (c2t_logger, client_to_target) =
            Logger::create(&self.log_dir, &LogRole::Binary { peer: local }, self.conn_id).await?;
        let (t2c_logger, target_to_client) =
            Logger::create(&self.log_dir, &LogRole::Binary { peer: remote }, self.conn_id).await?;

        Ok(SessionLogs {
            text,
            client_to_target,
            target_to_client,
            handles: vec![text_logger.spawn(), c2t_logger.spawn(), t2c_logger.spawn()],
        })
    }

    async fn text(&self, logger: &LogSender, blob: Vec<u8>) {
        if let Err(e) = logger.send(blob).await {
            warn!("[{:04}] {}", self.conn_id, e);
        }
    }
}
