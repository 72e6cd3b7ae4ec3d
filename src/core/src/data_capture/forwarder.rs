//! One-direction byte pump.
//!
//! A [`Forwarder`] reads from its source, records every chunk in the shared
//! text log (event line plus hex dump) and in its own binary log, then writes
//! the chunk unmodified to its destination. Sequence number and offset are
//! private to the forwarder and start at zero.
//!
//! Both forwarders of a session share a [`SessionClose`] signal. Whichever
//! stops first trips it, which ends the other one's pending read or write as
//! a disconnect, so the two directions always terminate together.

use std::io;
use std::sync::Arc;

use log::{debug, trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

use super::hex_dump::hex_dump;
use super::logger::LogSender;
use super::types::{Direction, LogEvent};

/// Read buffer size; one read never yields more than this many bytes.
pub const BUFFER_SIZE: usize = 10240;

/// Close signal shared by the two forwarders of one session.
///
/// Tripping it more than once is harmless.
#[derive(Debug, Clone)]
pub struct SessionClose {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl SessionClose {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`close`](SessionClose::close) has been called.
    pub async fn closed(&mut self) {
        // The sender lives in `self`, so the channel cannot be dropped here.
        let _ = self.rx.wait_for(|closed| *closed).await;
    }
}

impl Default for SessionClose {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything one direction of a session needs: both connection ends, the
/// shared text log, this direction's binary log and the completion channel.
pub struct DirectionChannel<R, W> {
    pub direction: Direction,
    pub source: R,
    pub destination: W,
    /// Display name of the peer behind `source`.
    pub source_name: String,
    /// Display name of the peer behind `destination`.
    pub destination_name: String,
    pub text_log: LogSender,
    pub binary_log: LogSender,
    pub done: mpsc::Sender<Direction>,
    pub close: SessionClose,
}

/// Totals of one finished direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardStats {
    pub direction: Direction,
    pub packets: u64,
    pub bytes: u64,
}

pub struct Forwarder<R, W> {
    conn_id: u64,
    channel: DirectionChannel<R, W>,
    offset: u64,
    seq: u64,
}

impl<R, W> Forwarder<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(conn_id: u64, channel: DirectionChannel<R, W>) -> Self {
        Self {
            conn_id,
            channel,
            offset: 0,
            seq: 0,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<ForwardStats> {
        tokio::spawn(self.run())
    }

    /// Pumps until the source ends, fails, or the other direction closes the
    /// session. Closes both ends and sends exactly one completion signal.
    pub async fn run(mut self) -> ForwardStats {
        let direction = self.channel.direction;
        trace!("[{:04}] {} forwarder started", self.conn_id, direction);

        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            let mut close = self.channel.close.clone();
            let read = tokio::select! {
                biased;
                _ = close.closed() => Err(closed_by_peer()),
                r = self.channel.source.read(&mut buf) => r,
            };

            let n = match read {
                Ok(0) => {
                    debug!("[{:04}] {} EOF from {}", self.conn_id, direction, self.channel.source_name);
                    self.disconnected().await;
                    break;
                }
                Err(e) => {
                    debug!(
                        "[{:04}] {} read from {} ended: {}",
                        self.conn_id, direction, self.channel.source_name, e
                    );
                    self.disconnected().await;
                    break;
                }
                Ok(n) => n,
            };

            if !self.relay(&buf[..n]).await {
                break;
            }
        }

        self.finish().await
    }

    /// Records and forwards one chunk. Returns false if the forwarder must
    /// stop, either because the destination write failed or because the
    /// other direction closed the session while the write was pending.
    async fn relay(&mut self, chunk: &[u8]) -> bool {
        let conn_id = self.conn_id;
        let direction = self.channel.direction;

        let received = LogEvent::Received {
            seq: self.seq,
            offset: self.offset,
            len: chunk.len(),
            from: &self.channel.source_name,
        }
        .to_bytes();
        record(&self.channel.text_log, conn_id, direction, received).await;
        record(&self.channel.text_log, conn_id, direction, hex_dump(chunk)).await;
        record(&self.channel.binary_log, conn_id, direction, chunk).await;

        // A destination that stopped reading must not pin this direction once
        // the other one is gone.
        let mut close = self.channel.close.clone();
        let written = tokio::select! {
            biased;
            w = self.channel.destination.write_all(chunk) => Some(w),
            _ = close.closed() => None,
        };

        match written {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                let failed = LogEvent::WriteFailed {
                    to: &self.channel.destination_name,
                    error: &e,
                }
                .to_bytes();
                record(&self.channel.text_log, conn_id, direction, failed).await;
                debug!(
                    "[{:04}] {} write to {} failed: {}",
                    conn_id, direction, self.channel.destination_name, e
                );
                return false;
            }
            None => {
                debug!(
                    "[{:04}] {} write to {} abandoned: {}",
                    conn_id,
                    direction,
                    self.channel.destination_name,
                    closed_by_peer()
                );
                self.disconnected().await;
                return false;
            }
        }

        let sent = LogEvent::Sent {
            seq: self.seq,
            to: &self.channel.destination_name,
        }
        .to_bytes();
        record(&self.channel.text_log, conn_id, direction, sent).await;

        trace!(
            "[{:04}] {} relayed #{} ({} bytes at offset {:#x})",
            conn_id,
            direction,
            self.seq,
            chunk.len(),
            self.offset
        );
        self.offset += chunk.len() as u64;
        self.seq += 1;
        true
    }

    async fn disconnected(&mut self) {
        let event = LogEvent::Disconnected {
            from: &self.channel.source_name,
        }
        .to_bytes();
        record(&self.channel.text_log, self.conn_id, self.channel.direction, event).await;
    }

    async fn finish(self) -> ForwardStats {
        let Self {
            conn_id,
            channel,
            offset,
            seq,
        } = self;
        let DirectionChannel {
            direction,
            source,
            mut destination,
            done,
            close,
            ..
        } = channel;

        // Already-closed peers make shutdown fail; that is fine.
        let _ = destination.shutdown().await;
        drop(destination);
        drop(source);
        close.close();

        if done.send(direction).await.is_err() {
            warn!("[{:04}] {} completion not delivered", conn_id, direction);
        }
        debug!(
            "[{:04}] {} forwarder finished: {} packets, {} bytes",
            conn_id, direction, seq, offset
        );
        ForwardStats {
            direction,
            packets: seq,
            bytes: offset,
        }
    }
}

fn closed_by_peer() -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionAborted,
        "session closed by the other direction",
    )
}

/// Hands `blob` to a logger; a closed logger only costs a warning.
async fn record(
    log: &LogSender,
    conn_id: u64,
    direction: Direction,
    blob: impl Into<Vec<u8>>,
) {
    if let Err(e) = log.send(blob).await {
        warn!("[{:04}] {}: {}", conn_id, direction, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_capture::logger::{LogSummary, Logger};
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;
    use tokio_test::io::Builder;

    struct Logs {
        _dir: tempfile::TempDir,
        text_path: PathBuf,
        binary_path: PathBuf,
        text: LogSender,
        binary: LogSender,
        handles: Vec<JoinHandle<LogSummary>>,
    }

    impl Logs {
        async fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let text_path = dir.path().join("text.log");
            let binary_path = dir.path().join("binary.log");
            let (text_logger, text) = Logger::create_at(text_path.clone(), 1).await.unwrap();
            let (binary_logger, binary) =
                Logger::create_at(binary_path.clone(), 1).await.unwrap();
            Self {
                _dir: dir,
                text_path,
                binary_path,
                text,
                binary,
                handles: vec![text_logger.spawn(), binary_logger.spawn()],
            }
        }

        async fn finish(self) -> (String, Vec<u8>) {
            self.text.close().await.unwrap();
            self.binary.close().await.unwrap();
            for h in self.handles {
                timeout(Duration::from_secs(2), h).await.unwrap().unwrap();
            }
            (
                std::fs::read_to_string(&self.text_path).unwrap(),
                std::fs::read(&self.binary_path).unwrap(),
            )
        }
    }

    fn channel<R, W>(
        logs: &Logs,
        source: R,
        destination: W,
        close: SessionClose,
    ) -> (DirectionChannel<R, W>, mpsc::Receiver<Direction>) {
        let (done, done_rx) = mpsc::channel(2);
        (
            DirectionChannel {
                direction: Direction::ClientToTarget,
                source,
                destination,
                source_name: "127.0.0.1:40000".to_string(),
                destination_name: "127.0.0.1:5432".to_string(),
                text_log: logs.text.clone(),
                binary_log: logs.binary.clone(),
                done,
                close,
            },
            done_rx,
        )
    }

    #[tokio::test]
    async fn test_forwards_and_logs_ping() {
        let _ = env_logger::builder().is_test(true).try_init();
        let logs = Logs::new().await;
        let source = Builder::new().read(b"PING").build();
        let destination = Builder::new().write(b"PING").build();
        let close = SessionClose::new();
        let (chan, mut done_rx) = channel(&logs, source, destination, close.clone());

        let stats = timeout(Duration::from_secs(2), Forwarder::new(1, chan).run())
            .await
            .unwrap();

        assert_eq!(stats.packets, 1);
        assert_eq!(stats.bytes, 4);
        assert_eq!(done_rx.recv().await, Some(Direction::ClientToTarget));
        assert!(close.is_closed());

        let (text, binary) = logs.finish().await;
        assert_eq!(binary, b"PING");
        assert_eq!(
            text,
            "Received (#0, 00000000) 4 bytes from 127.0.0.1:40000\n\
             00000000  50 49 4E 47                                       |PING|\n\
             Sent (#0) to 127.0.0.1:5432\n\
             Disconnected from 127.0.0.1:40000\n"
        );
    }

    #[tokio::test]
    async fn test_sequence_and_offsets_are_gap_free() {
        let logs = Logs::new().await;
        let source = Builder::new()
            .read(b"abc")
            .read(b"defgh")
            .read(b"i")
            .build();
        let destination = Builder::new()
            .write(b"abc")
            .write(b"defgh")
            .write(b"i")
            .build();
        let (chan, _done_rx) = channel(&logs, source, destination, SessionClose::new());

        let stats = Forwarder::new(1, chan).run().await;
        assert_eq!(stats.packets, 3);
        assert_eq!(stats.bytes, 9);

        let (text, binary) = logs.finish().await;
        assert_eq!(binary, b"abcdefghi");

        let received: Vec<&str> = text
            .lines()
            .filter(|l| l.starts_with("Received"))
            .collect();
        assert_eq!(
            received,
            vec![
                "Received (#0, 00000000) 3 bytes from 127.0.0.1:40000",
                "Received (#1, 00000003) 5 bytes from 127.0.0.1:40000",
                "Received (#2, 00000008) 1 bytes from 127.0.0.1:40000",
            ]
        );
        assert_eq!(text.matches("Disconnected from").count(), 1);
    }

    #[tokio::test]
    async fn test_read_error_counts_as_disconnect() {
        let logs = Logs::new().await;
        let source = Builder::new()
            .read(b"x")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let destination = Builder::new().write(b"x").build();
        let (chan, mut done_rx) = channel(&logs, source, destination, SessionClose::new());

        let stats = Forwarder::new(1, chan).run().await;
        assert_eq!(stats.packets, 1);
        assert!(done_rx.recv().await.is_some());

        let (text, _) = logs.finish().await;
        assert!(text.ends_with("Disconnected from 127.0.0.1:40000\n"));
    }

    #[tokio::test]
    async fn test_write_failure_stops_the_forwarder() {
        let logs = Logs::new().await;
        let source = Builder::new().read(b"lost").build();
        let destination = Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"))
            .build();
        let close = SessionClose::new();
        let (chan, mut done_rx) = channel(&logs, source, destination, close.clone());

        let stats = Forwarder::new(1, chan).run().await;
        assert_eq!(stats.packets, 0);
        assert_eq!(stats.bytes, 0);
        assert_eq!(done_rx.recv().await, Some(Direction::ClientToTarget));
        assert!(close.is_closed());

        let (text, binary) = logs.finish().await;
        // The bytes were read, so they are captured even though delivery failed.
        assert_eq!(binary, b"lost");
        assert!(text.contains("Write to 127.0.0.1:5432 failed: broken pipe\n"));
        assert!(!text.contains("Sent (#0)"));
    }

    #[tokio::test]
    async fn test_other_direction_closing_ends_a_pending_read() {
        let logs = Logs::new().await;
        // Nothing is ever written to the far end, so the read would block forever.
        let (source, _far_end) = tokio::io::duplex(64);
        let destination = Builder::new().build();
        let close = SessionClose::new();
        let (chan, mut done_rx) = channel(&logs, source, destination, close.clone());

        let handle = Forwarder::new(1, chan).spawn();
        tokio::task::yield_now().await;
        assert!(done_rx.try_recv().is_err());

        close.close();
        let stats = timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(stats.packets, 0);
        assert_eq!(done_rx.recv().await, Some(Direction::ClientToTarget));

        let (text, binary) = logs.finish().await;
        assert_eq!(text, "Disconnected from 127.0.0.1:40000\n");
        assert!(binary.is_empty());
    }

    #[tokio::test]
    async fn test_payload_larger_than_buffer_is_split_without_gaps() {
        let payload: Vec<u8> = (0..25_000u32).map(|i| (i % 251) as u8).collect();
        let logs = Logs::new().await;
        let source = Builder::new().read(&payload).build();
        let destination = Builder::new().write(&payload).build();
        let (chan, _done_rx) = channel(&logs, source, destination, SessionClose::new());

        let stats = Forwarder::new(1, chan).run().await;
        assert_eq!(stats.packets, 3);
        assert_eq!(stats.bytes, payload.len() as u64);

        let (text, binary) = logs.finish().await;
        assert_eq!(binary, payload);
        let received: Vec<&str> = text
            .lines()
            .filter(|l| l.starts_with("Received"))
            .collect();
        assert_eq!(
            received,
            vec![
                "Received (#0, 00000000) 10240 bytes from 127.0.0.1:40000",
                "Received (#1, 00002800) 10240 bytes from 127.0.0.1:40000",
                "Received (#2, 00005000) 4520 bytes from 127.0.0.1:40000",
            ]
        );
    }

    #[tokio::test]
    async fn test_other_direction_closing_ends_a_stuck_write() {
        let logs = Logs::new().await;
        let chunk = vec![b'z'; 1024];
        let source = Builder::new().read(&chunk).build();
        // The far end never reads, so the write blocks once 64 bytes are buffered.
        let (destination, _far_end) = tokio::io::duplex(64);
        let close = SessionClose::new();
        let (chan, mut done_rx) = channel(&logs, source, destination, close.clone());

        let handle = Forwarder::new(1, chan).spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(done_rx.try_recv().is_err());

        close.close();
        let stats = timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(stats.packets, 0);
        assert_eq!(done_rx.recv().await, Some(Direction::ClientToTarget));

        let (text, binary) = logs.finish().await;
        assert_eq!(binary, chunk);
        assert!(text.starts_with("Received (#0, 00000000) 1024 bytes from 127.0.0.1:40000\n"));
        assert!(text.ends_with("Disconnected from 127.0.0.1:40000\n"));
        assert!(!text.contains("Sent (#0)"));
    }

    #[test]
    fn test_session_close_is_idempotent() {
        let close = SessionClose::new();
        assert!(!close.is_closed());
        close.close();
        close.clone().close();
        assert!(close.is_closed());
    }
}
