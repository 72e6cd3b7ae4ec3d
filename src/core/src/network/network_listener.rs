//! # Network Listener Module
//!
//! Accepts client connections and hands each one to its own
//! [`ConnectionSupervisor`] task.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌──────────────────┐    ┌──────────────────────┐
//! │ Incoming        │───▶│ NetworkListener  │───▶│ ConnectionSupervisor │
//! │ Connections     │    │                  │    │ (one task per conn)  │
//! └─────────────────┘    │ - connection ids │    └──────────────────────┘
//!                        │ - fatal errors   │
//!                        │ - shutdown drain │
//!                        └──────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use clap::Parser;
//! use tcpspy::configuration::Config;
//! use tcpspy::error_handling::types::NetworkError;
//! use tcpspy::network::NetworkListener;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), NetworkError> {
//!     let config = Config::parse();
//!     let listener = NetworkListener::bind(&config).await?;
//!     listener.run(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     }).await
//! }
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::configuration::Config;
use crate::error_handling::types::{CaptureError, NetworkError, SessionError};
use crate::session_management::ConnectionSupervisor;

/// Accept loop of the relay.
///
/// Owns the process-wide connection counter: ids start at 1 and are only
/// ever handed out by [`NetworkListener::run`], one per accepted connection.
pub struct NetworkListener {
    listener: TcpListener,
    target: String,
    log_dir: PathBuf,
    drain_timeout: Duration,
    next_conn_id: u64,
    active_sessions: Arc<AtomicUsize>,
}

impl NetworkListener {
    /// Binds the listen address of `config`.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::BindFailed`] if the address cannot be bound.
    pub async fn bind(config: &Config) -> Result<Self, NetworkError> {
        Self::bind_to(
            &config.listen_addr(),
            config.target(),
            config.log_dir.clone(),
            config.drain_timeout(),
        )
        .await
    }

    pub async fn bind_to(
        listen_addr: &str,
        target: impl Into<String>,
        log_dir: impl Into<PathBuf>,
        drain_timeout: Duration,
    ) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(NetworkError::BindFailed)?;
        Ok(Self {
            listener,
            target: target.into(),
            log_dir: log_dir.into(),
            drain_timeout,
            next_conn_id: 1,
            active_sessions: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Live count of sessions whose supervisor or loggers are still running.
    #[cfg(test)]
    pub(crate) fn active_sessions(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.active_sessions)
    }

    fn next_conn_id(&mut self) -> u64 {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        id
    }

    /// Accepts connections until `shutdown` resolves.
    ///
    /// Accept errors are reported and the loop continues. Each accepted
    /// connection runs in its own task; the loop never waits on one. Once
    /// `shutdown` resolves, in-flight sessions get up to the drain timeout to
    /// finish, loggers included.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::LoggerFailed`] as soon as any session fails to
    /// create a log file.
    pub async fn run<F>(mut self, shutdown: F) -> Result<(), NetworkError>
    where
        F: Future<Output = ()> + Send,
    {
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<CaptureError>(1);
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let conn_id = self.next_conn_id();
                        debug!("[{:04}] accepted connection from {}", conn_id, peer);
                        self.active_sessions.fetch_add(1, Ordering::SeqCst);
                        sessions.spawn(serve(
                            stream,
                            ConnectionSupervisor::new(conn_id, self.target.clone(), self.log_dir.clone()),
                            conn_id,
                            fatal_tx.clone(),
                            Arc::clone(&self.active_sessions),
                        ));
                    }
                    Err(e) => {
                        error!("Accept failed, {}", e);
                    }
                },
                Some(err) = fatal_rx.recv() => {
                    error!("{}", err);
                    return Err(NetworkError::LoggerFailed(err));
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        warn!("session task failed: {}", e);
                    }
                }
                _ = &mut shutdown => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        self.drain(sessions).await;
        Ok(())
    }

    async fn drain(&self, mut sessions: JoinSet<()>) {
        let pending = sessions.len();
        if pending == 0 {
            return;
        }
        info!("waiting up to {:?} for {} session(s)", self.drain_timeout, pending);

        let drained = timeout(self.drain_timeout, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;

        match drained {
            Ok(()) => info!("all sessions drained"),
            Err(_) => {
                warn!(
                    "{} session(s) still running after {:?}, abandoning them",
                    sessions.len(),
                    self.drain_timeout
                );
                sessions.abort_all();
            }
        }
    }
}

/// Session task body: runs the supervisor, then waits for its loggers so the
/// session only counts as gone once its files are closed.
async fn serve(
    stream: TcpStream,
    supervisor: ConnectionSupervisor,
    conn_id: u64,
    fatal_tx: mpsc::Sender<CaptureError>,
    active_sessions: Arc<AtomicUsize>,
) {
    match supervisor.run(stream).await {
        Ok(outcome) => {
            for logger in outcome.loggers {
                if let Err(e) = logger.await {
                    warn!("[{:04}] logger task failed: {}", conn_id, e);
                }
            }
        }
        Err(SessionError::Capture(e)) if e.is_fatal() => {
            let _ = fatal_tx.send(e).await;
        }
        Err(e) => {
            error!("[{:04}] {}", conn_id, e);
        }
    }
    active_sessions.fetch_sub(1, Ordering::SeqCst);
}
