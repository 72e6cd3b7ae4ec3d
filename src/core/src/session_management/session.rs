use chrono::{DateTime, Local, TimeDelta};
use std::net::SocketAddr;

/// One accepted client connection paired with its target connection.
#[derive(Debug, Clone)]
pub struct ConnectionSession {
    pub id: u64,
    pub client_addr: SocketAddr,
    /// Relay-side address of the connection to the target.
    pub local_addr: SocketAddr,
    pub target_addr: SocketAddr,
    pub start_time: DateTime<Local>,
    pub end_time: Option<DateTime<Local>>,
}

impl ConnectionSession {
    pub fn new(
        id: u64,
        client_addr: SocketAddr,
        local_addr: SocketAddr,
        target_addr: SocketAddr,
    ) -> Self {
        Self {
            id,
            client_addr,
            local_addr,
            target_addr,
            start_time: Local::now(),
            end_time: None,
        }
    }

    /// Marks the session finished and returns its duration.
    pub fn finish(&mut self) -> TimeDelta {
        let end = Local::now();
        self.end_time = Some(end);
        end - self.start_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_sets_end_time() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut session = ConnectionSession::new(1, addr, addr, addr);
        assert!(session.end_time.is_none());

        let elapsed = session.finish();
        assert!(elapsed >= TimeDelta::zero());
        assert_eq!(session.end_time.map(|end| end - session.start_time), Some(elapsed));
    }
}
