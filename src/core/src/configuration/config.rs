use crate::error_handling::types::ConfigError;
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration of the relay.
///
/// Only three values are mandatory: the target host, the target port and the
/// local port to listen on. Everything else has a default matching the
/// behaviour of a bare `tcpspy -host h -port p -listen_port l` invocation.
///
/// # Examples
///
/// ```
/// use clap::Parser;
/// use tcpspy::configuration::config::Config;
///
/// let config = Config::try_parse_from([
///     "tcpspy", "--host", "db.internal", "--port", "5432", "--listen-port", "6432",
/// ]).unwrap();
/// assert_eq!(config.target(), "db.internal:5432");
/// ```
#[derive(Parser, Debug, Clone)]
#[command(name = "tcpspy")]
#[command(version)]
#[command(about = "Transparent TCP relay recording both directions to disk")]
pub struct Config {
    /// Target host or address
    #[arg(long, env = "TCPSPY_HOST")]
    pub host: String,

    /// Target port
    #[arg(long, env = "TCPSPY_PORT")]
    pub port: u16,

    /// Local port to accept client connections on
    #[arg(long, alias = "listen_port", env = "TCPSPY_LISTEN_PORT")]
    pub listen_port: u16,

    /// Local address to bind; all interfaces by default
    #[arg(long, default_value = "0.0.0.0", env = "TCPSPY_LISTEN_ADDRESS")]
    pub listen_address: String,

    /// Directory receiving the text and binary session logs
    #[arg(long, default_value = ".", env = "TCPSPY_LOG_DIR")]
    pub log_dir: PathBuf,

    /// Upper bound, in seconds, on waiting for in-flight sessions at shutdown
    #[arg(long, default_value_t = 5, env = "TCPSPY_DRAIN_TIMEOUT_SECS")]
    pub drain_timeout_secs: u64,
}

impl Config {
    /// Checks the values clap cannot check on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if !self.log_dir.exists() {
            return Err(ConfigError::LogDirMissing(
                self.log_dir.display().to_string(),
            ));
        }
        if !self.log_dir.is_dir() {
            return Err(ConfigError::LogDirNotADirectory(
                self.log_dir.display().to_string(),
            ));
        }
        Ok(())
    }

    /// `host:port` of the service every accepted connection is relayed to.
    pub fn target(&self) -> String {
        join_host_port(&self.host, self.port)
    }

    /// `address:port` the listener binds.
    pub fn listen_addr(&self) -> String {
        join_host_port(&self.listen_address, self.listen_port)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Joins a host and a port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{}]:{}", host, port),
        _ if host.contains(':') && !host.starts_with('[') => format!("[{}]:{}", host, port),
        _ => format!("{}:{}", host, port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_args_under_test(extra: &[&str]) -> Result<Config, clap::Error> {
        let mut args = vec![
            "tcpspy",
            "--host",
            "127.0.0.1",
            "--port",
            "5432",
            "--listen-port",
            "6432",
        ];
        args.extend_from_slice(extra);
        Config::try_parse_from(args)
    }

    #[test]
    fn test_from_args_defaults() {
        let config = from_args_under_test(&[]).unwrap_or_else(|e| panic!("{}", e));

        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 5432);
        assert_eq!(config.listen_port, 6432);
        assert_eq!(config.listen_address, "0.0.0.0");
        assert_eq!(config.log_dir, PathBuf::from("."));
        assert_eq!(config.drain_timeout(), Duration::from_secs(5));
        assert_eq!(config.target(), "127.0.0.1:5432");
        assert_eq!(config.listen_addr(), "0.0.0.0:6432");
    }

    #[test]
    fn test_underscore_alias_is_accepted() {
        let config = Config::try_parse_from([
            "tcpspy",
            "--host",
            "localhost",
            "--port",
            "80",
            "--listen_port",
            "8080",
        ])
        .unwrap();
        assert_eq!(config.listen_port, 8080);
    }

    #[test]
    fn test_missing_required_values_is_an_error() {
        let err = Config::try_parse_from(["tcpspy", "--host", "localhost"]).unwrap_err();
        assert_eq!(
            err.kind(),
            clap::error::ErrorKind::MissingRequiredArgument
        );
    }

    #[test]
    fn test_bad_port_is_an_error() {
        assert!(Config::try_parse_from([
            "tcpspy",
            "--host",
            "localhost",
            "--port",
            "70000",
            "--listen-port",
            "1",
        ])
        .is_err());
    }

    #[test]
    fn test_join_host_port_brackets_ipv6() {
        assert_eq!(join_host_port("::1", 80), "[::1]:80");
        assert_eq!(join_host_port("fe80::1%eth0", 80), "[fe80::1%eth0]:80");
        assert_eq!(join_host_port("10.0.0.1", 80), "10.0.0.1:80");
        assert_eq!(join_host_port("example.org", 443), "example.org:443");
    }

    #[test]
    fn test_validate_rejects_empty_host_and_missing_dir() {
        let mut config = from_args_under_test(&[]).unwrap();
        config.host = "  ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::EmptyHost)));

        let mut config = from_args_under_test(&[]).unwrap();
        config.log_dir = PathBuf::from("/definitely/not/here");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::LogDirMissing(_))
        ));
    }

    #[test]
    fn test_validate_accepts_existing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = from_args_under_test(&["--log-dir", dir.path().to_str().unwrap()]).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_file_as_log_dir() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config =
            from_args_under_test(&["--log-dir", file.path().to_str().unwrap()]).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::LogDirNotADirectory(_))
        ));
    }
}
