use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum ConfigError {
    EmptyHost,
    LogDirMissing(String),
    LogDirNotADirectory(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::EmptyHost => write!(f, "Target host must not be empty"),
            ConfigError::LogDirMissing(e) => write!(f, "Log directory does not exist: {}", e),
            ConfigError::LogDirNotADirectory(e) => write!(f, "Log path is not a directory: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Errors raised by the per-session capture machinery (loggers and forwarders).
#[derive(Debug)]
pub enum CaptureError {
    /// The log file could not be created. Always fatal for the process.
    LogFileCreation {
        path: PathBuf,
        source: std::io::Error,
    },
    LogWrite(std::io::Error),
    /// The logger already processed its sentinel or is gone.
    LoggerClosed(PathBuf),
    AddressUnavailable(std::io::Error),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::LogFileCreation { path, source } => {
                write!(f, "Unable to create file {}, {}", path.display(), source)
            }
            CaptureError::LogWrite(e) => write!(f, "Log write error: {}", e),
            CaptureError::LoggerClosed(path) => write!(f, "Logger for {} is closed", path.display()),
            CaptureError::AddressUnavailable(e) => write!(f, "Socket address unavailable: {}", e),
        }
    }
}

impl CaptureError {
    /// Whether this error must bring the whole process down rather than just
    /// ending the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CaptureError::LogFileCreation { .. })
    }
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CaptureError::LogFileCreation { source, .. } => Some(source),
            CaptureError::LogWrite(e) | CaptureError::AddressUnavailable(e) => Some(e),
            CaptureError::LoggerClosed(_) => None,
        }
    }
}

#[derive(Debug)]
pub enum SessionError {
    DialFailed {
        target: String,
        source: std::io::Error,
    },
    Capture(CaptureError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::DialFailed { target, source } => {
                write!(f, "Unable to connect to {}, {}", target, source)
            }
            SessionError::Capture(e) => write!(f, "Capture error: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<CaptureError> for SessionError {
    fn from(err: CaptureError) -> Self {
        SessionError::Capture(err)
    }
}

impl SessionError {
    /// See [`CaptureError::is_fatal`]; a failed dial never is.
    pub fn is_fatal(&self) -> bool {
        match self {
            SessionError::Capture(e) => e.is_fatal(),
            SessionError::DialFailed { .. } => false,
        }
    }
}

#[derive(Debug)]
pub enum NetworkError {
    BindFailed(std::io::Error),
    LoggerFailed(CaptureError),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::BindFailed(e) => write!(f, "Unable to start listener, {}", e),
            NetworkError::LoggerFailed(e) => write!(f, "Logger failed: {}", e),
        }
    }
}

impl std::error::Error for NetworkError {}
