//! Centralized error types for the library
//!
//! All library errors are represented by the `IotError` enum.
//! Use `Result<T>` as shorthand for `std::result::Result<T, IotError>`.

use std::fmt;
use std::path::PathBuf;

/// All library errors
#[derive(Debug)]
pub enum IotError {
    // === Transport ===
    /// I/O failed, reconnect was attempted, and the retry also failed
    TransportFailed { detail: String },
    /// `read_until` did not see its pattern before the deadline
    Timeout { waited: std::time::Duration },
    /// Peer closed the connection (zero-length read)
    ConnectionReset,
    /// Failed to open a serial port
    SerialOpen {
        port: String,
        source: std::io::Error,
    },
    /// Failed to bind a UDP socket
    UdpBind { port: u16, source: std::io::Error },
    /// Failed to bind the TLS/TCP connection server
    ServerBind { port: u16, source: std::io::Error },

    // === Auth ===
    /// Client-side handshake was rejected by the gateway
    AuthFailed { reason: String },

    // === Protocol ===
    /// The REPL framing was violated (missing banner, missing `OK`, ...)
    ReplProtocolError { detail: String },
    /// The remote evaluation raised an exception; carries its traceback text
    ReplExecutionError { traceback: String },

    // === Config ===
    /// Configuration could not be read or parsed
    ConfigLoad {
        path: PathBuf,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    // === Registry ===
    /// No device registered under the requested UID
    DeviceUnknown { uid: String },
    /// Device is locked by another session
    DeviceBusy { uid: String },
}

impl std::error::Error for IotError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SerialOpen { source, .. } | Self::UdpBind { source, .. } | Self::ServerBind { source, .. } => {
                Some(source)
            }
            Self::ConfigLoad { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for IotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransportFailed { detail } => write!(f, "transport failed: {}", detail),
            Self::Timeout { waited } => write!(f, "timed out after {:.1}s", waited.as_secs_f64()),
            Self::ConnectionReset => write!(f, "connection reset by peer"),
            Self::SerialOpen { port, .. } => write!(f, "cannot open serial port: {}", port),
            Self::UdpBind { port, .. } => write!(f, "cannot bind UDP port {}", port),
            Self::ServerBind { port, .. } => write!(f, "cannot bind connection server port {}", port),
            Self::AuthFailed { reason } => write!(f, "authentication failed: {}", reason),
            Self::ReplProtocolError { detail } => write!(f, "REPL protocol error: {}", detail),
            Self::ReplExecutionError { traceback } => write!(f, "remote execution error:\n{}", traceback),
            Self::ConfigLoad { path, .. } => write!(f, "cannot load config: {}", path.display()),
            Self::DeviceUnknown { uid } => write!(f, "no such device: {}", uid),
            Self::DeviceBusy { uid } => write!(f, "device busy: {}", uid),
        }
    }
}

/// Alias for Result with IotError
pub type Result<T> = std::result::Result<T, IotError>;
