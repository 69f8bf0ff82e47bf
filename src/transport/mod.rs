//! Byte-level transport abstraction
//!
//! Separates I/O concerns from protocol logic:
//! - **ByteChannel**: how bytes flow (serial port, TLS socket, ...)
//! - **Repl / Fcopy / Rsync**: what the bytes mean
//!
//! Unlike a message-relay transport, the REPL wire protocol is strictly
//! sequential request/response: send code, then block until the device
//! echoes back a known terminator. `ByteChannel` exposes that shape
//! directly instead of handing back an mpsc channel pair.
//!
//! # Adding a new channel
//!
//! 1. Create `transport/my_channel.rs`
//! 2. Implement `ByteChannel` for it
//! 3. Add `pub mod my_channel;` here

pub mod net;
pub mod serial;

pub use net::NetChannel;
pub use serial::SerialChannel;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;

use crate::error::Result;

/// Identifies a channel for Registry de-duplication.
///
/// A serial channel is identified by its port path; a network channel by
/// the gateway's `(ip, port)` plus the advertised `uid` (spec §3: "remote
/// `(ip, port, uid)` tuple" - distinct gateways can advertise devices on
/// the same address over time, so uid disambiguates). Two channels with
/// the same id are the same physical connection as far as the Registry is
/// concerned.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelId {
    Serial(String),
    Net(std::net::SocketAddr, String),
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial(port) => write!(f, "serial:{port}"),
            Self::Net(addr, uid) => write!(f, "net:{addr}:{uid}"),
        }
    }
}

/// Abstract byte-level transport to a device.
///
/// A channel does NOT understand REPL framing, file-transfer ACKs, or
/// rsync listings - those live one layer up. It only guarantees the four
/// read shapes and chunked writes described below, plus a uniform
/// reconnect-once failure contract.
///
/// # Failure contract
///
/// A transient I/O error triggers exactly one transparent reconnect
/// attempt. If the retry also fails, the error surfaces to the caller as
/// [`crate::error::IotError::TransportFailed`].
#[async_trait]
pub trait ByteChannel: Send {
    /// Stable identity used for Registry de-duplication and equality.
    fn id(&self) -> ChannelId;

    /// Block until exactly `n` bytes have been received.
    async fn read(&mut self, n: usize) -> Result<Bytes>;

    /// Return whatever is immediately available, possibly empty, without
    /// blocking beyond a short poll.
    async fn read_all(&mut self) -> Result<Bytes>;

    /// Accumulate bytes until the tail of the buffer equals `pattern`.
    ///
    /// Implementations append one byte at a time and compare only the
    /// trailing `pattern.len()` bytes, so a pattern straddling two
    /// underlying reads is still recognized. Fails with
    /// [`crate::error::IotError::Timeout`] once `timeout` elapses.
    async fn read_until(&mut self, pattern: &[u8], timeout: Duration) -> Result<Bytes>;

    /// Write all of `data`.
    ///
    /// May internally split the payload into chunks of at most
    /// [`crate::constants::WRITE_CHUNK_SIZE`] bytes with
    /// [`crate::constants::WRITE_CHUNK_PACING_MS`] pacing between chunks -
    /// required for small embedded USB-CDC stacks that drop oversized
    /// bursts.
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Release the underlying I/O resource. Idempotent.
    async fn close(&mut self);
}

/// Read the tail-compare loop shared by every `ByteChannel::read_until` impl.
///
/// `read_one` must return exactly one byte per call, blocking as needed;
/// it is expected to come from a channel-specific non-blocking-with-retry
/// primitive so this helper stays transport-agnostic.
pub(crate) fn tail_matches(buf: &[u8], pattern: &[u8]) -> bool {
    pattern.len() <= buf.len() && &buf[buf.len() - pattern.len()..] == pattern
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_matches_exact_suffix() {
        assert!(tail_matches(b"hello>", b">"));
        assert!(tail_matches(b"raw REPL; CTRL-B to exit\r\n>", b"\r\n>"));
    }

    #[test]
    fn tail_matches_rejects_prefix_only() {
        assert!(!tail_matches(b">hello", b">"));
    }

    #[test]
    fn tail_matches_handles_pattern_longer_than_buffer() {
        assert!(!tail_matches(b"a", b"abc"));
    }

    #[test]
    fn channel_id_display() {
        assert_eq!(ChannelId::Serial("/dev/ttyUSB0".into()).to_string(), "serial:/dev/ttyUSB0");
    }

    #[test]
    fn channel_id_net_display_includes_uid() {
        let addr: std::net::SocketAddr = "127.0.0.1:50001".parse().unwrap();
        assert_eq!(
            ChannelId::Net(addr, "aa:bb".into()).to_string(),
            "net:127.0.0.1:50001:aa:bb"
        );
    }
}
