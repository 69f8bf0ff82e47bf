//! Serial transport for USB-CDC attached microcontrollers
//!
//! Mirrors `serial_device.py`: opens a serial port at a fixed baud rate,
//! transparently reconnects on the first transient I/O failure, and chunks
//! writes with a short pacing delay between chunks (required by small
//! embedded USB-CDC stacks that drop oversized bursts).
//!
//! `serialport::SerialPort` is a blocking API. Every operation below hands
//! the port to `spawn_blocking` and gets it back alongside the result, so
//! a session never parks a tokio worker thread on serial I/O. This is safe
//! because a `Device`'s lock already guarantees only one session touches
//! the channel at a time.

use super::{tail_matches, ByteChannel, ChannelId};
use crate::constants::{
    DEFAULT_BAUD_RATE, SERIAL_READ_TIMEOUT_MS, WRITE_CHUNK_PACING_MS, WRITE_CHUNK_SIZE,
};
use crate::error::{IotError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

type Port = Box<dyn serialport::SerialPort>;

/// `ByteChannel` backed by a local serial port.
///
/// A read timeout from the underlying port is not a transport failure -
/// `Serial.read()` in the original simply returns fewer bytes than
/// requested when its 0.5s timeout elapses, and callers loop around it.
/// Only a hard I/O error (device unplugged, broken pipe, ...) triggers the
/// reconnect-once policy.
pub struct SerialChannel {
    port_path: String,
    baud_rate: u32,
    port: Option<Port>,
}

impl SerialChannel {
    /// Open `port_path` at `baud_rate` (default 115200, no parity, 0.5s read timeout).
    pub fn open(port_path: &str, baud_rate: u32) -> Result<Self> {
        let port = Self::connect(port_path, baud_rate)?;
        Ok(Self {
            port_path: port_path.to_string(),
            baud_rate,
            port: Some(port),
        })
    }

    /// Open at the default baud rate.
    pub fn open_default(port_path: &str) -> Result<Self> {
        Self::open(port_path, DEFAULT_BAUD_RATE)
    }

    fn connect(port_path: &str, baud_rate: u32) -> Result<Port> {
        serialport::new(port_path, baud_rate)
            .parity(serialport::Parity::None)
            .timeout(Duration::from_millis(SERIAL_READ_TIMEOUT_MS))
            .open()
            .map_err(|e| IotError::SerialOpen {
                port: port_path.to_string(),
                source: std::io::Error::other(e.to_string()),
            })
    }

    async fn reconnect(&mut self) -> Result<()> {
        debug!(port = %self.port_path, "reconnecting serial channel");
        let path = self.port_path.clone();
        let baud = self.baud_rate;
        let port = tokio::task::spawn_blocking(move || Self::connect(&path, baud))
            .await
            .expect("reconnect task panicked")?;
        self.port = Some(port);
        Ok(())
    }

    async fn take_port(&mut self) -> Result<Port> {
        if self.port.is_none() {
            self.reconnect().await?;
        }
        Ok(self.port.take().expect("just connected"))
    }

    /// Read up to `n` bytes (less on timeout), reconnecting once before
    /// surfacing `TransportFailed` on a real I/O error.
    async fn read_chunk(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut last_err = None;
        for attempt in 0..2 {
            if attempt == 1 {
                self.reconnect().await?;
            }
            let mut port = self.take_port().await?;
            let (port, outcome) = tokio::task::spawn_blocking(move || {
                let mut buf = vec![0u8; n];
                let res = port.read(&mut buf).map(|read| {
                    buf.truncate(read);
                    buf
                });
                (port, res)
            })
            .await
            .expect("serial read task panicked");
            match outcome {
                Ok(buf) => {
                    self.port = Some(port);
                    return Ok(buf);
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    self.port = Some(port);
                    return Ok(Vec::new());
                }
                Err(e) => {
                    warn!(port = %self.port_path, error = %e, attempt, "serial read failed");
                    last_err = Some(e);
                }
            }
        }
        Err(IotError::TransportFailed {
            detail: last_err.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    async fn write_chunk(&mut self, data: Vec<u8>) -> Result<()> {
        let mut last_err = None;
        for attempt in 0..2 {
            if attempt == 1 {
                self.reconnect().await?;
            }
            let port = self.take_port().await?;
            let data = data.clone();
            let (port, outcome) = tokio::task::spawn_blocking(move || {
                let mut port = port;
                let res = port.write_all(&data);
                (port, res)
            })
            .await
            .expect("serial write task panicked");
            match outcome {
                Ok(()) => {
                    self.port = Some(port);
                    return Ok(());
                }
                Err(e) => {
                    warn!(port = %self.port_path, error = %e, attempt, "serial write failed");
                    last_err = Some(e);
                }
            }
        }
        Err(IotError::TransportFailed {
            detail: last_err.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    async fn bytes_available(&mut self) -> Result<usize> {
        let port = self.take_port().await?;
        let (outcome, port) = tokio::task::spawn_blocking(move || {
            let outcome = port.bytes_to_read().map(|n| n as usize);
            (outcome, port)
        })
        .await
        .expect("serial poll task panicked");
        self.port = Some(port);
        outcome.map_err(|e| IotError::TransportFailed { detail: e.to_string() })
    }
}

#[async_trait]
impl ByteChannel for SerialChannel {
    fn id(&self) -> ChannelId {
        ChannelId::Serial(self.port_path.clone())
    }

    async fn read(&mut self, n: usize) -> Result<Bytes> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let chunk = self.read_chunk(n - out.len()).await?;
            out.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(out))
    }

    async fn read_all(&mut self) -> Result<Bytes> {
        let available = self.bytes_available().await?;
        if available == 0 {
            return Ok(Bytes::new());
        }
        Ok(Bytes::from(self.read_chunk(available).await?))
    }

    async fn read_until(&mut self, pattern: &[u8], timeout: Duration) -> Result<Bytes> {
        let mut result = Vec::new();
        let start = Instant::now();
        loop {
            if tail_matches(&result, pattern) {
                return Ok(Bytes::from(result));
            }
            if start.elapsed() > timeout {
                return Err(IotError::Timeout { waited: timeout });
            }
            let byte = self.read_chunk(1).await?;
            result.extend_from_slice(&byte);
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(WRITE_CHUNK_SIZE) {
            self.write_chunk(chunk.to_vec()).await?;
            tokio::time::sleep(Duration::from_millis(WRITE_CHUNK_PACING_MS)).await;
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.port = None;
    }
}
