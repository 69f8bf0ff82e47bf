//! Test-only `ByteChannel` mocks shared across unit tests
//!
//! `ScriptedChannel` lets REPL/file-transfer/sync tests exercise exact wire
//! framing without real hardware: bytes queued into `inbound` are handed
//! back by `read`/`read_all`/`read_until`; everything written by the code
//! under test accumulates in `outbound` for assertions.

#![cfg(test)]

use crate::error::{IotError, Result};
use crate::transport::{tail_matches, ByteChannel, ChannelId};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A channel that never produces data and accepts writes silently.
#[derive(Default)]
pub struct NullChannel;

#[async_trait]
impl ByteChannel for NullChannel {
    fn id(&self) -> ChannelId {
        ChannelId::Serial("null".into())
    }
    async fn read(&mut self, n: usize) -> Result<Bytes> {
        Ok(Bytes::from(vec![0u8; n]))
    }
    async fn read_all(&mut self) -> Result<Bytes> {
        Ok(Bytes::new())
    }
    async fn read_until(&mut self, pattern: &[u8], _timeout: Duration) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(pattern))
    }
    async fn write(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }
    async fn close(&mut self) {}
}

/// A pre-programmed channel for unit-testing REPL/file-transfer framing.
pub struct ScriptedChannel {
    pub inbound: VecDeque<u8>,
    pub outbound: Vec<u8>,
}

impl ScriptedChannel {
    pub fn new(inbound: impl AsRef<[u8]>) -> Self {
        Self { inbound: inbound.as_ref().iter().copied().collect(), outbound: Vec::new() }
    }

    /// Queue more bytes to be read back, without disturbing what is
    /// already pending (for tests that script a multi-step exchange).
    pub fn push_inbound(&mut self, data: impl AsRef<[u8]>) {
        self.inbound.extend(data.as_ref());
    }
}

#[async_trait]
impl ByteChannel for ScriptedChannel {
    fn id(&self) -> ChannelId {
        ChannelId::Serial("scripted".into())
    }

    async fn read(&mut self, n: usize) -> Result<Bytes> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            match self.inbound.pop_front() {
                Some(b) => out.push(b),
                None => break,
            }
        }
        Ok(Bytes::from(out))
    }

    async fn read_all(&mut self) -> Result<Bytes> {
        let out: Vec<u8> = self.inbound.drain(..).collect();
        Ok(Bytes::from(out))
    }

    async fn read_until(&mut self, pattern: &[u8], timeout: Duration) -> Result<Bytes> {
        let mut result = Vec::new();
        let start = Instant::now();
        loop {
            if tail_matches(&result, pattern) {
                return Ok(Bytes::from(result));
            }
            match self.inbound.pop_front() {
                Some(b) => result.push(b),
                None => {
                    if start.elapsed() > timeout {
                        return Err(IotError::Timeout { waited: timeout });
                    }
                }
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.outbound.extend_from_slice(data);
        Ok(())
    }

    async fn close(&mut self) {}
}

/// Generate a throwaway self-signed certificate/key pair on disk, standing
/// in for the out-of-scope cert-material collaborator (spec §1/§6) so TLS
/// tests can exercise `tls::server_tls_config` and a real handshake
/// end-to-end. The returned `TempDir` must outlive the paths.
pub fn generate_self_signed_cert() -> (tempfile::TempDir, std::path::PathBuf, std::path::PathBuf) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("self-signed cert generation never fails for a bare SAN");
    let dir = tempfile::tempdir().expect("tempdir creation");
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, certified.cert.pem()).expect("writing cert.pem");
    std::fs::write(&key_path, certified.signing_key.serialize_pem()).expect("writing key.pem");
    (dir, cert_path, key_path)
}
