//! TLS/TCP transport to a remote `DeviceServer`
//!
//! Mirrors `net_device.py`: dial the gateway, wrap in TLS (any certificate
//! trusted - authentication is by shared password, not PKI), set
//! `TCP_NODELAY`, then perform the `{uid, password}` auth handshake
//! described in spec §6/§4.10. A transient I/O error on an established
//! connection triggers one transparent reconnect (re-handshake, re-auth)
//! before surfacing `TransportFailed`, the same reconnect-once contract
//! `SerialChannel` gives its port; a clean EOF (zero-length read) is a
//! reset, not a transient failure, and is reported as `ConnectionReset`
//! without retrying.

use super::{tail_matches, ByteChannel, ChannelId};
use crate::error::{IotError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// How long a single `read_all` poll waits before reporting "nothing yet".
const READ_ALL_POLL: Duration = Duration::from_millis(30);

#[derive(Serialize)]
struct AuthRequest<'a> {
    uid: &'a str,
    password: &'a str,
}

/// Trusts any server certificate presented during the TLS handshake.
///
/// The server's certificate is self-signed and regenerated per process;
/// there is no CA to validate against. Authentication is by shared
/// password in the post-handshake frame, not by PKI - this mirrors
/// `net_device.py`'s `context.verify_mode = ssl.CERT_NONE`.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<rustls::crypto::CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Build the client TLS config used to dial a `DeviceServer`: TLS 1.2+
/// only, any server certificate accepted.
pub fn client_tls_config() -> Arc<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = Arc::new(AcceptAnyServerCert(provider.clone()));
    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .expect("TLS12/TLS13 are supported by the ring provider")
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    config.enable_sni = false;
    Arc::new(config)
}

/// `ByteChannel` backed by a TLS/TCP connection to a `DeviceServer`.
pub struct NetChannel {
    addr: SocketAddr,
    uid: String,
    password: String,
    connector: TlsConnector,
    stream: Option<TlsStream<TcpStream>>,
}

impl NetChannel {
    /// Dial `addr`, complete the TLS handshake, and perform the
    /// `{uid, password}` auth exchange. Returns `AuthFailed` if the
    /// gateway replies with anything other than `b"ok"`.
    pub async fn connect(addr: SocketAddr, uid: &str, password: &str) -> Result<Self> {
        let connector = TlsConnector::from(client_tls_config());
        let mut channel = Self {
            addr,
            uid: uid.to_string(),
            password: password.to_string(),
            connector,
            stream: None,
        };
        channel.reconnect().await?;
        Ok(channel)
    }

    async fn reconnect(&mut self) -> Result<()> {
        debug!(addr = %self.addr, "connecting net channel");
        let tcp = TcpStream::connect(self.addr)
            .await
            .map_err(|e| IotError::TransportFailed { detail: e.to_string() })?;
        tcp.set_nodelay(true)
            .map_err(|e| IotError::TransportFailed { detail: e.to_string() })?;
        let server_name = ServerName::IpAddress(self.addr.ip().into());
        let mut stream = self
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| IotError::TransportFailed { detail: e.to_string() })?;

        let req = AuthRequest { uid: &self.uid, password: &self.password };
        let payload = serde_json::to_vec(&req).expect("AuthRequest always serializes");
        stream
            .write_all(&payload)
            .await
            .map_err(|e| IotError::TransportFailed { detail: e.to_string() })?;

        let mut buf = vec![0u8; 1024];
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| IotError::TransportFailed { detail: e.to_string() })?;
        if n == 0 {
            return Err(IotError::ConnectionReset);
        }
        buf.truncate(n);
        if buf != b"ok" {
            return Err(IotError::AuthFailed {
                reason: String::from_utf8_lossy(&buf).into_owned(),
            });
        }
        self.stream = Some(stream);
        Ok(())
    }

    fn stream_mut(&mut self) -> Result<&mut TlsStream<TcpStream>> {
        self.stream.as_mut().ok_or(IotError::ConnectionReset)
    }
}

#[async_trait]
impl ByteChannel for NetChannel {
    fn id(&self) -> ChannelId {
        ChannelId::Net(self.addr, self.uid.clone())
    }

    async fn read(&mut self, n: usize) -> Result<Bytes> {
        let mut last_err = None;
        for attempt in 0..2 {
            if attempt == 1 {
                self.reconnect().await?;
            }
            let mut buf = vec![0u8; n];
            let stream = self.stream_mut()?;
            match stream.read_exact(&mut buf).await {
                Ok(()) => return Ok(Bytes::from(buf)),
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    return Err(IotError::ConnectionReset)
                }
                Err(e) => {
                    warn!(addr = %self.addr, error = %e, attempt, "net read failed");
                    last_err = Some(e);
                }
            }
        }
        Err(IotError::TransportFailed {
            detail: last_err.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    async fn read_all(&mut self) -> Result<Bytes> {
        let mut last_err = None;
        for attempt in 0..2 {
            if attempt == 1 {
                self.reconnect().await?;
            }
            let stream = self.stream_mut()?;
            let mut buf = vec![0u8; 4096];
            match tokio::time::timeout(READ_ALL_POLL, stream.read(&mut buf)).await {
                Ok(Ok(0)) => return Err(IotError::ConnectionReset),
                Ok(Ok(n)) => {
                    buf.truncate(n);
                    return Ok(Bytes::from(buf));
                }
                Ok(Err(e)) => {
                    warn!(addr = %self.addr, error = %e, attempt, "net read_all failed");
                    last_err = Some(e);
                }
                Err(_elapsed) => return Ok(Bytes::new()),
            }
        }
        Err(IotError::TransportFailed {
            detail: last_err.map(|e| e.to_string()).unwrap_or_default(),
        })
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
            let byte = self.read(1).await?;
            result.extend_from_slice(&byte);
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut last_err = None;
        for attempt in 0..2 {
            if attempt == 1 {
                self.reconnect().await?;
            }
            let stream = self.stream_mut()?;
            match stream.write_all(data).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(addr = %self.addr, error = %e, attempt, "net write failed");
                    last_err = Some(e);
                }
            }
        }
        Err(IotError::TransportFailed {
            detail: last_err.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }
}
