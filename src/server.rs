//! TLS/TCP connection server
//!
//! Mirrors `connection_server.py`'s multiplex accept loop (spec §4.9): each
//! accepted socket runs the state machine `ACCEPT -> TLS_HANDSHAKE ->
//! AUTH_WAIT -> {REJECT | LOCK_DEVICE -> PUMP} -> CLOSED` on its own tokio
//! task. That gives the "N clients can talk to N different devices in
//! parallel" property from spec §5 without hand-rolling an epoll loop - the
//! tokio scheduler is the readiness multiplexer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::constants::PUMP_READ_CHUNK;
use crate::error::{IotError, Result};
use crate::registry::Registry;
use crate::transport::ByteChannel;

/// Maximum size of the `{uid, password}` auth frame (spec §6: "≤1024 bytes").
const MAX_AUTH_FRAME_BYTES: usize = 1024;

/// How often the PUMP loop polls the device channel for pending bytes,
/// since `ByteChannel` exposes no readiness signal to `select!` on
/// directly (spec §9 "abstract transport polymorphism").
const PUMP_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Deserialize)]
struct AuthFrame {
    uid: String,
    password: String,
}

/// TLS-authenticated gateway: accepts client connections, authenticates
/// them against the configured password, locks the requested device, and
/// pumps bytes between the socket and the device's channel.
pub struct DeviceServer {
    registry: Arc<Registry>,
    password: String,
    acceptor: TlsAcceptor,
}

impl DeviceServer {
    pub fn new(registry: Arc<Registry>, password: String, tls_config: Arc<rustls::ServerConfig>) -> Self {
        Self { registry, password, acceptor: TlsAcceptor::from(tls_config) }
    }

    /// Bind `port` and accept connections until the process exits. A
    /// connection-level error never brings down the listener (spec §7:
    /// "Per-connection errors... drop that connection... continue
    /// accepting").
    pub async fn run(self: Arc<Self>, port: u16) -> Result<()> {
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let listener =
            TcpListener::bind(addr).await.map_err(|e| IotError::ServerBind { port, source: e })?;
        info!(port, "device server listening");

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            if let Err(e) = apply_socket_options(&stream) {
                warn!(%peer, error = %e, "failed to apply keepalive/nodelay");
            }
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, peer).await {
                    debug!(%peer, error = %e, "connection ended");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let mut tls = self.acceptor.accept(stream).await.map_err(|e| IotError::TransportFailed {
            detail: format!("TLS handshake with {peer} failed: {e}"),
        })?;

        let frame = read_auth_frame(&mut tls).await?;

        if frame.password != self.password {
            let _ = tls.write_all(b"wrong password").await;
            return Err(IotError::AuthFailed { reason: "wrong password".into() });
        }

        let device = match self.registry.get_by_uid(&frame.uid) {
            Some(device) => device,
            None => {
                let _ = tls.write_all(b"no such device").await;
                return Err(IotError::DeviceUnknown { uid: frame.uid });
            }
        };

        let mut session = match device.try_acquire() {
            Ok(session) => session,
            Err(_) => {
                let _ = tls.write_all(b"device busy").await;
                return Err(IotError::DeviceBusy { uid: frame.uid });
            }
        };

        tls.write_all(b"ok").await.map_err(|e| IotError::TransportFailed { detail: e.to_string() })?;
        info!(%peer, uid = %frame.uid, "session locked");
        pump(tls, session.channel()).await;
        info!(%peer, uid = %frame.uid, "session closed");
        Ok(())
    }
}

/// Read one JSON frame off `stream`, growing the buffer until it parses or
/// exceeds [`MAX_AUTH_FRAME_BYTES`]. The client writes `{"uid","password"}`
/// in a single `write`, but TLS record boundaries don't guarantee it
/// arrives in one `read`, so this accumulates and retries the parse.
async fn read_auth_frame(stream: &mut TlsStream<TcpStream>) -> Result<AuthFrame> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| IotError::TransportFailed { detail: e.to_string() })?;
        if n == 0 {
            return Err(IotError::ConnectionReset);
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_AUTH_FRAME_BYTES {
            return Err(IotError::ReplProtocolError {
                detail: "auth frame exceeds 1024 bytes".into(),
            });
        }
        match serde_json::from_slice::<AuthFrame>(&buf) {
            Ok(frame) => return Ok(frame),
            Err(e) if e.is_eof() => continue,
            Err(e) => {
                return Err(IotError::ReplProtocolError {
                    detail: format!("malformed auth frame: {e}"),
                })
            }
        }
    }
}

/// Shuttle bytes between `stream` and `channel` until either side closes or
/// fails. Releases nothing itself - dropping `session` (the caller's
/// `DeviceSession`) on return is what unlocks the device.
async fn pump(mut stream: TlsStream<TcpStream>, channel: &mut dyn ByteChannel) {
    let mut buf = vec![0u8; PUMP_READ_CHUNK];
    let mut poll = tokio::time::interval(PUMP_POLL_INTERVAL);
    loop {
        tokio::select! {
            biased;
            result = stream.read(&mut buf) => {
                match result {
                    Ok(0) => break,
                    Ok(n) => {
                        if channel.write(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            _ = poll.tick() => {
                match channel.read_all().await {
                    Ok(data) if !data.is_empty() => {
                        if stream.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }
    }
    let _ = stream.shutdown().await;
    channel.close().await;
}

/// `TCP_NODELAY` plus keep-alive (idle 1s, interval 1s, 3 probes - spec
/// §4.9) on a freshly accepted socket.
fn apply_socket_options(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let sock_ref = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(1))
        .with_interval(Duration::from_secs(1));
    #[cfg(not(target_os = "windows"))]
    let keepalive = keepalive.with_retries(3);
    sock_ref.set_tcp_keepalive(&keepalive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::test_support::{generate_self_signed_cert, NullChannel};
    use crate::tls::server_tls_config;
    use std::net::Ipv4Addr;
    use std::sync::Arc as StdArc;
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::TlsConnector;

    fn test_registry_with_device(uid: &str) -> StdArc<Registry> {
        let registry = StdArc::new(Registry::new());
        registry.add(StdArc::new(Device::new(
            uid.to_string(),
            "test".into(),
            Box::new(NullChannel::default()),
        )));
        registry
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let (_dir, cert_path, key_path) = generate_self_signed_cert();
        let tls_config = server_tls_config(&cert_path, &key_path).unwrap();
        let registry = test_registry_with_device("aa:bb");
        let server = StdArc::new(DeviceServer::new(registry, "correct".into(), tls_config));

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn({
            let server = server.clone();
            async move {
                let (stream, peer) = listener.accept().await.unwrap();
                let _ = server.handle_connection(stream, peer).await;
            }
        });

        let reply = connect_and_auth(addr, "aa:bb", "wrong").await;
        assert_eq!(reply, b"wrong password");
    }

    #[tokio::test]
    async fn unknown_uid_is_rejected() {
        let (_dir, cert_path, key_path) = generate_self_signed_cert();
        let tls_config = server_tls_config(&cert_path, &key_path).unwrap();
        let registry = StdArc::new(Registry::new());
        let server = StdArc::new(DeviceServer::new(registry, "correct".into(), tls_config));

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn({
            let server = server.clone();
            async move {
                let (stream, peer) = listener.accept().await.unwrap();
                let _ = server.handle_connection(stream, peer).await;
            }
        });

        let reply = connect_and_auth(addr, "zz:zz", "correct").await;
        assert_eq!(reply, b"no such device");
    }

    #[tokio::test]
    async fn busy_device_is_rejected() {
        let (_dir, cert_path, key_path) = generate_self_signed_cert();
        let tls_config = server_tls_config(&cert_path, &key_path).unwrap();
        let registry = test_registry_with_device("aa:bb");
        let device = registry.get_by_uid("aa:bb").unwrap();
        let _held = device.acquire().await;
        let server = StdArc::new(DeviceServer::new(registry, "correct".into(), tls_config));

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn({
            let server = server.clone();
            async move {
                let (stream, peer) = listener.accept().await.unwrap();
                let _ = server.handle_connection(stream, peer).await;
            }
        });

        let reply = connect_and_auth(addr, "aa:bb", "correct").await;
        assert_eq!(reply, b"device busy");
    }

    #[tokio::test]
    async fn successful_auth_replies_ok() {
        let (_dir, cert_path, key_path) = generate_self_signed_cert();
        let tls_config = server_tls_config(&cert_path, &key_path).unwrap();
        let registry = test_registry_with_device("aa:bb");
        let server = StdArc::new(DeviceServer::new(registry, "correct".into(), tls_config));

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn({
            let server = server.clone();
            async move {
                let (stream, peer) = listener.accept().await.unwrap();
                let _ = server.handle_connection(stream, peer).await;
            }
        });

        let reply = connect_and_auth(addr, "aa:bb", "correct").await;
        assert_eq!(reply, b"ok");
    }

    /// Dial `addr` over TLS (trusting any cert, same as `NetChannel`),
    /// send the auth frame, and return whatever the server replies first.
    async fn connect_and_auth(addr: SocketAddr, uid: &str, password: &str) -> Vec<u8> {
        let connector = TlsConnector::from(crate::transport::net::client_tls_config());
        let tcp = TcpStream::connect(addr).await.unwrap();
        let mut stream = connector.connect(ServerName::IpAddress(addr.ip().into()), tcp).await.unwrap();
        let payload = serde_json::to_vec(&serde_json::json!({"uid": uid, "password": password})).unwrap();
        stream.write_all(&payload).await.unwrap();
        let mut buf = vec![0u8; 256];
        let n = stream.read(&mut buf).await.unwrap();
        buf.truncate(n);
        buf
    }
}
