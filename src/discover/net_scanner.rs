//! UDP advertisement discovery
//!
//! Mirrors `discover_net.py`: bind a UDP socket to the advertise port on
//! `0.0.0.0`, listen for a few seconds, decode each datagram as an
//! advertisement, and add a `NetChannel`-backed `Device` for every uid not
//! already in the registry. Malformed datagrams and a timed-out listen are
//! both non-fatal - a scan tick simply finds nothing new.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::constants::{NET_SCAN_WINDOW_SECS, UDP_BUFFER_SIZE};
use crate::device::Device;
use crate::error::{IotError, Result};
use crate::registry::Registry;
use crate::transport::NetChannel;

/// Wire shape of a device advertisement (spec §6): `{uid, ip_addr, ip_port,
/// protocol, last_seen}`.
#[derive(Debug, Deserialize)]
struct Advertisement {
    uid: String,
    ip_addr: String,
    ip_port: u16,
    protocol: String,
    #[allow(dead_code)]
    last_seen: f64,
}

/// Listens for UDP advertisements and installs new `NetDevice`s.
pub struct NetScanner {
    advertise_port: u16,
    password: String,
}

impl NetScanner {
    pub fn new(advertise_port: u16, password: String) -> Self {
        Self { advertise_port, password }
    }

    /// Listen for up to [`NET_SCAN_WINDOW_SECS`] and register every new
    /// device advertised in that window. Connecting to a newly-heard
    /// gateway happens inline so the uid is confirmed (and the auth
    /// handshake validated) before the device is added.
    pub async fn scan(&self, registry: &Registry) {
        let socket = match self.bind().await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(port = self.advertise_port, error = %e, "failed to bind advertisement listener");
                return;
            }
        };

        let deadline = tokio::time::Instant::now() + Duration::from_secs(NET_SCAN_WINDOW_SECS);
        let mut buf = vec![0u8; UDP_BUFFER_SIZE];
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let recv = tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await;
            let (n, _from) = match recv {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    warn!(error = %e, "advertisement listener recv failed");
                    continue;
                }
                Err(_elapsed) => break,
            };
            if let Err(e) = self.handle_datagram(&buf[..n], registry).await {
                debug!(error = %e, "ignoring malformed advertisement");
            }
        }
    }

    async fn bind(&self) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| IotError::UdpBind { port: self.advertise_port, source: e })?;
        socket
            .set_reuse_address(true)
            .map_err(|e| IotError::UdpBind { port: self.advertise_port, source: e })?;
        let addr: SocketAddr = ([0, 0, 0, 0], self.advertise_port).into();
        socket
            .bind(&addr.into())
            .map_err(|e| IotError::UdpBind { port: self.advertise_port, source: e })?;
        socket
            .set_nonblocking(true)
            .map_err(|e| IotError::UdpBind { port: self.advertise_port, source: e })?;
        UdpSocket::from_std(socket.into())
            .map_err(|e| IotError::UdpBind { port: self.advertise_port, source: e })
    }

    async fn handle_datagram(&self, datagram: &[u8], registry: &Registry) -> Result<()> {
        let ad: Advertisement =
            serde_json::from_slice(datagram).map_err(|e| IotError::ReplProtocolError {
                detail: format!("malformed advertisement: {e}"),
            })?;
        if ad.protocol != "repl" {
            return Err(IotError::ReplProtocolError {
                detail: format!("unexpected advertisement protocol: {}", ad.protocol),
            });
        }
        if registry.get_by_uid(&ad.uid).is_some() {
            return Ok(());
        }
        let addr: SocketAddr = format!("{}:{}", ad.ip_addr, ad.ip_port)
            .parse()
            .map_err(|_| IotError::ReplProtocolError {
                detail: format!("bad advertisement address: {}:{}", ad.ip_addr, ad.ip_port),
            })?;
        let channel = NetChannel::connect(addr, &ad.uid, &self.password).await?;
        let description = format!("{} via {}", ad.uid, addr);
        let device = Arc::new(Device::new(ad.uid.clone(), description, Box::new(channel)));
        debug!(uid = %ad.uid, %addr, "discovered net device");
        registry.add(device);
        Ok(())
    }
}
