//! Periodic UDP broadcast advertising locally-attached live devices
//!
//! Mirrors `discover.py`'s advertiser loop (driven from `iot_server.py`):
//! every `device_scan_interval` seconds, rescan local serial ports, then
//! broadcast one `{uid, ip_addr, ip_port, protocol, last_seen}` datagram
//! (spec §6) per device younger than `max_age`. A send/bind failure rebuilds
//! the socket after a backoff rather than ending the loop (spec §4.9/§7).

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::constants::{ADVERTISE_SOCKET_BACKOFF_SECS, DEFAULT_MAX_AGE_SECS};
use crate::discover::SerialScanner;
use crate::error::{IotError, Result};
use crate::registry::Registry;

/// Wire shape of a device advertisement (spec §6).
#[derive(Debug, Serialize)]
struct Advertisement {
    uid: String,
    ip_addr: String,
    ip_port: u16,
    protocol: &'static str,
    last_seen: f64,
}

/// Broadcasts the Registry's live local devices over UDP on a timer.
pub struct Advertiser {
    registry: Arc<Registry>,
    serial_scanner: SerialScanner,
    local_ip: IpAddr,
    advertise_port: u16,
    connection_server_port: u16,
    scan_interval: Duration,
    max_age: Duration,
}

impl Advertiser {
    pub fn new(
        registry: Arc<Registry>,
        serial_scanner: SerialScanner,
        local_ip: IpAddr,
        advertise_port: u16,
        connection_server_port: u16,
        scan_interval: Duration,
    ) -> Self {
        Self {
            registry,
            serial_scanner,
            local_ip,
            advertise_port,
            connection_server_port,
            scan_interval,
            max_age: Duration::from_secs_f64(DEFAULT_MAX_AGE_SECS),
        }
    }

    /// Run forever. On each tick: rescan serial ports, then broadcast every
    /// device not older than `max_age`. Never returns - the loop is the
    /// advertiser's entire lifetime, spawned as an independent task by
    /// `iot_server`.
    pub async fn run(mut self) -> ! {
        let mut socket = self.bind_broadcast_socket().await;
        loop {
            self.serial_scanner.scan(&self.registry).await;

            match &socket {
                Some(sock) => {
                    if let Err(e) = self.broadcast_tick(sock).await {
                        warn!(error = %e, "advertisement broadcast failed, rebuilding socket");
                        socket = None;
                    }
                }
                None => {
                    tokio::time::sleep(Duration::from_secs(ADVERTISE_SOCKET_BACKOFF_SECS)).await;
                    socket = self.bind_broadcast_socket().await;
                }
            }

            tokio::time::sleep(self.scan_interval).await;
        }
    }

    async fn broadcast_tick(&mut self, socket: &UdpSocket) -> Result<()> {
        let dest: SocketAddr = ([255, 255, 255, 255], self.advertise_port).into();
        for device in self.registry.snapshot() {
            if device.age() > self.max_age {
                continue;
            }
            let ad = Advertisement {
                uid: device.uid().to_string(),
                ip_addr: self.local_ip.to_string(),
                ip_port: self.connection_server_port,
                protocol: "repl",
                last_seen: unix_timestamp_now(),
            };
            let payload = serde_json::to_vec(&ad).expect("Advertisement always serializes");
            socket
                .send_to(&payload, dest)
                .await
                .map_err(|e| IotError::UdpBind { port: self.advertise_port, source: e })?;
            debug!(uid = %ad.uid, "advertised device");
        }
        Ok(())
    }

    async fn bind_broadcast_socket(&self) -> Option<UdpSocket> {
        match self.try_bind_broadcast_socket() {
            Ok(socket) => Some(socket),
            Err(e) => {
                warn!(port = self.advertise_port, error = %e, "failed to bind advertiser socket");
                None
            }
        }
    }

    fn try_bind_broadcast_socket(&self) -> Result<UdpSocket> {
        let map_err = |e| IotError::UdpBind { port: self.advertise_port, source: e };
        let socket =
            Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(map_err)?;
        socket.set_reuse_address(true).map_err(map_err)?;
        socket.set_broadcast(true).map_err(map_err)?;
        let bind_addr: SocketAddr = ([0, 0, 0, 0], 0).into();
        socket.bind(&bind_addr.into()).map_err(map_err)?;
        socket.set_nonblocking(true).map_err(map_err)?;
        UdpSocket::from_std(socket.into()).map_err(map_err)
    }
}

/// Best-effort local IPv4 address: connects a UDP socket to a public
/// address (no packet actually sent) and reads back the OS-chosen source
/// address - the common portable trick for "what's my outbound IP",
/// avoiding a dependency on platform interface-enumeration APIs.
pub fn detect_local_ip() -> IpAddr {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST))
}

fn unix_timestamp_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_local_ip_never_panics() {
        let _ = detect_local_ip();
    }

    #[test]
    fn advertisement_serializes_expected_shape() {
        let ad = Advertisement {
            uid: "aa:bb".into(),
            ip_addr: "192.168.1.5".into(),
            ip_port: 50001,
            protocol: "repl",
            last_seen: 1.0,
        };
        let json = serde_json::to_string(&ad).unwrap();
        assert!(json.contains("\"protocol\":\"repl\""));
        assert!(json.contains("\"ip_port\":50001"));
    }

    #[tokio::test]
    async fn bind_broadcast_socket_succeeds() {
        let advertiser = Advertiser::new(
            Arc::new(Registry::new()),
            SerialScanner::default(),
            IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            0,
            50001,
            Duration::from_secs(1),
        );
        assert!(advertiser.bind_broadcast_socket().await.is_some());
    }
}
