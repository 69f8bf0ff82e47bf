//! USB serial port discovery
//!
//! Mirrors `discover_serial.py`: enumerate local serial ports, keep the
//! ones whose USB vendor ID matches a known MicroPython/CircuitPython
//! board, and skip anything already tracked in the registry. A newly found
//! port has no UID yet - it is wrapped in a throwaway `Device` just long
//! enough to run a one-shot `uid()` REPL eval, then the channel is
//! reclaimed to build the real, correctly-keyed `Device`.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::constants::{COMPATIBLE_VIDS, DEFAULT_BAUD_RATE};
use crate::device::Device;
use crate::registry::Registry;
use crate::repl::Session;
use crate::transport::{ChannelId, SerialChannel};

/// Placeholder uid assigned to a serial port while its real uid is being
/// read for the first time. Never inserted into the registry.
const PENDING_UID: &str = "pending";

/// Scans local serial ports for compatible microcontrollers and registers
/// any new ones found.
pub struct SerialScanner {
    baud_rate: u32,
}

impl Default for SerialScanner {
    fn default() -> Self {
        Self { baud_rate: DEFAULT_BAUD_RATE }
    }
}

impl SerialScanner {
    pub fn new(baud_rate: u32) -> Self {
        Self { baud_rate }
    }

    /// Enumerate ports, skip everything already in `registry`, probe the
    /// rest for a uid, and add the devices that answer. Never fails: a
    /// single port failing to open or answer is logged and skipped so one
    /// flaky board doesn't block discovery of the others.
    pub async fn scan(&self, registry: &Registry) {
        let ports = match tokio::task::spawn_blocking(serialport::available_ports)
            .await
            .expect("available_ports task panicked")
        {
            Ok(ports) => ports,
            Err(e) => {
                warn!(error = %e, "failed to enumerate serial ports");
                return;
            }
        };

        for port in ports {
            let vid = match &port.port_type {
                serialport::SerialPortType::UsbPort(usb) => usb.vid,
                _ => continue,
            };
            if !COMPATIBLE_VIDS.contains(&vid) {
                continue;
            }
            let channel_id = ChannelId::Serial(port.port_name.clone());
            if registry.get_by_channel(&channel_id).is_some() {
                continue;
            }
            if let Err(e) = self.probe_and_add(&port, registry).await {
                warn!(port = %port.port_name, error = %e, "skipping serial port");
            }
        }
    }

    async fn probe_and_add(
        &self,
        port: &serialport::SerialPortInfo,
        registry: &Registry,
    ) -> crate::error::Result<()> {
        let description = usb_description(port);
        let channel = SerialChannel::open(&port.port_name, self.baud_rate)?;
        let placeholder = Arc::new(Device::new(
            PENDING_UID.to_string(),
            description.clone(),
            Box::new(channel),
        ));

        let uid = {
            let mut dsession = placeholder.acquire().await;
            let mut session = Session::new(&mut dsession);
            session.read_uid().await?
        };

        let channel = placeholder
            .into_channel()
            .expect("no other reference to the placeholder device can exist here");
        let device = Arc::new(Device::new(uid.clone(), description, channel));
        debug!(uid = %uid, port = %port.port_name, "discovered serial device");
        registry.add(device);
        Ok(())
    }
}

fn usb_description(port: &serialport::SerialPortInfo) -> String {
    match &port.port_type {
        serialport::SerialPortType::UsbPort(usb) => {
            match (&usb.product, &usb.manufacturer) {
                (Some(product), Some(manufacturer)) => format!("{product} by {manufacturer}"),
                (Some(product), None) => product.clone(),
                _ => port.port_name.clone(),
            }
        }
        _ => port.port_name.clone(),
    }
}
