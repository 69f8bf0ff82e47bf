//! iot-device: a TLS-authenticated network bridge to serially-attached
//! microcontroller REPLs
//!
//! A [`Registry`](registry::Registry) of [`Device`](device::Device)s is
//! populated by [`discover`] scanners (serial port enumeration, UDP
//! advertisement listening) and kept fresh by [`advertise::Advertiser`],
//! which periodically broadcasts the live set over UDP. A
//! [`server::DeviceServer`] accepts TLS/TCP connections, authenticates them
//! against [`config::Config::password`], and pumps bytes between the
//! socket and the requested device's channel. Once a caller holds a
//! device's lock (`Device::acquire`), [`repl::Session`] and its
//! [`fcopy`]/[`sync`] extensions drive the raw-REPL wire protocol, file
//! transfer, and directory synchronization.

pub mod advertise;
pub mod config;
pub mod constants;
pub mod device;
pub mod discover;
pub mod error;
pub mod fcopy;
pub mod logging;
pub mod mcu_programs;
pub mod registry;
pub mod repl;
pub mod server;
pub mod sync;
pub mod tls;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use device::Device;
pub use error::{IotError, Result};
pub use registry::Registry;
