//! Registry population: local serial ports and remote UDP advertisements
//!
//! Mirrors `discover.py`/`discover_serial.py`/`discover_net.py`: two
//! independent scanners feed the same [`Registry`](crate::registry::Registry),
//! one walking local serial ports, the other listening for gateway
//! broadcasts. Both are cheap to run repeatedly - re-observing an already
//! known channel is a freshness bump, not a rebuild (`Registry::add`).

pub mod net_scanner;
pub mod serial_scanner;

pub use net_scanner::NetScanner;
pub use serial_scanner::SerialScanner;
