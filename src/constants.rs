//! Crate-wide constants
//!
//! Centralized constants to avoid duplication and ensure consistency.

// =============================================================================
// Network
// =============================================================================

/// Default UDP port for device advertisements
pub const DEFAULT_ADVERTISE_PORT: u16 = 50003;

/// Default TCP port for the TLS connection server
pub const DEFAULT_CONNECTION_SERVER_PORT: u16 = 50001;

/// Default interval between registry scans / advertisement ticks (seconds)
pub const DEFAULT_DEVICE_SCAN_INTERVAL_SECS: f64 = 1.0;

/// How long a device may go unseen before advertisements stop mentioning it (seconds)
pub const DEFAULT_MAX_AGE_SECS: f64 = 5.0;

/// How long `NetScanner::scan` listens for advertisements per call (seconds)
pub const NET_SCAN_WINDOW_SECS: u64 = 4;

// =============================================================================
// Timing - Reconnection / backoff
// =============================================================================

/// Delay before rebuilding the advertiser's UDP socket after a transient error
pub const ADVERTISE_SOCKET_BACKOFF_SECS: u64 = 5;

// =============================================================================
// REPL wire protocol
// =============================================================================

/// Enter raw REPL mode
pub const MCU_RAW_REPL: u8 = 0x01;
/// Abort current line / running program
pub const MCU_ABORT: u8 = 0x03;
/// End-of-transmission: also used to request a soft reset
pub const MCU_EOT: u8 = 0x04;

/// Banner printed by the device after entering raw REPL
pub const RAW_REPL_BANNER: &[u8] = b"raw REPL; CTRL-B to exit\r\n>";

/// Maximum payload per file-transfer block (USB-CDC stacks drop 256+ byte transfers)
pub const BUFFER_SIZE: usize = 254;

/// Default timeout for `read_until` (seconds)
pub const DEFAULT_READ_UNTIL_TIMEOUT_SECS: u64 = 5;

/// Default clock-skew tolerance before `sync_time` adjusts the device RTC (seconds)
pub const DEFAULT_CLOCK_SYNC_TOLERANCE_SECS: i64 = 10;

/// Clock-skew tolerance used by `rsync` before applying a non-dry-run plan (seconds)
pub const RSYNC_CLOCK_SYNC_TOLERANCE_SECS: i64 = 3;

// =============================================================================
// Serial
// =============================================================================

/// Default baud rate for serial-attached devices
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Serial port read timeout
pub const SERIAL_READ_TIMEOUT_MS: u64 = 500;

/// Maximum bytes written to a channel per chunk (small embedded USB-CDC stacks)
pub const WRITE_CHUNK_SIZE: usize = 256;

/// Pacing delay between write chunks (milliseconds)
pub const WRITE_CHUNK_PACING_MS: u64 = 10;

// Known USB vendor IDs for compatible microcontrollers
pub const VID_ADAFRUIT: u16 = 0x239A;
pub const VID_PARTICLE: u16 = 0x2B04;
pub const VID_CP210X: u16 = 0x10C4;
pub const VID_STM32: u16 = 0xF055;

pub const COMPATIBLE_VIDS: &[u16] = &[VID_ADAFRUIT, VID_PARTICLE, VID_CP210X, VID_STM32];

// =============================================================================
// Buffers / channels
// =============================================================================

/// Read-all / PUMP loop poll buffer size
pub const PUMP_READ_CHUNK: usize = 256;

/// UDP receive buffer size for advertisements
pub const UDP_BUFFER_SIZE: usize = 4096;
