//! Transport contract the session drives. Implementations own one opened
//! device handle for the session's lifetime; `close` must be idempotent
//! and swallow its own errors so failure cleanup cannot cascade.

use std::fmt;
use std::time::Duration;

use crate::Error;

/// Default deadline for one command/response exchange.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(4);
/// Default deadline for device enumeration.
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(2);

/// One discovered device, addressable by its opaque `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Opaque key accepted by the matching transport's `open`.
    pub name: String,
    pub description: String,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.description.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{} ({})", self.name, self.description)
        }
    }
}

/// Options for transport device scans.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions {
    /// Enumerate every HID device instead of only the TI BSL VID/PID.
    pub ignore_vendor_filter: bool,
}

/// Byte-level device access. DTR/RTS are no-ops for USB-HID transports.
pub trait Transport {
    fn set_baud(&mut self, rate: u32) -> Result<(), Error>;
    fn set_dtr(&mut self, level: bool) -> Result<(), Error>;
    fn set_rts(&mut self, level: bool) -> Result<(), Error>;

    /// Discard pending inbound and outbound bytes.
    fn clear_buffers(&mut self) -> Result<(), Error>;

    /// Write `tx` (may be empty for a pure read), then block until exactly
    /// `expected_rx_len` bytes arrive or the deadline passes. Zero bytes at
    /// the deadline is [`Error::Timeout`]; a partial read is
    /// [`Error::ShortRead`].
    fn transfer(&mut self, tx: &[u8], expected_rx_len: usize) -> Result<Vec<u8>, Error>;

    /// Release the device. Idempotent; never fails.
    fn close(&mut self);
}
