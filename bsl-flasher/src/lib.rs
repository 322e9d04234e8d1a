//! Host-side driver for the [MSP430]/[MSP432] bootstrap loader (BSL).
//!
//! Speaks both wire families: the checksum-framed protocol of the legacy
//! 1xx/2xx/4xx parts and the CRC-framed 5xx/6xx protocol over UART or
//! USB-HID. A [`session::run`] call drives the full invoke, authenticate,
//! transfer, verify sequence over any [`Transport`] and reports per-step
//! progress and results.
//!
//! [MSP430]: https://www.ti.com/microcontrollers-mcus-processors/msp430-microcontrollers/overview.html
//! [MSP432]: https://www.ti.com/product/MSP432P401R

mod error;
pub(crate) mod frame;
pub mod mcu;
pub mod session;
pub mod status;
pub mod transport;
#[cfg(feature = "uart")]
pub mod uart;
#[cfg(feature = "usb")]
pub mod usb;

pub use error::{BslCoreStatus, BslUartStatus, Error};
pub use mcu::{InvokeMechanism, Mcu, Protocol};
pub use session::{Command, Progress, SessionConfig, SessionOutcome, run};
pub use status::{BslVersion, Report, ReportResult, Status, StatusEx, StatusFrame};
pub use transport::{Device, ScanOptions, Transport};
