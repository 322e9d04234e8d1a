//! Error taxonomy for the protocol engine plus the device-reported BSL
//! status enums. Validation errors fire before any device I/O;
//! communication errors are never retried except the documented
//! baud-negotiation tolerance in the session driver.

use std::fmt;

use crate::mcu::Protocol;

/// One-byte status the modern 5xx/6xx BSL core embeds in message replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BslCoreStatus {
    Success,
    FlashWriteCheckFailed,
    FlashFailBitSet,
    VoltageChanged,
    BslLocked,
    PasswordError,
    ByteWriteForbidden,
    UnknownCommand,
    PacketTooLarge,
    Unknown(u8),
}

impl BslCoreStatus {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => Self::Success,
            0x01 => Self::FlashWriteCheckFailed,
            0x02 => Self::FlashFailBitSet,
            0x03 => Self::VoltageChanged,
            0x04 => Self::BslLocked,
            0x05 => Self::PasswordError,
            0x06 => Self::ByteWriteForbidden,
            0x07 => Self::UnknownCommand,
            0x08 => Self::PacketTooLarge,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for BslCoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::FlashWriteCheckFailed => write!(f, "flash write check failed"),
            Self::FlashFailBitSet => write!(f, "flash fail bit set"),
            Self::VoltageChanged => write!(f, "voltage changed during program execution"),
            Self::BslLocked => write!(f, "BSL is locked"),
            Self::PasswordError => {
                write!(
                    f,
                    "password error (a wrong password also triggers an automatic mass erase)"
                )
            }
            Self::ByteWriteForbidden => write!(f, "byte write forbidden"),
            Self::UnknownCommand => write!(f, "unknown command"),
            Self::PacketTooLarge => write!(f, "packet length exceeds buffer size"),
            Self::Unknown(byte) => write!(f, "unknown core status {byte:#04X}"),
        }
    }
}

/// One-byte status of the modern UART wrapper, sent before the core reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BslUartStatus {
    Ack,
    HeaderIncorrect,
    ChecksumIncorrect,
    PacketSizeZero,
    PacketSizeExceedsBuffer,
    UnknownError,
    UnknownBaudRate,
    Unknown(u8),
}

impl BslUartStatus {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => Self::Ack,
            0x51 => Self::HeaderIncorrect,
            0x52 => Self::ChecksumIncorrect,
            0x53 => Self::PacketSizeZero,
            0x54 => Self::PacketSizeExceedsBuffer,
            0x55 => Self::UnknownError,
            0x56 => Self::UnknownBaudRate,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for BslUartStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ack => write!(f, "ack"),
            Self::HeaderIncorrect => write!(f, "header incorrect"),
            Self::ChecksumIncorrect => write!(f, "checksum incorrect"),
            Self::PacketSizeZero => write!(f, "packet size is zero"),
            Self::PacketSizeExceedsBuffer => write!(f, "packet size exceeds buffer"),
            Self::UnknownError => write!(f, "unknown error"),
            Self::UnknownBaudRate => write!(f, "unknown baud rate"),
            Self::Unknown(byte) => write!(f, "unknown UART status {byte:#04X}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid firmware")]
    Firmware(#[from] bsl_firmware::Error),
    #[error("password must be {expected} bytes, got {found}")]
    PasswordLength { expected: usize, found: usize },
    #[error("{command} is not available over the {protocol} protocol")]
    UnsupportedCommand {
        command: &'static str,
        protocol: Protocol,
    },
    #[error("no device matches `{name}`")]
    NoSuchDevice { name: String },
    #[error("transport failure while {action}")]
    Transport {
        action: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("timed out waiting for a response")]
    Timeout,
    #[error("short response: expected {expected} bytes, received {received}")]
    ShortRead { expected: usize, received: usize },
    #[error("malformed response: {reason}")]
    MalformedResponse { reason: String },
    #[error("target rejected the frame with NAK")]
    Nak,
    #[error("BSL UART error: {0}")]
    Uart(BslUartStatus),
    #[error("BSL core error: {0}")]
    Core(BslCoreStatus),
    #[error("flash CRC mismatch: device reports {device:#06X}, host computed {host:#06X}")]
    CrcMismatch { device: u16, host: u16 },
    #[error("transfer failed at block {block}")]
    BlockTransfer {
        /// 1-based index of the failing block.
        block: usize,
        #[source]
        source: Box<Error>,
    },
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Stable numeric code carried into [`crate::status::Status`].
    pub fn code(&self) -> i32 {
        match self {
            Self::Firmware(_) => 100,
            Self::PasswordLength { .. } => 110,
            Self::UnsupportedCommand { .. } => 120,
            Self::NoSuchDevice { .. } => 200,
            Self::Transport { .. } => 210,
            Self::Timeout => 300,
            Self::ShortRead { .. } => 310,
            Self::MalformedResponse { .. } => 320,
            Self::Nak => 330,
            Self::Uart(_) => 340,
            Self::Core(_) => 350,
            Self::CrcMismatch { .. } => 400,
            Self::BlockTransfer { .. } => 410,
            Self::Cancelled => 500,
        }
    }

    /// Device-reported core status, if this error (or its root) carries one.
    pub fn core_status(&self) -> Option<BslCoreStatus> {
        match self {
            Self::Core(status) => Some(*status),
            Self::BlockTransfer { source, .. } => source.core_status(),
            _ => None,
        }
    }

    /// Device-reported UART status, if this error (or its root) carries one.
    pub fn uart_status(&self) -> Option<BslUartStatus> {
        match self {
            Self::Uart(status) => Some(*status),
            Self::BlockTransfer { source, .. } => source.uart_status(),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_status_round_trips_known_bytes() {
        assert_eq!(BslCoreStatus::from_byte(0x00), BslCoreStatus::Success);
        assert_eq!(BslCoreStatus::from_byte(0x05), BslCoreStatus::PasswordError);
        assert_eq!(BslCoreStatus::from_byte(0x99), BslCoreStatus::Unknown(0x99));
    }

    #[test]
    fn uart_status_decodes_error_band() {
        assert_eq!(BslUartStatus::from_byte(0x00), BslUartStatus::Ack);
        assert_eq!(
            BslUartStatus::from_byte(0x52),
            BslUartStatus::ChecksumIncorrect
        );
    }

    #[test]
    fn block_transfer_exposes_root_device_status() {
        let err = Error::BlockTransfer {
            block: 3,
            source: Box::new(Error::Core(BslCoreStatus::BslLocked)),
        };
        assert_eq!(err.core_status(), Some(BslCoreStatus::BslLocked));
        assert_eq!(err.uart_status(), None);
    }
}
