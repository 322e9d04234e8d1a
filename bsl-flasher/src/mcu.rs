//! Device catalog. Every session is keyed off one [`Mcu`], which decides
//! the wire protocol family, the password length, the transfer buffer
//! size and the default BSL invoke mechanism.

use std::fmt;

use crate::Error;

/// Wire protocol selected once per session from the configured MCU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// 1xx/2xx/4xx checksum-framed UART protocol.
    LegacyUart,
    /// 5xx/6xx CRC-framed UART protocol.
    ModernUart,
    /// 5xx/6xx USB-HID protocol; password, data download and load-PC only.
    ModernUsb,
}

impl Protocol {
    pub const DEFAULT_BAUD: u32 = 9600;

    pub fn is_usb(self) -> bool {
        matches!(self, Self::ModernUsb)
    }

    pub fn is_legacy(self) -> bool {
        matches!(self, Self::LegacyUart)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LegacyUart => "legacy UART",
            Self::ModernUart => "5xx/6xx UART",
            Self::ModernUsb => "5xx/6xx USB",
        };
        f.write_str(name)
    }
}

/// GPIO pattern used to force the target into BSL mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvokeMechanism {
    /// TEST/RST entry sequence for parts with shared JTAG pins.
    #[default]
    SharedJtag,
    /// TCK/RST entry sequence for parts with dedicated JTAG pins.
    DedicatedJtag,
    /// No pulses; the target is already in BSL mode (USB enumeration or
    /// an external boot button).
    Manual,
}

/// Supported target families, grouped by their BSL protocol class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mcu {
    Msp430F1xx,
    Msp430F2xx,
    Msp430F4xx,
    /// Non-A F543x, the one modern part with a 16-byte password.
    Msp430F543xNonA,
    Msp430F5xx,
    Msp430F6xx,
    Msp430Fr5xx,
    Msp430Fr6xx,
    Msp432P401R,
}

impl Mcu {
    pub const ALL: [Mcu; 9] = [
        Mcu::Msp430F1xx,
        Mcu::Msp430F2xx,
        Mcu::Msp430F4xx,
        Mcu::Msp430F543xNonA,
        Mcu::Msp430F5xx,
        Mcu::Msp430F6xx,
        Mcu::Msp430Fr5xx,
        Mcu::Msp430Fr6xx,
        Mcu::Msp432P401R,
    ];

    fn is_legacy(self) -> bool {
        matches!(self, Mcu::Msp430F1xx | Mcu::Msp430F2xx | Mcu::Msp430F4xx)
    }

    /// Only the flash 5xx/6xx parts ship a USB BSL.
    pub fn supports_usb(self) -> bool {
        matches!(self, Mcu::Msp430F5xx | Mcu::Msp430F6xx)
    }

    /// Resolve the wire protocol for this part, honoring the transport
    /// choice. Fails fast before any device I/O when the combination does
    /// not exist in silicon.
    pub fn protocol(self, usb: bool) -> Result<Protocol, Error> {
        match (usb, self.is_legacy()) {
            (false, true) => Ok(Protocol::LegacyUart),
            (false, false) => Ok(Protocol::ModernUart),
            (true, _) if self.supports_usb() => Ok(Protocol::ModernUsb),
            (true, true) => Err(Error::UnsupportedCommand {
                command: "USB transport",
                protocol: Protocol::LegacyUart,
            }),
            (true, false) => Err(Error::UnsupportedCommand {
                command: "USB transport",
                protocol: Protocol::ModernUart,
            }),
        }
    }

    /// BSL password length in bytes: the legacy family sends 20, the non-A
    /// F543x 16, every other modern part the full 32-byte IVT tail.
    pub fn password_len(self) -> usize {
        match self {
            Mcu::Msp430F1xx | Mcu::Msp430F2xx | Mcu::Msp430F4xx => 20,
            Mcu::Msp430F543xNonA => 16,
            _ => 32,
        }
    }

    /// Largest data payload of one RX/TX block for this part's BSL.
    pub fn buffer_size(self, protocol: Protocol) -> usize {
        match protocol {
            Protocol::ModernUsb => 48,
            Protocol::LegacyUart | Protocol::ModernUart => 240,
        }
    }

    pub fn default_invoke(self) -> InvokeMechanism {
        match self {
            Mcu::Msp430F4xx | Mcu::Msp430F6xx | Mcu::Msp430Fr6xx => InvokeMechanism::DedicatedJtag,
            _ => InvokeMechanism::SharedJtag,
        }
    }
}

impl fmt::Display for Mcu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mcu::Msp430F1xx => "MSP430F1xx",
            Mcu::Msp430F2xx => "MSP430F2xx",
            Mcu::Msp430F4xx => "MSP430F4xx",
            Mcu::Msp430F543xNonA => "MSP430F543x (non-A)",
            Mcu::Msp430F5xx => "MSP430F5xx",
            Mcu::Msp430F6xx => "MSP430F6xx",
            Mcu::Msp430Fr5xx => "MSP430FR5xx",
            Mcu::Msp430Fr6xx => "MSP430FR6xx",
            Mcu::Msp432P401R => "MSP432P401R",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_parts_use_legacy_uart() {
        assert_eq!(
            Mcu::Msp430F1xx.protocol(false).unwrap(),
            Protocol::LegacyUart
        );
        assert_eq!(Mcu::Msp430F1xx.password_len(), 20);
    }

    #[test]
    fn usb_is_limited_to_5xx_6xx_flash_parts() {
        assert_eq!(Mcu::Msp430F5xx.protocol(true).unwrap(), Protocol::ModernUsb);
        assert!(matches!(
            Mcu::Msp430F1xx.protocol(true),
            Err(Error::UnsupportedCommand { .. })
        ));
        assert!(matches!(
            Mcu::Msp432P401R.protocol(true),
            Err(Error::UnsupportedCommand { .. })
        ));
    }

    #[test]
    fn password_lengths_per_class() {
        assert_eq!(Mcu::Msp430F543xNonA.password_len(), 16);
        assert_eq!(Mcu::Msp430Fr5xx.password_len(), 32);
        assert_eq!(Mcu::Msp430F4xx.password_len(), 20);
    }

    #[test]
    fn usb_buffer_is_smaller() {
        assert_eq!(Mcu::Msp430F5xx.buffer_size(Protocol::ModernUsb), 48);
        assert_eq!(Mcu::Msp430F5xx.buffer_size(Protocol::ModernUart), 240);
    }
}
