//! Message framing for both BSL wire families.
//!
//! Frame construction and response parsing are pure functions over byte
//! slices; the session layer owns all transport I/O. The legacy
//! 1xx/2xx/4xx family uses checksum-protected frames acknowledged with
//! single ACK/NAK bytes; the modern 5xx/6xx family wraps core commands in
//! a CRC-protected UART frame or a bare USB-HID frame.

use bsl_firmware::crc16_ccitt;

use crate::Error;
use crate::error::{BslCoreStatus, BslUartStatus};
use crate::mcu::Protocol;

pub(crate) const LEGACY_SYNC: u8 = 0x80;
pub(crate) const LEGACY_ACK: u8 = 0x90;
pub(crate) const LEGACY_NAK: u8 = 0xA0;

const LEGACY_CMD_RX_PASSWORD: u8 = 0x10;
const LEGACY_CMD_RX_DATA_BLOCK: u8 = 0x12;
const LEGACY_CMD_TX_DATA_BLOCK: u8 = 0x14;
const LEGACY_CMD_MASS_ERASE: u8 = 0x18;
const LEGACY_CMD_LOAD_PC: u8 = 0x1A;
const LEGACY_CMD_TX_BSL_VERSION: u8 = 0x1E;

const LEGACY_MASS_ERASE_KEY: u16 = 0xA506;
const LEGACY_VERSION_LEN: usize = 16;

const MODERN_UART_HEADER: u8 = 0x80;
const MODERN_USB_HEADER: u8 = 0x3F;

const CORE_RX_DATA_BLOCK: u8 = 0x10;
const CORE_RX_PASSWORD: u8 = 0x11;
const CORE_MASS_ERASE: u8 = 0x15;
const CORE_CRC_CHECK: u8 = 0x16;
const CORE_LOAD_PC: u8 = 0x17;
const CORE_TX_DATA_BLOCK: u8 = 0x18;
const CORE_TX_BSL_VERSION: u8 = 0x19;
const CORE_CHANGE_BAUD: u8 = 0x52;

/// Leading byte of a modern core reply that carries data.
const RESPONSE_DATA: u8 = 0x3A;
/// Leading byte of a modern core reply that carries a status message.
const RESPONSE_MESSAGE: u8 = 0x3B;

/// Protocol-independent command vocabulary. Availability per wire family
/// is checked at build time, before any device I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CoreCommand<'a> {
    MassErase,
    RxPassword(&'a [u8]),
    RxDataBlock { addr: u32, data: &'a [u8] },
    TxDataBlock { addr: u32, len: u16 },
    CrcCheck { addr: u32, len: u16 },
    LoadPc { addr: u32 },
    BslVersion,
    ChangeBaud { baud: u32 },
}

impl CoreCommand<'_> {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::MassErase => "mass erase",
            Self::RxPassword(_) => "RX password",
            Self::RxDataBlock { .. } => "RX data block",
            Self::TxDataBlock { .. } => "TX data block",
            Self::CrcCheck { .. } => "CRC check",
            Self::LoadPc { .. } => "load PC",
            Self::BslVersion => "BSL version",
            Self::ChangeBaud { .. } => "change baud rate",
        }
    }

    /// Query-like commands answer with a data response head, action-like
    /// commands with a message head plus core status.
    fn is_query(&self) -> bool {
        matches!(
            self,
            Self::TxDataBlock { .. } | Self::CrcCheck { .. } | Self::BslVersion
        )
    }
}

/// Parsed, validated response payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Reply {
    Ack,
    Version([u8; 4]),
    Crc(u16),
    Data(Vec<u8>),
}

fn malformed(reason: impl Into<String>) -> Error {
    Error::MalformedResponse {
        reason: reason.into(),
    }
}

fn unsupported(command: &'static str, protocol: Protocol) -> Error {
    Error::UnsupportedCommand { command, protocol }
}

/// Map a UART baud rate to the modern BSL's change-baud argument byte.
fn baud_code(baud: u32) -> Option<u8> {
    match baud {
        9_600 => Some(0x02),
        19_200 => Some(0x03),
        38_400 => Some(0x04),
        57_600 => Some(0x05),
        115_200 => Some(0x06),
        _ => None,
    }
}

const fn addr_bytes(addr: u32) -> [u8; 3] {
    let le = addr.to_le_bytes();
    [le[0], le[1], le[2]]
}

/// Build the complete wire frame for `cmd` on `protocol`. Fails fast with
/// a validation error for command/family combinations the silicon does not
/// implement.
pub(crate) fn build_request(protocol: Protocol, cmd: &CoreCommand<'_>) -> Result<Vec<u8>, Error> {
    match protocol {
        Protocol::LegacyUart => build_legacy(cmd),
        Protocol::ModernUart => Ok(wrap_modern_uart(&core_bytes(protocol, cmd)?)),
        Protocol::ModernUsb => {
            let core = core_bytes(protocol, cmd)?;
            let mut frame = Vec::with_capacity(core.len() + 2);
            frame.push(MODERN_USB_HEADER);
            frame.push(core.len() as u8);
            frame.extend_from_slice(&core);
            Ok(frame)
        }
    }
}

/// Exact byte count the transport must deliver in reply to `cmd`.
pub(crate) fn reply_len(protocol: Protocol, cmd: &CoreCommand<'_>) -> usize {
    match protocol {
        Protocol::LegacyUart => match cmd {
            CoreCommand::TxDataBlock { len, .. } => usize::from(*len) + 5,
            CoreCommand::BslVersion => LEGACY_VERSION_LEN + 5,
            _ => 1,
        },
        // uart ack + header + length word + core + crc
        Protocol::ModernUart => 6 + core_reply_len(cmd),
        // header + length byte + core
        Protocol::ModernUsb => 2 + core_reply_len(cmd),
    }
}

fn core_reply_len(cmd: &CoreCommand<'_>) -> usize {
    match cmd {
        CoreCommand::BslVersion => 5,
        CoreCommand::CrcCheck { .. } => 3,
        CoreCommand::TxDataBlock { len, .. } => usize::from(*len) + 1,
        _ => 2,
    }
}

/// Validate and decode a raw response buffer for `cmd` on `protocol`.
pub(crate) fn parse_reply(
    protocol: Protocol,
    cmd: &CoreCommand<'_>,
    bytes: &[u8],
) -> Result<Reply, Error> {
    match protocol {
        Protocol::LegacyUart => parse_legacy(cmd, bytes),
        Protocol::ModernUart => parse_modern_uart(cmd, bytes),
        Protocol::ModernUsb => parse_modern_usb(cmd, bytes),
    }
}

// ---- legacy family ----

/// Interleaved XOR checksum of the legacy family: even-indexed bytes fold
/// into the first byte, odd-indexed into the second, each one's
/// complemented.
fn legacy_checksum(body: &[u8]) -> [u8; 2] {
    let mut ckl = 0u8;
    let mut ckh = 0u8;
    for (i, byte) in body.iter().enumerate() {
        if i % 2 == 0 {
            ckl ^= byte;
        } else {
            ckh ^= byte;
        }
    }
    [!ckl, !ckh]
}

fn legacy_frame(cmd: u8, addr: u16, length: u16, data: &[u8]) -> Vec<u8> {
    let l = (data.len() + 4) as u8;
    let mut body = Vec::with_capacity(data.len() + 10);
    body.extend_from_slice(&[
        LEGACY_SYNC,
        cmd,
        l,
        l,
        addr.to_le_bytes()[0],
        addr.to_le_bytes()[1],
        length.to_le_bytes()[0],
        length.to_le_bytes()[1],
    ]);
    body.extend_from_slice(data);
    let checksum = legacy_checksum(&body);
    body.extend_from_slice(&checksum);
    body
}

fn build_legacy(cmd: &CoreCommand<'_>) -> Result<Vec<u8>, Error> {
    match cmd {
        CoreCommand::MassErase => Ok(legacy_frame(
            LEGACY_CMD_MASS_ERASE,
            0x0000,
            LEGACY_MASS_ERASE_KEY,
            &[],
        )),
        CoreCommand::RxPassword(password) => Ok(legacy_frame(
            LEGACY_CMD_RX_PASSWORD,
            0x0000,
            password.len() as u16,
            password,
        )),
        CoreCommand::RxDataBlock { addr, data } => Ok(legacy_frame(
            LEGACY_CMD_RX_DATA_BLOCK,
            *addr as u16,
            data.len() as u16,
            data,
        )),
        CoreCommand::TxDataBlock { addr, len } => {
            Ok(legacy_frame(LEGACY_CMD_TX_DATA_BLOCK, *addr as u16, *len, &[]))
        }
        CoreCommand::LoadPc { addr } => {
            Ok(legacy_frame(LEGACY_CMD_LOAD_PC, *addr as u16, 0, &[]))
        }
        CoreCommand::BslVersion => Ok(legacy_frame(LEGACY_CMD_TX_BSL_VERSION, 0x0000, 0, &[])),
        CoreCommand::CrcCheck { .. } | CoreCommand::ChangeBaud { .. } => {
            Err(unsupported(cmd.name(), Protocol::LegacyUart))
        }
    }
}

fn parse_legacy(cmd: &CoreCommand<'_>, bytes: &[u8]) -> Result<Reply, Error> {
    match bytes.first() {
        Some(&LEGACY_NAK) => return Err(Error::Nak),
        Some(_) => {}
        None => return Err(malformed("empty response")),
    }

    if reply_len(Protocol::LegacyUart, cmd) == 1 {
        return match bytes {
            [LEGACY_ACK] => Ok(Reply::Ack),
            [other] => Err(malformed(format!("unexpected reply byte {other:#04X}"))),
            _ => Err(malformed("oversized ACK reply")),
        };
    }

    // data frame: header, doubled length, payload, two checksum bytes
    if bytes.len() < 5 {
        return Err(malformed("data frame too short"));
    }
    if bytes[0] != LEGACY_SYNC {
        return Err(malformed(format!("bad frame header {:#04X}", bytes[0])));
    }
    let len = usize::from(bytes[1]);
    if bytes[1] != bytes[2] || bytes.len() != len + 5 {
        return Err(malformed("length fields do not match frame size"));
    }
    let (body, checksum) = bytes.split_at(bytes.len() - 2);
    if legacy_checksum(body) != [checksum[0], checksum[1]] {
        return Err(malformed("frame checksum mismatch"));
    }

    let data = &body[3..];
    match cmd {
        CoreCommand::BslVersion => Ok(Reply::Version([data[0], data[1], data[2], data[3]])),
        CoreCommand::TxDataBlock { .. } => Ok(Reply::Data(data.to_vec())),
        _ => Err(malformed("unexpected data frame")),
    }
}

// ---- modern family ----

fn core_bytes(protocol: Protocol, cmd: &CoreCommand<'_>) -> Result<Vec<u8>, Error> {
    if protocol.is_usb()
        && !matches!(
            cmd,
            CoreCommand::RxPassword(_) | CoreCommand::RxDataBlock { .. } | CoreCommand::LoadPc { .. }
        )
    {
        return Err(unsupported(cmd.name(), protocol));
    }

    let core = match cmd {
        CoreCommand::MassErase => vec![CORE_MASS_ERASE],
        CoreCommand::RxPassword(password) => {
            let mut core = Vec::with_capacity(password.len() + 1);
            core.push(CORE_RX_PASSWORD);
            core.extend_from_slice(password);
            core
        }
        CoreCommand::RxDataBlock { addr, data } => {
            let mut core = Vec::with_capacity(data.len() + 4);
            core.push(CORE_RX_DATA_BLOCK);
            core.extend_from_slice(&addr_bytes(*addr));
            core.extend_from_slice(data);
            core
        }
        CoreCommand::TxDataBlock { addr, len } => {
            let mut core = vec![CORE_TX_DATA_BLOCK];
            core.extend_from_slice(&addr_bytes(*addr));
            core.extend_from_slice(&len.to_le_bytes());
            core
        }
        CoreCommand::CrcCheck { addr, len } => {
            let mut core = vec![CORE_CRC_CHECK];
            core.extend_from_slice(&addr_bytes(*addr));
            core.extend_from_slice(&len.to_le_bytes());
            core
        }
        CoreCommand::LoadPc { addr } => {
            let mut core = vec![CORE_LOAD_PC];
            core.extend_from_slice(&addr_bytes(*addr));
            core
        }
        CoreCommand::BslVersion => vec![CORE_TX_BSL_VERSION],
        CoreCommand::ChangeBaud { baud } => {
            let code = baud_code(*baud).ok_or_else(|| unsupported("requested baud rate", protocol))?;
            vec![CORE_CHANGE_BAUD, code]
        }
    };
    Ok(core)
}

fn wrap_modern_uart(core: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(core.len() + 5);
    frame.push(MODERN_UART_HEADER);
    frame.extend_from_slice(&(core.len() as u16).to_le_bytes());
    frame.extend_from_slice(core);
    frame.extend_from_slice(&crc16_ccitt(core).to_le_bytes());
    frame
}

fn parse_modern_uart(cmd: &CoreCommand<'_>, bytes: &[u8]) -> Result<Reply, Error> {
    let (&uart_byte, rest) = bytes.split_first().ok_or_else(|| malformed("empty response"))?;
    let uart = BslUartStatus::from_byte(uart_byte);
    if uart != BslUartStatus::Ack {
        return Err(Error::Uart(uart));
    }

    if rest.len() < 5 {
        return Err(malformed("response frame too short"));
    }
    if rest[0] != MODERN_UART_HEADER {
        return Err(malformed(format!("bad frame header {:#04X}", rest[0])));
    }
    let len = usize::from(u16::from_le_bytes([rest[1], rest[2]]));
    if rest.len() != len + 5 {
        return Err(malformed("length field does not match frame size"));
    }
    let core = &rest[3..3 + len];
    let crc = u16::from_le_bytes([rest[3 + len], rest[4 + len]]);
    if crc != crc16_ccitt(core) {
        return Err(malformed("response CRC mismatch"));
    }

    parse_core(cmd, core)
}

fn parse_modern_usb(cmd: &CoreCommand<'_>, bytes: &[u8]) -> Result<Reply, Error> {
    if bytes.len() < 2 {
        return Err(malformed("response frame too short"));
    }
    if bytes[0] != MODERN_USB_HEADER {
        return Err(malformed(format!("bad frame header {:#04X}", bytes[0])));
    }
    let len = usize::from(bytes[1]);
    if bytes.len() != len + 2 {
        return Err(malformed("length field does not match frame size"));
    }
    parse_core(cmd, &bytes[2..])
}

fn parse_core(cmd: &CoreCommand<'_>, core: &[u8]) -> Result<Reply, Error> {
    if core.is_empty() {
        return Err(malformed("empty core response"));
    }

    if cmd.is_query() {
        if core[0] != RESPONSE_DATA {
            return Err(malformed(format!("bad response head {:#04X}", core[0])));
        }
        return match cmd {
            CoreCommand::BslVersion => {
                let version: [u8; 4] = core[1..]
                    .try_into()
                    .map_err(|_| malformed("version payload is not 4 bytes"))?;
                Ok(Reply::Version(version))
            }
            CoreCommand::CrcCheck { .. } => {
                if core.len() != 3 {
                    return Err(malformed("CRC payload is not 2 bytes"));
                }
                Ok(Reply::Crc(u16::from_le_bytes([core[1], core[2]])))
            }
            CoreCommand::TxDataBlock { .. } => Ok(Reply::Data(core[1..].to_vec())),
            _ => unreachable!("only queries reach here"),
        };
    }

    if core[0] != RESPONSE_MESSAGE {
        return Err(malformed(format!("bad response head {:#04X}", core[0])));
    }
    if core.len() != 2 {
        return Err(malformed("message response is not 2 bytes"));
    }
    match BslCoreStatus::from_byte(core[1]) {
        BslCoreStatus::Success => Ok(Reply::Ack),
        status => Err(Error::Core(status)),
    }
}
