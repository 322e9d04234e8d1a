//! Firmware image toolbox for MSP430/MSP432 bootstrap-loader workflows.
//!
//! Parses and serializes the common firmware interchange formats (TI-TXT,
//! Intel HEX, Motorola SREC, read-only ELF32), and offers the pure
//! operations a flashing session needs on top of them: format detection,
//! gap filling, image comparison, disjoint combination and BSL password
//! extraction. No device I/O happens here.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;

pub mod crc;
pub mod model;

mod elf;
mod intel_hex;
mod srec;
mod ti_txt;

pub use crc::{CRC16_SEED, Crc16, crc16_ccitt};
pub use model::{Firmware, FwInfo, FwNode, FwOrigin, RxBlock, fill_gaps};

/// Firmware interchange formats. [`Format::Auto`] defers to content
/// sniffing; [`Format::Elf`] is parse-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Auto,
    TiTxt,
    IntelHex,
    Srec,
    Elf,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Format::Auto => "auto",
            Format::TiTxt => "TI-TXT",
            Format::IntelHex => "Intel-HEX",
            Format::Srec => "SREC",
            Format::Elf => "ELF",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read `{path}`")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{format} parse error at line {line}: {reason}")]
    Invalid {
        format: Format,
        line: usize,
        reason: String,
    },
    #[error("{format} checksum mismatch at line {line}: expected {expected:#04X}, found {found:#04X}")]
    Checksum {
        format: Format,
        line: usize,
        expected: u8,
        found: u8,
    },
    #[error("could not detect the firmware format")]
    UnknownFormat,
    #[error("unsupported ELF file: {0}")]
    UnsupportedElf(&'static str),
    #[error("firmware contains no data")]
    EmptyInput,
    #[error("firmware images overlap at address {addr:#06X}")]
    AddressOverlap { addr: u32 },
    #[error("cannot serialize firmware as {0}")]
    UnsupportedOutput(Format),
}

/// Sniff the format of a raw byte buffer. The ELF magic wins over any
/// text marker; among the text formats `@` marks TI-TXT, then `S` SREC,
/// then `:` Intel HEX.
pub fn detect(bytes: &[u8]) -> Result<Format, Error> {
    if elf::is_elf(bytes) {
        return Ok(Format::Elf);
    }

    let text = String::from_utf8_lossy(bytes);
    if text.contains('@') {
        Ok(Format::TiTxt)
    } else if text.contains(['S', 's']) {
        Ok(Format::Srec)
    } else if text.contains(':') {
        Ok(Format::IntelHex)
    } else {
        Err(Error::UnknownFormat)
    }
}

/// Parse a firmware image from memory. `fill` inserts 0xFF nodes into
/// every address gap and records the inserted addresses in the resulting
/// [`FwInfo::filled_ff_addr`].
pub fn parse_bytes(bytes: &[u8], format: Format, fill: bool) -> Result<Firmware, Error> {
    let format = match format {
        Format::Auto => detect(bytes)?,
        other => other,
    };
    debug!(%format, len = bytes.len(), "parsing firmware");

    let mut nodes = match format {
        Format::Elf => elf::parse(bytes)?,
        Format::TiTxt => ti_txt::parse(&String::from_utf8_lossy(bytes))?,
        Format::IntelHex => intel_hex::parse(&String::from_utf8_lossy(bytes))?,
        Format::Srec => srec::parse(&String::from_utf8_lossy(bytes))?,
        Format::Auto => unreachable!("auto resolved above"),
    };
    nodes.sort_by_key(|n| n.addr);

    let filled_addrs = if fill {
        let (filled, inserted) = fill_gaps(&nodes);
        nodes = filled;
        inserted
    } else {
        Vec::new()
    };

    Ok(Firmware::from_nodes(nodes, format, filled_addrs))
}

/// Parse a firmware image from a file. See [`parse_bytes`].
pub fn parse_file(path: impl AsRef<Path>, format: Format, fill: bool) -> Result<Firmware, Error> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|source| Error::File {
        path: path.to_path_buf(),
        source,
    })?;
    parse_bytes(&bytes, format, fill)
}

/// Serialize an image to one of the writable text formats.
/// `line_length == 0` selects the format default (16 data bytes per row
/// for TI-TXT, 32 for Intel HEX and SREC).
pub fn create(firmware: &Firmware, format: Format, line_length: usize) -> Result<String, Error> {
    if firmware.is_empty() {
        return Err(Error::EmptyInput);
    }

    let pick = |default: usize| if line_length == 0 { default } else { line_length };
    match format {
        Format::TiTxt => Ok(ti_txt::write(
            firmware.nodes(),
            pick(ti_txt::DEFAULT_LINE_LENGTH),
        )),
        Format::IntelHex => Ok(intel_hex::write(
            firmware.nodes(),
            pick(intel_hex::DEFAULT_LINE_LENGTH),
        )),
        Format::Srec => Ok(srec::write(
            firmware.nodes(),
            pick(srec::DEFAULT_LINE_LENGTH),
        )),
        Format::Auto | Format::Elf => Err(Error::UnsupportedOutput(format)),
    }
}

/// Lowest address of the BSL password region in the interrupt vector table.
pub const PASSWORD_ADDR: u32 = 0xFFE0;

/// Extract the 16-byte BSL password stored at the top of the interrupt
/// vector table (0xFFE0..=0xFFEF). `None` when any of the 16 bytes is
/// missing from the image.
pub fn get_password(path: impl AsRef<Path>) -> Result<Option<[u8; 16]>, Error> {
    let firmware = parse_file(path, Format::Auto, true)?;
    let mut password = [0u8; 16];
    for (i, slot) in password.iter_mut().enumerate() {
        match firmware.byte_at(PASSWORD_ADDR + i as u32) {
            Some(byte) => *slot = byte,
            None => return Ok(None),
        }
    }
    Ok(Some(password))
}

/// Parse an image and derive its summary, reset vector included.
pub fn validate(path: impl AsRef<Path>) -> Result<FwInfo, Error> {
    let mut firmware = parse_file(path, Format::Auto, false)?;
    firmware.set_reset_vector(0xFFFE);
    Ok(firmware.info().clone())
}

/// Outcome of [`compare`]: `match_ratio` is the shared fraction of the
/// larger image, `bytes_diff` the number of node slots that differ
/// (-1 when either side is empty).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Comparison {
    pub equal: bool,
    pub match_ratio: f64,
    pub bytes_diff: i32,
}

/// Compare two images node-by-node. Nodes count as shared when both
/// address and data match.
pub fn compare(a: &Firmware, b: &Firmware) -> Comparison {
    if a.is_empty() || b.is_empty() {
        return Comparison {
            equal: false,
            match_ratio: 0.0,
            bytes_diff: -1,
        };
    }

    let (na, nb) = (a.nodes(), b.nodes());
    let mut shared = 0usize;
    let (mut ia, mut ib) = (0usize, 0usize);
    while ia < na.len() && ib < nb.len() {
        if na[ia].addr < nb[ib].addr {
            ia += 1;
        } else if na[ia].addr > nb[ib].addr {
            ib += 1;
        } else {
            if na[ia].data == nb[ib].data {
                shared += 1;
            }
            ia += 1;
            ib += 1;
        }
    }

    let larger = na.len().max(nb.len());
    Comparison {
        equal: shared == na.len() && shared == nb.len(),
        match_ratio: shared as f64 / larger as f64,
        bytes_diff: (larger - shared) as i32,
    }
}

/// Compare two firmware files. See [`compare`].
pub fn compare_files(a: impl AsRef<Path>, b: impl AsRef<Path>) -> Result<Comparison, Error> {
    let fw_a = parse_file(a, Format::Auto, false)?;
    let fw_b = parse_file(b, Format::Auto, false)?;
    Ok(compare(&fw_a, &fw_b))
}

/// Merge two address-disjoint images and serialize the union. Shared
/// addresses are an error even when both images agree on the data.
pub fn combine(
    a: &Firmware,
    b: &Firmware,
    format: Format,
    fill: bool,
) -> Result<String, Error> {
    let (na, nb) = (a.nodes(), b.nodes());
    let (mut ia, mut ib) = (0usize, 0usize);
    while ia < na.len() && ib < nb.len() {
        if na[ia].addr < nb[ib].addr {
            ia += 1;
        } else if na[ia].addr > nb[ib].addr {
            ib += 1;
        } else {
            return Err(Error::AddressOverlap { addr: na[ia].addr });
        }
    }

    let mut union = Vec::with_capacity(na.len() + nb.len());
    union.extend_from_slice(na);
    union.extend_from_slice(nb);
    union.sort_by_key(|n| n.addr);

    let union = if fill {
        fill_gaps(&union).0
    } else {
        union
    };

    create(&Firmware::from_nodes(union, format, Vec::new()), format, 0)
}

/// Combine two firmware files. See [`combine`].
pub fn combine_files(
    a: impl AsRef<Path>,
    b: impl AsRef<Path>,
    format: Format,
    fill: bool,
) -> Result<String, Error> {
    let fw_a = parse_file(a, Format::Auto, false)?;
    let fw_b = parse_file(b, Format::Auto, false)?;
    combine(&fw_a, &fw_b, format, fill)
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    fn firmware(spec: &[(u32, u8)]) -> Firmware {
        let nodes = spec.iter().map(|&(a, d)| FwNode::new(a, d)).collect();
        Firmware::from_nodes(nodes, Format::TiTxt, Vec::new())
    }

    #[test]
    fn detect_prefers_elf_magic() {
        let mut bytes = vec![0x7F, b'E', b'L', b'F'];
        bytes.extend_from_slice(b"@0800 S1 :00");
        assert_eq!(detect(&bytes).unwrap(), Format::Elf);
    }

    #[test]
    fn detect_text_formats() {
        assert_eq!(detect(b"@0800\n01\nq\n").unwrap(), Format::TiTxt);
        assert_eq!(detect(b"S107000001020304EE\n").unwrap(), Format::Srec);
        assert_eq!(detect(b":0400000001020304F2\n").unwrap(), Format::IntelHex);
        assert!(matches!(detect(b"0102"), Err(Error::UnknownFormat)));
    }

    #[test]
    fn parse_derives_info() {
        let fw = parse_bytes(b"@0800\r\n01 02 03 04\r\nq\r\n", Format::Auto, false).unwrap();
        let info = fw.info();
        assert_eq!(info.format, Format::TiTxt);
        assert_eq!(info.addr_first, 0x0800);
        assert_eq!(info.addr_last, 0x0803);
        assert_eq!(info.size_full, 4);
        assert_eq!(info.size_code, 4);
    }

    #[test]
    fn parse_with_fill_records_inserted_addresses() {
        let fw = parse_bytes(b"@0800\n01\n@0803\n02\nq\n", Format::Auto, true).unwrap();
        assert_eq!(fw.info().filled_ff_addr, vec![0x0801, 0x0802]);
        assert_eq!(fw.byte_at(0x0801), Some(0xFF));
        assert_eq!(fw.info().size_code, 4);
    }

    #[test]
    fn create_rejects_empty_and_readonly_formats() {
        let planned = Firmware::planned(0x4400, 0x100, 256);
        assert!(matches!(
            create(&planned, Format::TiTxt, 0),
            Err(Error::EmptyInput)
        ));

        let fw = firmware(&[(0x4400, 0x31)]);
        assert!(matches!(
            create(&fw, Format::Elf, 0),
            Err(Error::UnsupportedOutput(Format::Elf))
        ));
    }

    #[test]
    fn create_honors_default_line_lengths() {
        let fw = firmware(&(0..20u32).map(|i| (0x100 + i, i as u8)).collect::<Vec<_>>());
        let ti = create(&fw, Format::TiTxt, 0).unwrap();
        assert_eq!(ti.lines().nth(1).unwrap().split_whitespace().count(), 16);
    }

    #[test]
    fn compare_identical_images() {
        let a = firmware(&[(0, 1), (1, 2)]);
        let result = compare(&a, &a.clone());
        assert!(result.equal);
        assert_eq!(result.match_ratio, 1.0);
        assert_eq!(result.bytes_diff, 0);
    }

    #[test]
    fn compare_is_symmetric_on_mismatch() {
        let a = firmware(&[(0, 1), (1, 2), (2, 3), (3, 4)]);
        let b = firmware(&[(0, 1), (1, 2), (2, 0xAA)]);
        let ab = compare(&a, &b);
        let ba = compare(&b, &a);
        assert_eq!(ab.equal, ba.equal);
        assert!(!ab.equal);
        assert_eq!(ab.match_ratio, 0.5);
        assert_eq!(ab.bytes_diff, 2);
        assert_eq!(ab.match_ratio, ba.match_ratio);
    }

    #[test]
    fn compare_empty_input() {
        let a = firmware(&[(0, 1)]);
        let empty = Firmware::planned(0, 0x10, 16);
        let result = compare(&a, &empty);
        assert!(!result.equal);
        assert_eq!(result.match_ratio, 0.0);
        assert_eq!(result.bytes_diff, -1);
    }

    #[test]
    fn combine_rejects_shared_address_even_with_equal_data() {
        let a = firmware(&[(0x100, 0xAA), (0x101, 0xBB)]);
        let b = firmware(&[(0x101, 0xBB)]);
        assert!(matches!(
            combine(&a, &b, Format::TiTxt, false),
            Err(Error::AddressOverlap { addr: 0x101 })
        ));
    }

    #[test]
    fn combine_merges_disjoint_images() {
        let a = firmware(&[(0x100, 0x01), (0x101, 0x02)]);
        let b = firmware(&[(0x0F0, 0xEE)]);
        let text = combine(&a, &b, Format::TiTxt, false).unwrap();
        let merged = parse_bytes(text.as_bytes(), Format::TiTxt, false).unwrap();
        assert_eq!(
            merged.nodes(),
            &[
                FwNode::new(0x0F0, 0xEE),
                FwNode::new(0x100, 0x01),
                FwNode::new(0x101, 0x02),
            ]
        );
    }

    #[test]
    fn password_extraction_needs_all_sixteen_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "@FFE0\n").unwrap();
        for i in 0..16u8 {
            write!(file, "{i:02X} ").unwrap();
        }
        write!(file, "\nq\n").unwrap();
        let password = get_password(file.path()).unwrap().unwrap();
        assert_eq!(password[0], 0x00);
        assert_eq!(password[15], 0x0F);

        let mut partial = tempfile::NamedTempFile::new().unwrap();
        write!(partial, "@FFE0\n00 01 02\nq\n").unwrap();
        assert_eq!(get_password(partial.path()).unwrap(), None);
    }

    #[test]
    fn validate_reconstructs_reset_vector() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "@FFFE\n00 44\nq\n").unwrap();
        let info = validate(file.path()).unwrap();
        assert_eq!(info.reset_vector, Some(0x4400));
        assert_eq!(info.crc16, crc16_ccitt(&[0x00, 0x44]));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = parse_file("/nonexistent/firmware.txt", Format::Auto, false).unwrap_err();
        assert!(matches!(err, Error::File { .. }));
    }
}
