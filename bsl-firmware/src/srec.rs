//! Motorola S-record codec. S1/S2/S3 data records with 2/3/4-byte
//! addresses; one record family per file, terminated by the matching
//! S9/S8/S7 record.

use std::fmt::Write;

use crate::{Error, Format, model::FwNode};

pub(crate) const DEFAULT_LINE_LENGTH: usize = 32;

fn invalid(line: usize, reason: impl Into<String>) -> Error {
    Error::Invalid {
        format: Format::Srec,
        line,
        reason: reason.into(),
    }
}

fn decode_hex(line_no: usize, text: &str) -> Result<Vec<u8>, Error> {
    if text.len() % 2 != 0 {
        return Err(invalid(line_no, "odd number of hex digits"));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&text[i..i + 2], 16)
                .map_err(|_| invalid(line_no, format!("bad hex digits `{}`", &text[i..i + 2])))
        })
        .collect()
}

/// One's complement of the low byte of the sum over count, address and data.
fn checksum(bytes: &[u8]) -> u8 {
    !bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

const fn addr_width(kind: u8) -> Option<usize> {
    match kind {
        b'1' => Some(2),
        b'2' => Some(3),
        b'3' => Some(4),
        _ => None,
    }
}

const fn terminator_family(kind: u8) -> Option<u8> {
    match kind {
        b'9' => Some(b'1'),
        b'8' => Some(b'2'),
        b'7' => Some(b'3'),
        _ => None,
    }
}

pub(crate) fn parse(text: &str) -> Result<Vec<FwNode>, Error> {
    let mut nodes = Vec::new();
    let mut family: Option<u8> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        let mut chars = line.bytes();
        if !matches!(chars.next(), Some(b'S') | Some(b's')) {
            return Err(invalid(line_no, "record does not start with `S`"));
        }
        let Some(kind) = chars.next() else {
            return Err(invalid(line_no, "record type missing"));
        };

        let bytes = decode_hex(line_no, &line[2..])?;
        if bytes.len() < 3 {
            return Err(invalid(line_no, "record too short"));
        }

        let count = usize::from(bytes[0]);
        if bytes.len() != count + 1 {
            return Err(invalid(
                line_no,
                format!("record length {} does not match byte count {count}", bytes.len() - 1),
            ));
        }

        let expected = checksum(&bytes[..bytes.len() - 1]);
        let found = bytes[bytes.len() - 1];
        if expected != found {
            return Err(Error::Checksum {
                format: Format::Srec,
                line: line_no,
                expected,
                found,
            });
        }

        match kind {
            b'0' | b'5' | b'6' => {} // header and record-count records
            b'1' | b'2' | b'3' => {
                let width = addr_width(kind).unwrap();
                if count < width + 1 {
                    return Err(invalid(line_no, "record shorter than its address"));
                }
                match family {
                    None => family = Some(kind),
                    Some(f) if f == kind => {}
                    Some(f) => {
                        return Err(invalid(
                            line_no,
                            format!("S{} record in an S{} file", kind as char, f as char),
                        ));
                    }
                }

                let addr = bytes[1..1 + width]
                    .iter()
                    .fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
                for (i, &byte) in bytes[1 + width..bytes.len() - 1].iter().enumerate() {
                    let at = addr
                        .checked_add(i as u32)
                        .ok_or_else(|| invalid(line_no, "address overflow"))?;
                    nodes.push(FwNode::new(at, byte));
                }
            }
            b'7' | b'8' | b'9' => {
                let matching = terminator_family(kind).unwrap();
                match family {
                    Some(f) if f == matching => return finish(nodes),
                    Some(f) => {
                        return Err(invalid(
                            line_no,
                            format!("S{} terminator for an S{} file", kind as char, f as char),
                        ));
                    }
                    None => return Err(invalid(line_no, "terminator before any data record")),
                }
            }
            _ => {
                return Err(invalid(
                    line_no,
                    format!("unknown record type S{}", kind as char),
                ));
            }
        }
    }

    finish(nodes)
}

fn finish(nodes: Vec<FwNode>) -> Result<Vec<FwNode>, Error> {
    if nodes.is_empty() {
        return Err(invalid(0, "no data records"));
    }
    Ok(nodes)
}

fn push_record(out: &mut String, kind: u8, width: usize, addr: u32, data: &[u8]) {
    let mut bytes = Vec::with_capacity(width + data.len() + 2);
    bytes.push((width + data.len() + 1) as u8);
    bytes.extend_from_slice(&addr.to_be_bytes()[4 - width..]);
    bytes.extend_from_slice(data);

    let _ = write!(out, "S{}", kind as char);
    for byte in &bytes {
        let _ = write!(out, "{byte:02X}");
    }
    let _ = writeln!(out, "{:02X}", checksum(&bytes));
}

/// Serialize nodes as S-records. The record family follows the highest
/// address present; rows break at address discontinuities.
pub(crate) fn write(nodes: &[FwNode], line_length: usize) -> String {
    let max_addr = nodes.iter().map(|n| n.addr).max().unwrap_or(0);
    let (data_kind, term_kind, width) = if max_addr > 0xFF_FFFF {
        (b'3', b'7', 4)
    } else if max_addr > 0xFFFF {
        (b'2', b'8', 3)
    } else {
        (b'1', b'9', 2)
    };

    let mut out = String::new();
    push_record(&mut out, b'0', 2, 0, &[]);

    let mut row: Vec<u8> = Vec::with_capacity(line_length);
    let mut row_addr: u32 = 0;
    for node in nodes {
        let next = row_addr.wrapping_add(row.len() as u32);
        let fits = !row.is_empty() && next == node.addr && row.len() < line_length;
        if !fits {
            if !row.is_empty() {
                push_record(&mut out, data_kind, width, row_addr, &row);
                row.clear();
            }
            row_addr = node.addr;
        }
        row.push(node.data);
    }
    if !row.is_empty() {
        push_record(&mut out, data_kind, width, row_addr, &row);
    }

    push_record(&mut out, term_kind, width, 0, &[]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_s1_file() {
        let nodes = parse("S0030000FC\nS107000001020304EE\nS9030000FC\n").unwrap();
        assert_eq!(
            nodes,
            vec![
                FwNode::new(0, 1),
                FwNode::new(1, 2),
                FwNode::new(2, 3),
                FwNode::new(3, 4),
            ]
        );
    }

    #[test]
    fn detects_checksum_mismatch() {
        assert!(matches!(
            parse("S107000001020304ED\n"),
            Err(Error::Checksum { line: 1, .. })
        ));
    }

    #[test]
    fn rejects_mixed_record_families() {
        let err = parse("S107000001020304EE\nS30900000000AABBCCDDE8\n");
        assert!(matches!(err, Err(Error::Invalid { line: 2, .. })));
    }

    #[test]
    fn rejects_mismatched_terminator() {
        let err = parse("S107000001020304EE\nS70500000000FA\n");
        assert!(matches!(err, Err(Error::Invalid { line: 2, .. })));
    }

    #[test]
    fn round_trip_s1() {
        let nodes = vec![
            FwNode::new(0x4400, 0x31),
            FwNode::new(0x4401, 0x40),
            FwNode::new(0x4410, 0xB2),
        ];
        assert_eq!(parse(&write(&nodes, 32)).unwrap(), nodes);
    }

    #[test]
    fn wide_addresses_use_s2_family() {
        let nodes = vec![FwNode::new(0x0001_F400, 0xAA)];
        let text = write(&nodes, 32);
        assert!(text.contains("\nS2"));
        assert!(text.contains("\nS804"));
        assert_eq!(parse(&text).unwrap(), nodes);
    }
}
