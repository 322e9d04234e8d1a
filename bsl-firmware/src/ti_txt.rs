//! TI-TXT codec. Blocks are introduced by `@XXXX` address headers followed
//! by hex byte pairs, terminated by a single `q` line.

use std::fmt::Write;

use crate::{Error, Format, model::FwNode};

pub(crate) const DEFAULT_LINE_LENGTH: usize = 16;

fn invalid(line: usize, reason: impl Into<String>) -> Error {
    Error::Invalid {
        format: Format::TiTxt,
        line,
        reason: reason.into(),
    }
}

pub(crate) fn parse(text: &str) -> Result<Vec<FwNode>, Error> {
    let mut nodes = Vec::new();
    let mut addr: Option<u32> = None;

    'outer: for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;

        for token in line.split_whitespace() {
            if let Some(hex) = token.strip_prefix('@') {
                if hex.len() != 4 && hex.len() != 8 {
                    return Err(invalid(line_no, format!("bad address header `{token}`")));
                }
                let value = u32::from_str_radix(hex, 16)
                    .map_err(|_| invalid(line_no, format!("bad address header `{token}`")))?;
                addr = Some(value);
            } else if token.eq_ignore_ascii_case("q") {
                break 'outer;
            } else if token.len() == 2 {
                let data = u8::from_str_radix(token, 16)
                    .map_err(|_| invalid(line_no, format!("bad data byte `{token}`")))?;
                let at = addr
                    .ok_or_else(|| invalid(line_no, "data byte before any address header"))?;
                nodes.push(FwNode::new(at, data));
                addr = Some(
                    at.checked_add(1)
                        .ok_or_else(|| invalid(line_no, "address overflow"))?,
                );
            } else {
                return Err(invalid(line_no, format!("unexpected token `{token}`")));
            }
        }
    }

    if nodes.is_empty() {
        return Err(invalid(0, "no data records"));
    }

    Ok(nodes)
}

/// Serialize nodes as TI-TXT. A new `@` block starts at every address
/// discontinuity; rows hold at most `line_length` bytes.
pub(crate) fn write(nodes: &[FwNode], line_length: usize) -> String {
    let mut out = String::new();
    let mut prev: Option<u32> = None;
    let mut column = 0usize;

    for node in nodes {
        let contiguous = prev.is_some_and(|p| p.checked_add(1) == Some(node.addr));

        if !contiguous {
            if prev.is_some() {
                out.push('\n');
            }
            if node.addr > 0xFFFF {
                let _ = writeln!(out, "@{:08X}", node.addr);
            } else {
                let _ = writeln!(out, "@{:04X}", node.addr);
            }
            column = 0;
        } else if column == line_length {
            out.push('\n');
            column = 0;
        }

        if column > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02X}", node.data);
        column += 1;
        prev = Some(node.addr);
    }

    out.push_str("\nq\n");
    out
}
