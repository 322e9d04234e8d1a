//! ELF32 reader. Extracts the bytes of every `PT_LOAD` program header
//! segment; section headers are only walked for an informational log.
//! Strictly 32-bit little-endian executables, everything else is rejected.

use tracing::debug;

use crate::{Error, model::FwNode};

const MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

const CLASS_32: u8 = 1;
const DATA_LE: u8 = 1;
const TYPE_EXEC: u16 = 2;

const PT_LOAD: u32 = 1;

const EHDR_LEN: usize = 52;
const PHDR_LEN: usize = 32;
const SHDR_LEN: usize = 40;

fn truncated(what: &'static str) -> Error {
    Error::UnsupportedElf(what)
}

fn read_u16(bytes: &[u8], offset: usize) -> Result<u16, Error> {
    bytes
        .get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| truncated("file truncated"))
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, Error> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| truncated("file truncated"))
}

pub(crate) fn is_elf(bytes: &[u8]) -> bool {
    bytes.starts_with(&MAGIC)
}

pub(crate) fn parse(bytes: &[u8]) -> Result<Vec<FwNode>, Error> {
    if bytes.len() < EHDR_LEN {
        return Err(truncated("header truncated"));
    }
    if !is_elf(bytes) {
        return Err(Error::UnsupportedElf("not an ELF file"));
    }
    if bytes[4] != CLASS_32 {
        return Err(Error::UnsupportedElf("not a 32-bit ELF"));
    }
    if bytes[5] != DATA_LE {
        return Err(Error::UnsupportedElf("not little-endian"));
    }
    if read_u16(bytes, 16)? != TYPE_EXEC {
        return Err(Error::UnsupportedElf("not an executable"));
    }

    log_sections(bytes);

    let ph_off = read_u32(bytes, 28)? as usize;
    let ph_entsize = usize::from(read_u16(bytes, 42)?);
    let ph_num = usize::from(read_u16(bytes, 44)?);
    if ph_num > 0 && ph_entsize < PHDR_LEN {
        return Err(Error::UnsupportedElf("bad program header entry size"));
    }

    let mut nodes = Vec::new();
    for i in 0..ph_num {
        let base = ph_off
            .checked_add(i.checked_mul(ph_entsize).ok_or_else(|| truncated("file truncated"))?)
            .ok_or_else(|| truncated("file truncated"))?;

        if read_u32(bytes, base)? != PT_LOAD {
            continue;
        }
        let p_offset = read_u32(bytes, base + 4)? as usize;
        let p_paddr = read_u32(bytes, base + 12)?;
        let p_filesz = read_u32(bytes, base + 16)? as usize;
        if p_filesz == 0 {
            continue;
        }

        let data = bytes
            .get(p_offset..p_offset.checked_add(p_filesz).ok_or_else(|| truncated("segment out of bounds"))?)
            .ok_or_else(|| truncated("segment out of bounds"))?;

        debug!(
            index = i,
            paddr = format_args!("{p_paddr:#010x}"),
            len = p_filesz,
            "loading segment"
        );

        for (j, &byte) in data.iter().enumerate() {
            let addr = p_paddr
                .checked_add(j as u32)
                .ok_or_else(|| Error::UnsupportedElf("segment address overflow"))?;
            nodes.push(FwNode::new(addr, byte));
        }
    }

    if nodes.is_empty() {
        return Err(Error::UnsupportedElf("no loadable segments"));
    }

    Ok(nodes)
}

/// Walk the section header table and log each non-debug section. Sections
/// never contribute bytes; a malformed table is ignored rather than fatal.
fn log_sections(bytes: &[u8]) {
    let Ok(sh_off) = read_u32(bytes, 32).map(|v| v as usize) else {
        return;
    };
    let Ok(sh_entsize) = read_u16(bytes, 46).map(usize::from) else {
        return;
    };
    let (Ok(sh_num), Ok(shstrndx)) = (
        read_u16(bytes, 48).map(usize::from),
        read_u16(bytes, 50).map(usize::from),
    ) else {
        return;
    };
    if sh_off == 0 || sh_entsize < SHDR_LEN || sh_num == 0 {
        return;
    }

    let strtab = sh_off
        .checked_add(shstrndx * sh_entsize)
        .and_then(|base| {
            let off = read_u32(bytes, base + 16).ok()? as usize;
            let len = read_u32(bytes, base + 20).ok()? as usize;
            bytes.get(off..off.checked_add(len)?)
        })
        .unwrap_or(&[]);

    for i in 0..sh_num {
        let Some(base) = sh_off.checked_add(i * sh_entsize) else {
            return;
        };
        let (Ok(sh_name), Ok(sh_type)) = (read_u32(bytes, base), read_u32(bytes, base + 4)) else {
            return;
        };
        let name = section_name(strtab, sh_name as usize);
        if name.starts_with(".debug") {
            continue;
        }
        debug!(index = i, name, sh_type, "section");
    }
}

fn section_name(strtab: &[u8], offset: usize) -> &str {
    strtab
        .get(offset..)
        .and_then(|tail| tail.split(|&b| b == 0).next())
        .and_then(|raw| std::str::from_utf8(raw).ok())
        .unwrap_or("")
}
