//! Just enough ELF parsing to find the strings that carry store roots as
//! search paths: the program interpreter and `DT_RPATH`/`DT_RUNPATH`.

use std::ops::Range;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;

const DT_NULL: u64 = 0;
const DT_STRTAB: u64 = 5;
const DT_STRSZ: u64 = 10;
const DT_RPATH: u64 = 15;
const DT_RUNPATH: u64 = 29;

pub(crate) const MAGIC: &[u8; 4] = b"\x7fELF";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElfField {
    Interpreter,
    Rpath,
    Runpath,
}

#[derive(Clone, Copy)]
struct Reader<'a> {
    data: &'a [u8],
    wide: bool,
    big_endian: bool,
}

impl Reader<'_> {
    fn bytes<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        let end = offset.checked_add(N)?;
        self.data.get(offset..end)?.try_into().ok()
    }

    fn u16(&self, offset: usize) -> Option<u16> {
        let raw = self.bytes::<2>(offset)?;
        Some(if self.big_endian {
            u16::from_be_bytes(raw)
        } else {
            u16::from_le_bytes(raw)
        })
    }

    fn u32(&self, offset: usize) -> Option<u32> {
        let raw = self.bytes::<4>(offset)?;
        Some(if self.big_endian {
            u32::from_be_bytes(raw)
        } else {
            u32::from_le_bytes(raw)
        })
    }

    fn u64(&self, offset: usize) -> Option<u64> {
        let raw = self.bytes::<8>(offset)?;
        Some(if self.big_endian {
            u64::from_be_bytes(raw)
        } else {
            u64::from_le_bytes(raw)
        })
    }

    /// Native word: 8 bytes for ELF64, 4 for ELF32.
    fn word(&self, offset: usize) -> Option<u64> {
        if self.wide {
            self.u64(offset)
        } else {
            self.u32(offset).map(u64::from)
        }
    }

    fn word_len(&self) -> usize {
        if self.wide {
            8
        } else {
            4
        }
    }

    /// NUL-terminated string starting at `offset`, bounded by `limit`.
    fn c_str(&self, offset: usize, limit: usize) -> Option<Range<usize>> {
        let limit = limit.min(self.data.len());
        let tail = self.data.get(offset..limit)?;
        let len = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        Some(offset..offset + len)
    }
}

struct ProgramHeader {
    kind: u32,
    offset: u64,
    vaddr: u64,
    filesz: u64,
}

fn program_headers(reader: &Reader<'_>) -> Option<Vec<ProgramHeader>> {
    let (phoff, phentsize, phnum) = if reader.wide {
        (reader.u64(0x20)?, reader.u16(0x36)?, reader.u16(0x38)?)
    } else {
        (
            u64::from(reader.u32(0x1c)?),
            reader.u16(0x2a)?,
            reader.u16(0x2c)?,
        )
    };
    let phoff = usize::try_from(phoff).ok()?;
    let mut headers = Vec::with_capacity(usize::from(phnum));
    for idx in 0..usize::from(phnum) {
        let base = phoff.checked_add(idx.checked_mul(usize::from(phentsize))?)?;
        let header = if reader.wide {
            ProgramHeader {
                kind: reader.u32(base)?,
                offset: reader.u64(base + 8)?,
                vaddr: reader.u64(base + 16)?,
                filesz: reader.u64(base + 32)?,
            }
        } else {
            ProgramHeader {
                kind: reader.u32(base)?,
                offset: u64::from(reader.u32(base + 4)?),
                vaddr: u64::from(reader.u32(base + 8)?),
                filesz: u64::from(reader.u32(base + 16)?),
            }
        };
        headers.push(header);
    }
    Some(headers)
}

fn vaddr_to_offset(headers: &[ProgramHeader], vaddr: u64) -> Option<usize> {
    headers
        .iter()
        .filter(|header| header.kind == PT_LOAD)
        .find(|header| vaddr >= header.vaddr && vaddr - header.vaddr < header.filesz)
        .and_then(|header| usize::try_from(vaddr - header.vaddr + header.offset).ok())
}

/// Byte ranges of the interpreter and library search path strings.
///
/// Returns `None` when `data` is not a well-formed ELF file; a file that parses
/// but has no such strings yields an empty list.
pub(crate) fn search_path_fields(data: &[u8]) -> Option<Vec<(ElfField, Range<usize>)>> {
    if !data.starts_with(MAGIC) {
        return None;
    }
    let wide = match data.get(4)? {
        1 => false,
        2 => true,
        _ => return None,
    };
    let big_endian = match data.get(5)? {
        1 => false,
        2 => true,
        _ => return None,
    };
    let reader = Reader {
        data,
        wide,
        big_endian,
    };
    let headers = program_headers(&reader)?;
    let mut fields = Vec::new();

    for header in headers.iter().filter(|header| header.kind == PT_INTERP) {
        let start = usize::try_from(header.offset).ok()?;
        let limit = start.saturating_add(usize::try_from(header.filesz).ok()?);
        let range = reader.c_str(start, limit)?;
        if !range.is_empty() {
            fields.push((ElfField::Interpreter, range));
        }
    }

    for header in headers.iter().filter(|header| header.kind == PT_DYNAMIC) {
        let start = usize::try_from(header.offset).ok()?;
        let size = usize::try_from(header.filesz).ok()?;
        let entry_len = reader.word_len() * 2;
        let mut strtab = None;
        let mut strsz = None;
        let mut paths = Vec::new();
        for idx in 0..size / entry_len {
            let base = start + idx * entry_len;
            let tag = reader.word(base)?;
            let value = reader.word(base + reader.word_len())?;
            match tag {
                DT_NULL => break,
                DT_STRTAB => strtab = Some(value),
                DT_STRSZ => strsz = Some(value),
                DT_RPATH => paths.push((ElfField::Rpath, value)),
                DT_RUNPATH => paths.push((ElfField::Runpath, value)),
                _ => {}
            }
        }
        if paths.is_empty() {
            continue;
        }
        let strtab = vaddr_to_offset(&headers, strtab?)?;
        let table_end = match strsz.and_then(|size| usize::try_from(size).ok()) {
            Some(size) => strtab.saturating_add(size),
            None => data.len(),
        };
        for (field, value) in paths {
            let start = strtab.checked_add(usize::try_from(value).ok()?)?;
            let range = reader.c_str(start, table_end)?;
            if !range.is_empty() {
                fields.push((field, range));
            }
        }
    }
    Some(fields)
}

#[cfg(test)]
pub(crate) mod testing {
    /// Little-endian ELF64 with a `PT_INTERP` and a dynamic section whose
    /// `DT_RUNPATH` holds `runpath`.
    pub(crate) fn elf64_with(interp: &str, runpath: &str) -> Vec<u8> {
        const PHOFF: usize = 64;
        const PHENT: usize = 56;
        let interp_off = PHOFF + 3 * PHENT;
        let interp_len = interp.len() + 1;
        let dyn_off = (interp_off + interp_len).next_multiple_of(8);
        let dyn_len = 4 * 16;
        let strtab_off = dyn_off + dyn_len;
        let mut strtab = vec![0u8];
        let runpath_idx = strtab.len();
        strtab.extend_from_slice(runpath.as_bytes());
        strtab.push(0);
        let total = strtab_off + strtab.len();

        let mut out = vec![0u8; total];
        out[..4].copy_from_slice(b"\x7fELF");
        out[4] = 2;
        out[5] = 1;
        out[6] = 1;
        out[16..18].copy_from_slice(&3u16.to_le_bytes());
        out[0x20..0x28].copy_from_slice(&(PHOFF as u64).to_le_bytes());
        out[0x34..0x36].copy_from_slice(&64u16.to_le_bytes());
        out[0x36..0x38].copy_from_slice(&(PHENT as u16).to_le_bytes());
        out[0x38..0x3a].copy_from_slice(&3u16.to_le_bytes());

        let mut phdr = |idx: usize, kind: u32, offset: usize, size: usize| {
            let base = PHOFF + idx * PHENT;
            out[base..base + 4].copy_from_slice(&kind.to_le_bytes());
            out[base + 8..base + 16].copy_from_slice(&(offset as u64).to_le_bytes());
            out[base + 16..base + 24].copy_from_slice(&(offset as u64).to_le_bytes());
            out[base + 32..base + 40].copy_from_slice(&(size as u64).to_le_bytes());
            out[base + 40..base + 48].copy_from_slice(&(size as u64).to_le_bytes());
        };
        phdr(0, 1, 0, total);
        phdr(1, 3, interp_off, interp_len);
        phdr(2, 2, dyn_off, dyn_len);

        out[interp_off..interp_off + interp.len()].copy_from_slice(interp.as_bytes());
        let dyn_entries: [(u64, u64); 4] = [
            (5, strtab_off as u64),
            (10, strtab.len() as u64),
            (29, runpath_idx as u64),
            (0, 0),
        ];
        for (idx, (tag, value)) in dyn_entries.iter().enumerate() {
            let base = dyn_off + idx * 16;
            out[base..base + 8].copy_from_slice(&tag.to_le_bytes());
            out[base + 8..base + 16].copy_from_slice(&value.to_le_bytes());
        }
        out[strtab_off..].copy_from_slice(&strtab);
        out
    }
}
