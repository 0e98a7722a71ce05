//! Load command decoding

use crate::formats::macho::header::MachHeader;
use crate::formats::macho::types::*;
use crate::formats::macho::utils::{read_addr, read_cstring, read_fixed_name, EndianRead};

/// A load command as laid out in the file, before decoding its body
#[derive(Debug, Clone, Copy)]
pub struct RawLoadCommand<'a> {
    /// File offset of the command
    pub offset: usize,
    pub cmd: u32,
    pub cmdsize: u32,
    /// The whole command, header included
    pub data: &'a [u8],
}

/// Bounded walk over the `ncmds` load commands inside `sizeofcmds`
pub struct LoadCommandIter<'a> {
    data: &'a [u8],
    endian: Endianness,
    pos: usize,
    end: usize,
    remaining: u32,
    failed: bool,
}

impl<'a> LoadCommandIter<'a> {
    pub fn new(data: &'a [u8], header: &MachHeader) -> Result<Self> {
        let start = header.size();
        let end = start
            .checked_add(header.sizeofcmds as usize)
            .filter(|&end| end <= data.len())
            .ok_or(MachOError::Truncated {
                offset: start,
                needed: header.sizeofcmds as usize,
            })?;
        Ok(Self {
            data,
            endian: header.endian,
            pos: start,
            end,
            remaining: header.ncmds,
            failed: false,
        })
    }

    fn read_command(&self, offset: usize) -> Result<RawLoadCommand<'a>> {
        let data = self.data;
        if offset + 8 > self.end {
            return Err(MachOError::InvalidLoadCommand {
                offset,
                reason: "command header past sizeofcmds",
            });
        }
        let cmd = data.read_u32(offset, self.endian)?;
        let cmdsize = data.read_u32(offset + 4, self.endian)?;
        if cmdsize < 8 {
            return Err(MachOError::InvalidLoadCommand {
                offset,
                reason: "cmdsize smaller than header",
            });
        }
        let cmd_end = offset
            .checked_add(cmdsize as usize)
            .filter(|&e| e <= self.end)
            .ok_or(MachOError::InvalidLoadCommand {
                offset,
                reason: "cmdsize past sizeofcmds",
            })?;
        Ok(RawLoadCommand {
            offset,
            cmd,
            cmdsize,
            data: &data[offset..cmd_end],
        })
    }
}

impl<'a> Iterator for LoadCommandIter<'a> {
    type Item = Result<RawLoadCommand<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let offset = self.pos;
        let parsed = self.read_command(offset);

        match parsed {
            Ok(raw) => {
                self.pos = offset + raw.cmdsize as usize;
                Some(Ok(raw))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// `LC_SEGMENT`/`LC_SEGMENT_64` fields, undecorated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentCommand {
    pub segname: String,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: u32,
    pub initprot: u32,
    pub nsects: u32,
    pub flags: u32,
    pub sections: Vec<SectionHeader>,
}

/// `section`/`section_64` fields, undecorated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionHeader {
    pub sectname: String,
    pub segname: String,
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
}

/// Which dylib-referencing command a [`DylibCommand`] came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum DylibKind {
    Load,
    Weak,
    Reexport,
    Upward,
    Lazy,
    Id,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DylibCommand {
    pub kind: DylibKind,
    pub name: String,
    pub timestamp: u32,
    pub current_version: u32,
    pub compatibility_version: u32,
}

/// A decoded load command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadCommand<'a> {
    Segment(SegmentCommand),
    DyldInfo(DyldInfo),
    Dylib(DylibCommand),
    Symtab {
        symoff: u32,
        nsyms: u32,
        stroff: u32,
        strsize: u32,
    },
    Dysymtab {
        ilocalsym: u32,
        nlocalsym: u32,
        iextdefsym: u32,
        nextdefsym: u32,
        iundefsym: u32,
        nundefsym: u32,
    },
    Uuid([u8; 16]),
    Main {
        entryoff: u64,
        stacksize: u64,
    },
    Rpath(String),
    Other {
        cmd: u32,
        data: &'a [u8],
    },
}

fn require(raw: &RawLoadCommand<'_>, min: usize) -> Result<()> {
    if raw.data.len() < min {
        return Err(MachOError::InvalidLoadCommand {
            offset: raw.offset,
            reason: "cmdsize too small for command",
        });
    }
    Ok(())
}

/// Resolve an `lc_str` offset to the string it names inside the command
fn lc_str(raw: &RawLoadCommand<'_>, field: usize, endian: Endianness) -> Result<String> {
    let name_off = raw.data.read_u32(field, endian)? as usize;
    read_cstring(raw.data, name_off, raw.data.len())
        .map(str::to_owned)
        .map_err(|_| MachOError::InvalidLoadCommand {
            offset: raw.offset,
            reason: "bad string in command",
        })
}

impl<'a> LoadCommand<'a> {
    /// Decode the body of a raw load command
    pub fn parse(raw: &RawLoadCommand<'a>, endian: Endianness) -> Result<Self> {
        let d = raw.data;
        match raw.cmd {
            LC_SEGMENT => parse_segment(raw, endian, PointerWidth::Bits32).map(Self::Segment),
            LC_SEGMENT_64 => parse_segment(raw, endian, PointerWidth::Bits64).map(Self::Segment),
            LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                require(raw, 48)?;
                Ok(Self::DyldInfo(DyldInfo {
                    rebase_off: d.read_u32(8, endian)?,
                    rebase_size: d.read_u32(12, endian)?,
                    bind_off: d.read_u32(16, endian)?,
                    bind_size: d.read_u32(20, endian)?,
                    weak_bind_off: d.read_u32(24, endian)?,
                    weak_bind_size: d.read_u32(28, endian)?,
                    lazy_bind_off: d.read_u32(32, endian)?,
                    lazy_bind_size: d.read_u32(36, endian)?,
                    export_off: d.read_u32(40, endian)?,
                    export_size: d.read_u32(44, endian)?,
                }))
            }
            LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB | LC_LOAD_UPWARD_DYLIB
            | LC_LAZY_LOAD_DYLIB | LC_ID_DYLIB => {
                require(raw, 24)?;
                let kind = match raw.cmd {
                    LC_LOAD_WEAK_DYLIB => DylibKind::Weak,
                    LC_REEXPORT_DYLIB => DylibKind::Reexport,
                    LC_LOAD_UPWARD_DYLIB => DylibKind::Upward,
                    LC_LAZY_LOAD_DYLIB => DylibKind::Lazy,
                    LC_ID_DYLIB => DylibKind::Id,
                    _ => DylibKind::Load,
                };
                Ok(Self::Dylib(DylibCommand {
                    kind,
                    name: lc_str(raw, 8, endian)?,
                    timestamp: d.read_u32(12, endian)?,
                    current_version: d.read_u32(16, endian)?,
                    compatibility_version: d.read_u32(20, endian)?,
                }))
            }
            LC_SYMTAB => {
                require(raw, 24)?;
                Ok(Self::Symtab {
                    symoff: d.read_u32(8, endian)?,
                    nsyms: d.read_u32(12, endian)?,
                    stroff: d.read_u32(16, endian)?,
                    strsize: d.read_u32(20, endian)?,
                })
            }
            LC_DYSYMTAB => {
                require(raw, 32)?;
                Ok(Self::Dysymtab {
                    ilocalsym: d.read_u32(8, endian)?,
                    nlocalsym: d.read_u32(12, endian)?,
                    iextdefsym: d.read_u32(16, endian)?,
                    nextdefsym: d.read_u32(20, endian)?,
                    iundefsym: d.read_u32(24, endian)?,
                    nundefsym: d.read_u32(28, endian)?,
                })
            }
            LC_UUID => {
                require(raw, 24)?;
                let mut uuid = [0u8; 16];
                uuid.copy_from_slice(&d[8..24]);
                Ok(Self::Uuid(uuid))
            }
            LC_MAIN => {
                require(raw, 24)?;
                Ok(Self::Main {
                    entryoff: d.read_u64(8, endian)?,
                    stacksize: d.read_u64(16, endian)?,
                })
            }
            LC_RPATH => {
                require(raw, 12)?;
                Ok(Self::Rpath(lc_str(raw, 8, endian)?))
            }
            cmd => Ok(Self::Other { cmd, data: d }),
        }
    }
}

fn parse_segment(
    raw: &RawLoadCommand<'_>,
    endian: Endianness,
    width: PointerWidth,
) -> Result<SegmentCommand> {
    let d = raw.data;
    let (header_size, section_size) = match width {
        PointerWidth::Bits32 => (56usize, 68usize),
        PointerWidth::Bits64 => (72usize, 80usize),
    };
    require(raw, header_size)?;

    let word = width.bytes() as usize;
    let segname = read_fixed_name(d, 8)?;
    let vmaddr = read_addr(d, 24, width, endian)?;
    let vmsize = read_addr(d, 24 + word, width, endian)?;
    let fileoff = read_addr(d, 24 + 2 * word, width, endian)?;
    let filesize = read_addr(d, 24 + 3 * word, width, endian)?;
    let tail = 24 + 4 * word;
    let maxprot = d.read_u32(tail, endian)?;
    let initprot = d.read_u32(tail + 4, endian)?;
    let nsects = d.read_u32(tail + 8, endian)?;
    let flags = d.read_u32(tail + 12, endian)?;

    let needed = (nsects as usize)
        .checked_mul(section_size)
        .and_then(|n| n.checked_add(header_size));
    if needed.map_or(true, |n| n > d.len()) {
        return Err(MachOError::InvalidLoadCommand {
            offset: raw.offset,
            reason: "section headers past cmdsize",
        });
    }

    let mut sections = Vec::with_capacity(nsects as usize);
    for i in 0..nsects as usize {
        let base = header_size + i * section_size;
        let sectname = read_fixed_name(d, base)?;
        let sect_segname = read_fixed_name(d, base + 16)?;
        let addr = read_addr(d, base + 32, width, endian)?;
        let size = read_addr(d, base + 32 + word, width, endian)?;
        let rest = base + 32 + 2 * word;
        sections.push(SectionHeader {
            sectname,
            segname: sect_segname,
            addr,
            size,
            offset: d.read_u32(rest, endian)?,
            align: d.read_u32(rest + 4, endian)?,
            reloff: d.read_u32(rest + 8, endian)?,
            nreloc: d.read_u32(rest + 12, endian)?,
            flags: d.read_u32(rest + 16, endian)?,
            reserved1: d.read_u32(rest + 20, endian)?,
            reserved2: d.read_u32(rest + 24, endian)?,
        });
    }

    Ok(SegmentCommand {
        segname,
        vmaddr,
        vmsize,
        fileoff,
        filesize,
        maxprot,
        initprot,
        nsects,
        flags,
        sections,
    })
}
