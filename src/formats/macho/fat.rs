//! Fat (universal) archive headers
//!
//! Fat headers are big-endian regardless of the slices they contain.

use serde::Serialize;

use crate::formats::macho::header::CpuType;
use crate::formats::macho::types::*;
use crate::formats::macho::utils::EndianRead;

const FAT_HEADER_SIZE: usize = 8;
const FAT_ARCH_SIZE: usize = 20;
const FAT_ARCH_64_SIZE: usize = 32;

/// One architecture slice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FatArch {
    pub cputype: u32,
    pub cpusubtype: u32,
    pub offset: u64,
    pub size: u64,
    /// Alignment as a power of two
    pub align: u32,
}

impl FatArch {
    pub fn cpu_type(&self) -> CpuType {
        CpuType::from(self.cputype)
    }
}

/// A parsed fat archive; choosing a slice is left to the caller
#[derive(Debug, Clone)]
pub struct FatArchive<'data> {
    data: &'data [u8],
    is_64: bool,
    arches: Vec<FatArch>,
}

/// Whether `data` starts with a fat magic
pub fn is_fat(data: &[u8]) -> bool {
    matches!(
        data.read_u32(0, Endianness::Big),
        Ok(FAT_MAGIC) | Ok(FAT_MAGIC_64)
    )
}

impl<'data> FatArchive<'data> {
    pub fn parse(data: &'data [u8]) -> Result<Self> {
        let magic = data.read_u32(0, Endianness::Big)?;
        let is_64 = match magic {
            FAT_MAGIC => false,
            FAT_MAGIC_64 => true,
            other => return Err(MachOError::InvalidMagic(other)),
        };
        let count = data.read_u32(4, Endianness::Big)? as usize;
        let entry_size = if is_64 { FAT_ARCH_64_SIZE } else { FAT_ARCH_SIZE };
        let table_len = count
            .checked_mul(entry_size)
            .and_then(|n| n.checked_add(FAT_HEADER_SIZE))
            .filter(|&end| end <= data.len())
            .ok_or(MachOError::Truncated {
                offset: FAT_HEADER_SIZE,
                needed: count.saturating_mul(entry_size),
            })?;

        let mut arches: Vec<FatArch> = Vec::with_capacity(count);
        for index in 0..count {
            let at = FAT_HEADER_SIZE + index * entry_size;
            let arch = if is_64 {
                FatArch {
                    cputype: data.read_u32(at, Endianness::Big)?,
                    cpusubtype: data.read_u32(at + 4, Endianness::Big)?,
                    offset: data.read_u64(at + 8, Endianness::Big)?,
                    size: data.read_u64(at + 16, Endianness::Big)?,
                    align: data.read_u32(at + 24, Endianness::Big)?,
                }
            } else {
                FatArch {
                    cputype: data.read_u32(at, Endianness::Big)?,
                    cpusubtype: data.read_u32(at + 4, Endianness::Big)?,
                    offset: u64::from(data.read_u32(at + 8, Endianness::Big)?),
                    size: u64::from(data.read_u32(at + 12, Endianness::Big)?),
                    align: data.read_u32(at + 16, Endianness::Big)?,
                }
            };
            validate_arch(index, &arch, table_len as u64, data.len() as u64, &arches)?;
            arches.push(arch);
        }

        Ok(Self {
            data,
            is_64,
            arches,
        })
    }

    pub fn is_64(&self) -> bool {
        self.is_64
    }

    pub fn arches(&self) -> &[FatArch] {
        &self.arches
    }

    /// Bytes of one slice; bounds were checked at parse time
    pub fn slice_data(&self, arch: &FatArch) -> Result<&'data [u8]> {
        let invalid = MachOError::Truncated {
            offset: arch.offset as usize,
            needed: arch.size as usize,
        };
        let start = usize::try_from(arch.offset).map_err(|_| invalid.clone())?;
        let size = usize::try_from(arch.size).map_err(|_| invalid.clone())?;
        start
            .checked_add(size)
            .and_then(|end| self.data.get(start..end))
            .ok_or(invalid)
    }

    /// Slice bytes for every architecture, in header order
    pub fn slices(&self) -> impl Iterator<Item = (FatArch, Result<&'data [u8]>)> + '_ {
        self.arches.iter().map(move |arch| (*arch, self.slice_data(arch)))
    }
}

fn validate_arch(
    index: usize,
    arch: &FatArch,
    table_end: u64,
    file_len: u64,
    previous: &[FatArch],
) -> Result<()> {
    let invalid = |reason| MachOError::InvalidFatArch { index, reason };
    let end = arch
        .offset
        .checked_add(arch.size)
        .ok_or(invalid("slice range wraps"))?;
    if end > file_len {
        return Err(invalid("slice past end of file"));
    }
    if arch.size > 0 && arch.offset < table_end {
        return Err(invalid("slice overlaps the arch table"));
    }
    if arch.align > 15 {
        return Err(invalid("alignment too large"));
    }
    if arch.offset % (1u64 << arch.align) != 0 {
        return Err(invalid("slice misaligned"));
    }
    let overlaps = previous.iter().any(|other| {
        arch.size > 0 && other.size > 0 && arch.offset < other.offset + other.size && other.offset < end
    });
    if overlaps {
        return Err(invalid("slice overlaps another slice"));
    }
    Ok(())
}
