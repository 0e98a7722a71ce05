//! Mach-O header parsing

use crate::formats::macho::types::*;
use crate::formats::macho::utils::EndianRead;

const CPU_ARCH_ABI64: u32 = 0x0100_0000;
const CPU_ARCH_ABI64_32: u32 = 0x0200_0000;

/// CPU architecture named by `cputype`
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum CpuType {
    X86,
    X86_64,
    Arm,
    Arm64,
    Arm64_32,
    PowerPC,
    PowerPC64,
    Other(u32),
}

impl From<u32> for CpuType {
    fn from(val: u32) -> Self {
        match val {
            7 => CpuType::X86,
            v if v == 7 | CPU_ARCH_ABI64 => CpuType::X86_64,
            12 => CpuType::Arm,
            v if v == 12 | CPU_ARCH_ABI64 => CpuType::Arm64,
            v if v == 12 | CPU_ARCH_ABI64_32 => CpuType::Arm64_32,
            18 => CpuType::PowerPC,
            v if v == 18 | CPU_ARCH_ABI64 => CpuType::PowerPC64,
            other => CpuType::Other(other),
        }
    }
}

/// Mach-O file type
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum FileType {
    Object,
    Execute,
    FvmLib,
    Core,
    Preload,
    Dylib,
    Dylinker,
    Bundle,
    DylibStub,
    Dsym,
    KextBundle,
    FileSet,
    Other(u32),
}

impl From<u32> for FileType {
    fn from(val: u32) -> Self {
        match val {
            0x1 => FileType::Object,
            0x2 => FileType::Execute,
            0x3 => FileType::FvmLib,
            0x4 => FileType::Core,
            0x5 => FileType::Preload,
            0x6 => FileType::Dylib,
            0x7 => FileType::Dylinker,
            0x8 => FileType::Bundle,
            0x9 => FileType::DylibStub,
            0xa => FileType::Dsym,
            0xb => FileType::KextBundle,
            0xc => FileType::FileSet,
            other => FileType::Other(other),
        }
    }
}

/// Mach-O header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachHeader {
    pub magic: u32,
    pub endian: Endianness,
    pub width: PointerWidth,
    pub cputype: u32,
    pub cpusubtype: u32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
}

impl MachHeader {
    pub fn cpu_type(&self) -> CpuType {
        CpuType::from(self.cputype)
    }

    pub fn file_type(&self) -> FileType {
        FileType::from(self.filetype)
    }

    /// Size of the header itself; load commands start right after it
    pub fn size(&self) -> usize {
        match self.width {
            PointerWidth::Bits32 => 28,
            PointerWidth::Bits64 => 32,
        }
    }

    /// `MH_PIE`
    pub fn is_pie(&self) -> bool {
        self.flags & 0x0020_0000 != 0
    }
}

/// Determine byte order and pointer width from the first four bytes
pub fn parse_magic(data: &[u8]) -> Result<(u32, Endianness, PointerWidth)> {
    let raw = data.read_u32(0, Endianness::Little)?;
    match raw {
        MH_MAGIC => Ok((raw, Endianness::Little, PointerWidth::Bits32)),
        MH_MAGIC_64 => Ok((raw, Endianness::Little, PointerWidth::Bits64)),
        MH_CIGAM => Ok((raw, Endianness::Big, PointerWidth::Bits32)),
        MH_CIGAM_64 => Ok((raw, Endianness::Big, PointerWidth::Bits64)),
        other => Err(MachOError::InvalidMagic(other)),
    }
}

/// Parse Mach-O header
pub fn parse_header(data: &[u8]) -> Result<MachHeader> {
    let (magic, endian, width) = parse_magic(data)?;

    let header_size = match width {
        PointerWidth::Bits32 => 28,
        PointerWidth::Bits64 => 32,
    };
    if data.len() < header_size {
        return Err(MachOError::Truncated {
            offset: 0,
            needed: header_size,
        });
    }

    Ok(MachHeader {
        magic,
        endian,
        width,
        cputype: data.read_u32(4, endian)?,
        cpusubtype: data.read_u32(8, endian)?,
        filetype: data.read_u32(12, endian)?,
        ncmds: data.read_u32(16, endian)?,
        sizeofcmds: data.read_u32(20, endian)?,
        flags: data.read_u32(24, endian)?,
    })
}
