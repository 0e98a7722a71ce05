//! Segment and section address space
//!
//! The bind, rebase and export decoders only ever name locations as
//! "segment index + offset" or as a VM address. [`SegmentCollection`]
//! turns both into absolute addresses or file offsets, refusing anything
//! outside the ranges the load commands declared.

use bitflags::bitflags;
use serde::Serialize;
use std::fmt;
use tracing::debug;

use crate::formats::macho::header::MachHeader;
use crate::formats::macho::load_commands::{
    LoadCommand, LoadCommandIter, SectionHeader, SegmentCommand,
};
use crate::formats::macho::types::*;

bitflags! {
    /// `vm_prot_t` protection bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmProt: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXECUTE = 0x4;
    }
}

impl fmt::Display for VmProt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut perms = String::new();
        perms.push(if self.contains(VmProt::READ) { 'r' } else { '-' });
        perms.push(if self.contains(VmProt::WRITE) { 'w' } else { '-' });
        perms.push(if self.contains(VmProt::EXECUTE) { 'x' } else { '-' });
        write!(f, "{}", perms)
    }
}

/// Half-open byte range `[begin, end)`, built only through overflow-checked constructors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ByteRange {
    begin: u64,
    end: u64,
}

impl ByteRange {
    /// `None` when `begin + size` wraps
    pub fn new(begin: u64, size: u64) -> Option<Self> {
        let end = begin.checked_add(size)?;
        Some(Self { begin, end })
    }

    pub fn empty_at(begin: u64) -> Self {
        Self { begin, end: begin }
    }

    pub fn begin(&self) -> u64 {
        self.begin
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn size(&self) -> u64 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.begin && addr < self.end
    }

    pub fn contains_range(&self, other: &ByteRange) -> bool {
        other.is_empty() || (other.begin >= self.begin && other.end <= self.end)
    }

    /// Empty ranges never overlap anything
    pub fn overlaps(&self, other: &ByteRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.begin < other.end && other.begin < self.end
    }
}

/// Section type, from the low byte of the section flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SectionKind {
    Regular,
    ZeroFill,
    CStringLiterals,
    FourByteLiterals,
    EightByteLiterals,
    LiteralPointers,
    NonLazySymbolPointers,
    LazySymbolPointers,
    SymbolStubs,
    ModInitFuncPointers,
    ModTermFuncPointers,
    Coalesced,
    GbZeroFill,
    Interposing,
    SixteenByteLiterals,
    DtraceDof,
    LazyDylibSymbolPointers,
    ThreadLocalRegular,
    ThreadLocalZeroFill,
    ThreadLocalVariables,
    ThreadLocalVariablePointers,
    ThreadLocalInitFunctionPointers,
    InitFuncOffsets,
}

impl SectionKind {
    pub fn from_flags(flags: u32) -> Option<Self> {
        Some(match flags & SECTION_TYPE {
            0x00 => SectionKind::Regular,
            0x01 => SectionKind::ZeroFill,
            0x02 => SectionKind::CStringLiterals,
            0x03 => SectionKind::FourByteLiterals,
            0x04 => SectionKind::EightByteLiterals,
            0x05 => SectionKind::LiteralPointers,
            0x06 => SectionKind::NonLazySymbolPointers,
            0x07 => SectionKind::LazySymbolPointers,
            0x08 => SectionKind::SymbolStubs,
            0x09 => SectionKind::ModInitFuncPointers,
            0x0a => SectionKind::ModTermFuncPointers,
            0x0b => SectionKind::Coalesced,
            0x0c => SectionKind::GbZeroFill,
            0x0d => SectionKind::Interposing,
            0x0e => SectionKind::SixteenByteLiterals,
            0x0f => SectionKind::DtraceDof,
            0x10 => SectionKind::LazyDylibSymbolPointers,
            0x11 => SectionKind::ThreadLocalRegular,
            0x12 => SectionKind::ThreadLocalZeroFill,
            0x13 => SectionKind::ThreadLocalVariables,
            0x14 => SectionKind::ThreadLocalVariablePointers,
            0x15 => SectionKind::ThreadLocalInitFunctionPointers,
            0x16 => SectionKind::InitFuncOffsets,
            _ => return None,
        })
    }

    /// Sections that occupy memory but no file bytes
    pub fn is_zero_fill(&self) -> bool {
        matches!(
            self,
            SectionKind::ZeroFill | SectionKind::GbZeroFill | SectionKind::ThreadLocalZeroFill
        )
    }
}

/// A validated section
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Section {
    pub name: String,
    /// Index of the owning segment in its [`SegmentCollection`]
    pub segment_index: usize,
    pub segment_name: String,
    pub file_range: ByteRange,
    pub memory_range: ByteRange,
    pub kind: SectionKind,
    /// Attribute bits of the section flags
    pub attributes: u32,
    pub align: u32,
    pub reserved1: u32,
    pub reserved2: u32,
}

/// A validated segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub name: String,
    pub file_range: ByteRange,
    pub memory_range: ByteRange,
    #[serde(skip)]
    pub max_prot: VmProt,
    #[serde(skip)]
    pub init_prot: VmProt,
    pub flags: u32,
    pub sections: Vec<Section>,
}

impl Segment {
    pub fn vmaddr(&self) -> u64 {
        self.memory_range.begin()
    }

    pub fn vmsize(&self) -> u64 {
        self.memory_range.size()
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Segment '{}' ({:#x}-{:#x}, {})",
            self.name,
            self.memory_range.begin(),
            self.memory_range.end(),
            self.init_prot
        )
    }
}

/// Construction failure plus the segments accepted before it
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error}")]
pub struct PartialSegments {
    pub segments: SegmentCollection,
    #[source]
    pub error: MachOError,
}

/// All segments of one image, validated once at construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentCollection {
    segments: Vec<Segment>,
    width: PointerWidth,
}

impl SegmentCollection {
    /// Build from the segment commands of an image of `image_len` bytes
    pub fn build<'c, I>(
        commands: I,
        width: PointerWidth,
        image_len: u64,
    ) -> std::result::Result<Self, PartialSegments>
    where
        I: IntoIterator<Item = &'c SegmentCommand>,
    {
        let mut collection = Self {
            segments: Vec::new(),
            width,
        };
        for command in commands {
            let index = collection.segments.len();
            match collection.validate_segment(index, command, image_len) {
                Ok(segment) => collection.segments.push(segment),
                Err(error) => {
                    debug!(index, %error, "rejecting segment");
                    return Err(PartialSegments {
                        segments: collection,
                        error,
                    });
                }
            }
        }
        debug!(count = collection.segments.len(), "built segment collection");
        Ok(collection)
    }

    /// Walk the load commands of an image and build its segments
    pub fn from_image(
        data: &[u8],
        header: &MachHeader,
    ) -> std::result::Result<Self, PartialSegments> {
        let empty = |error| PartialSegments {
            segments: Self {
                segments: Vec::new(),
                width: header.width,
            },
            error,
        };
        let mut commands = Vec::new();
        for raw in LoadCommandIter::new(data, header).map_err(empty)? {
            let raw = raw.map_err(empty)?;
            if raw.cmd == LC_SEGMENT || raw.cmd == LC_SEGMENT_64 {
                if let LoadCommand::Segment(seg) =
                    LoadCommand::parse(&raw, header.endian).map_err(empty)?
                {
                    commands.push(seg);
                }
            }
        }
        Self::build(&commands, header.width, data.len() as u64)
    }

    fn validate_segment(
        &self,
        index: usize,
        command: &SegmentCommand,
        image_len: u64,
    ) -> Result<Segment> {
        let invalid = |reason| MachOError::InvalidSegment { index, reason };

        let memory_range =
            ByteRange::new(command.vmaddr, command.vmsize).ok_or(invalid("memory range wraps"))?;
        if memory_range.end() > self.width.max_address().saturating_add(1) && command.vmsize > 0 {
            return Err(invalid("memory range exceeds address width"));
        }
        let file_range =
            ByteRange::new(command.fileoff, command.filesize).ok_or(invalid("file range wraps"))?;
        if command.filesize > command.vmsize {
            return Err(invalid("file size exceeds memory size"));
        }
        if file_range.end() > image_len {
            return Err(invalid("file range past end of image"));
        }

        for (other_index, other) in self.segments.iter().enumerate() {
            if other.file_range.overlaps(&file_range) || other.memory_range.overlaps(&memory_range)
            {
                return Err(MachOError::OverlappingSegments {
                    first: other_index,
                    second: index,
                });
            }
        }

        let mut sections: Vec<Section> = Vec::with_capacity(command.sections.len());
        for (section_index, header) in command.sections.iter().enumerate() {
            let section = validate_section(index, section_index, header, &command.segname)?;
            if !file_range.contains_range(&section.file_range)
                || !memory_range.contains_range(&section.memory_range)
            {
                return Err(MachOError::InvalidSection {
                    segment: index,
                    section: section_index,
                    reason: "section outside its segment",
                });
            }
            if let Some(first) = sections.iter().position(|s| {
                s.file_range.overlaps(&section.file_range)
                    || s.memory_range.overlaps(&section.memory_range)
            }) {
                return Err(MachOError::OverlappingSections {
                    segment: index,
                    first,
                    second: section_index,
                });
            }
            sections.push(section);
        }

        Ok(Segment {
            name: command.segname.clone(),
            file_range,
            memory_range,
            max_prot: VmProt::from_bits_truncate(command.maxprot),
            init_prot: VmProt::from_bits_truncate(command.initprot),
            flags: command.flags,
            sections,
        })
    }

    pub fn width(&self) -> PointerWidth {
        self.width
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }

    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.segments.iter().flat_map(|s| s.sections.iter())
    }

    /// Segment at a zero-based index
    pub fn segment_at(&self, index: usize) -> Option<&Segment> {
        self.segments.get(index)
    }

    pub fn by_name(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name == name)
    }

    /// Absolute address of `offset` bytes into segment `index`
    pub fn resolve(&self, index: usize, offset: u64) -> Result<u64> {
        let segment = self
            .segment_at(index)
            .ok_or(MachOError::SegmentIndexOutOfBounds {
                index,
                count: self.segments.len(),
            })?;
        let out_of_bounds = MachOError::OffsetOutOfBounds {
            segment: index,
            offset,
        };
        if offset >= segment.vmsize() {
            return Err(out_of_bounds);
        }
        segment
            .vmaddr()
            .checked_add(offset)
            .filter(|&addr| addr <= self.width.max_address())
            .ok_or(out_of_bounds)
    }

    pub fn segment_containing(&self, address: u64) -> Option<(usize, &Segment)> {
        self.segments
            .iter()
            .enumerate()
            .find(|(_, s)| s.memory_range.contains(address))
    }

    pub fn section_containing(&self, address: u64) -> Option<&Section> {
        self.segment_containing(address)?
            .1
            .sections
            .iter()
            .find(|s| s.memory_range.contains(address))
    }

    /// File offset backing a VM address; zero-fill tails have none
    pub fn file_location(&self, address: u64) -> Result<u64> {
        let out_of_bounds = MachOError::AddressOutOfBounds { address };
        let (_, segment) = self.segment_containing(address).ok_or(out_of_bounds.clone())?;

        let (memory, file) = match segment
            .sections
            .iter()
            .find(|s| s.memory_range.contains(address))
        {
            Some(section) => (section.memory_range, section.file_range),
            None => (segment.memory_range, segment.file_range),
        };

        let delta = address - memory.begin();
        if delta >= file.size() {
            return Err(out_of_bounds);
        }
        Ok(file.begin() + delta)
    }
}

fn validate_section(
    segment: usize,
    section: usize,
    header: &SectionHeader,
    segname: &str,
) -> Result<Section> {
    let invalid = |reason| MachOError::InvalidSection {
        segment,
        section,
        reason,
    };

    let kind = SectionKind::from_flags(header.flags).ok_or(invalid("unknown section type"))?;
    let memory_range =
        ByteRange::new(header.addr, header.size).ok_or(invalid("memory range wraps"))?;
    let file_range = if kind.is_zero_fill() {
        ByteRange::empty_at(u64::from(header.offset))
    } else {
        ByteRange::new(u64::from(header.offset), header.size)
            .ok_or(invalid("file range wraps"))?
    };

    Ok(Section {
        name: header.sectname.clone(),
        segment_index: segment,
        segment_name: segname.to_string(),
        file_range,
        memory_range,
        kind,
        attributes: header.flags & SECTION_ATTRIBUTES,
        align: header.align,
        reserved1: header.reserved1,
        reserved2: header.reserved2,
    })
}
