//! Core Mach-O types and constants

use thiserror::Error;

/// Mach-O parsing and decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MachOError {
    #[error("Invalid Mach-O magic: {0:#010x}")]
    InvalidMagic(u32),
    #[error("Truncated at {offset:#x}, needed {needed} bytes")]
    Truncated { offset: usize, needed: usize },
    #[error("Invalid load command at {offset:#x}: {reason}")]
    InvalidLoadCommand { offset: usize, reason: &'static str },
    #[error("String not UTF-8 at {offset:#x}")]
    InvalidString { offset: usize },
    #[error("Unterminated string at {offset:#x}")]
    UnterminatedString { offset: usize },

    #[error("Invalid segment {index}: {reason}")]
    InvalidSegment { index: usize, reason: &'static str },
    #[error("Invalid section {section} of segment {segment}: {reason}")]
    InvalidSection {
        segment: usize,
        section: usize,
        reason: &'static str,
    },
    #[error("Segments {first} and {second} overlap")]
    OverlappingSegments { first: usize, second: usize },
    #[error("Sections {first} and {second} of segment {segment} overlap")]
    OverlappingSections {
        segment: usize,
        first: usize,
        second: usize,
    },
    #[error("Segment index {index} out of bounds ({count} segments)")]
    SegmentIndexOutOfBounds { index: usize, count: usize },
    #[error("Offset {offset:#x} out of bounds for segment {segment}")]
    OffsetOutOfBounds { segment: usize, offset: u64 },
    #[error("Address {address:#x} is not backed by the image")]
    AddressOutOfBounds { address: u64 },

    #[error("Invalid ULEB128 at {offset:#x}")]
    InvalidUleb128 { offset: usize },
    #[error("Invalid SLEB128 at {offset:#x}")]
    InvalidSleb128 { offset: usize },

    #[error("Invalid export terminal at {offset:#x}: {reason}")]
    InvalidTerminal { offset: usize, reason: &'static str },
    #[error("Export trie node at {offset:#x} overlaps a visited node or leaves the trie")]
    OverlappingRanges { offset: usize },
    #[error("Export at {offset:#x} has an empty name")]
    EmptyExport { offset: usize },
    #[error("Export trie deeper than {limit} at {offset:#x}")]
    TooDeep { offset: usize, limit: usize },

    #[error("Segment index {index} at {offset:#x} out of bounds ({count} segments)")]
    InvalidSegmentIndex {
        offset: usize,
        index: u8,
        count: usize,
    },
    #[error("Segment address out of bounds at {offset:#x}")]
    OutOfBoundsSegmentAddr { offset: usize },
    #[error("Unrecognized bind opcode {opcode:#04x} at {offset:#x}")]
    UnrecognizedBindOpcode { offset: usize, opcode: u8 },
    #[error("Unrecognized threaded bind sub-opcode {sub_opcode} at {offset:#x}")]
    UnrecognizedBindSubOpcode { offset: usize, sub_opcode: u8 },
    #[error("Unrecognized rebase opcode {opcode:#04x} at {offset:#x}")]
    UnrecognizedRebaseOpcode { offset: usize, opcode: u8 },
    #[error("Unrecognized bind write kind {kind} at {offset:#x}")]
    UnrecognizedBindWriteKind { offset: usize, kind: u8 },
    #[error("Unrecognized rebase write kind {kind} at {offset:#x}")]
    UnrecognizedRebaseWriteKind { offset: usize, kind: u8 },
    #[error("Unrecognized special dylib ordinal {immediate:#x} at {offset:#x}")]
    UnrecognizedSpecialOrdinal { offset: usize, immediate: u8 },
    #[error("Bind at {offset:#x} without a dylib ordinal")]
    NoDylibOrdinal { offset: usize },
    #[error("Action at {offset:#x} without a segment index")]
    NoSegmentIndex { offset: usize },
    #[error("Action at {offset:#x} without a write kind")]
    NoWriteKind { offset: usize },
    #[error("Empty bind symbol at {offset:#x}")]
    EmptySymbol { offset: usize },
    #[error("Multiple binds for address {address:#x}")]
    MultipleBindsForAddress { address: u64 },
    #[error("Trailing bytes after DONE at {offset:#x}")]
    TrailingBytes { offset: usize },
    #[error("Bind stream ends at {offset:#x} without DONE")]
    MissingDone { offset: usize },
    #[error("Threaded bind ordinal {index} at {offset:#x} outside table of {table_len}")]
    InvalidThreadedOrdinal {
        offset: usize,
        index: u64,
        table_len: usize,
    },
    #[error("Action limit of {limit} exceeded")]
    ActionLimitExceeded { limit: usize },

    #[error("Invalid fat arch {index}: {reason}")]
    InvalidFatArch { index: usize, reason: &'static str },
}

pub type Result<T> = std::result::Result<T, MachOError>;

/// Mach-O magic numbers, as read in the file's own byte order
pub const MH_MAGIC: u32 = 0xfeedface;
pub const MH_CIGAM: u32 = 0xcefaedfe;
pub const MH_MAGIC_64: u32 = 0xfeedfacf;
pub const MH_CIGAM_64: u32 = 0xcffaedfe;

/// Fat header magic numbers (always big-endian on disk)
pub const FAT_MAGIC: u32 = 0xcafebabe;
pub const FAT_MAGIC_64: u32 = 0xcafebabf;

/// Load command identifiers
pub const LC_REQ_DYLD: u32 = 0x8000_0000;
pub const LC_SEGMENT: u32 = 0x1;
pub const LC_SYMTAB: u32 = 0x2;
pub const LC_DYSYMTAB: u32 = 0xb;
pub const LC_LOAD_DYLIB: u32 = 0xc;
pub const LC_ID_DYLIB: u32 = 0xd;
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_UUID: u32 = 0x1b;
pub const LC_RPATH: u32 = 0x1c | LC_REQ_DYLD;
pub const LC_REEXPORT_DYLIB: u32 = 0x1f | LC_REQ_DYLD;
pub const LC_LAZY_LOAD_DYLIB: u32 = 0x20;
pub const LC_DYLD_INFO: u32 = 0x22;
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
pub const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | LC_REQ_DYLD;
pub const LC_MAIN: u32 = 0x28 | LC_REQ_DYLD;

/// Section type mask and attribute mask for `flags`
pub const SECTION_TYPE: u32 = 0x0000_00ff;
pub const SECTION_ATTRIBUTES: u32 = 0xffff_ff00;

/// Rebase opcodes
pub const REBASE_OPCODE_MASK: u8 = 0xF0;
pub const REBASE_IMMEDIATE_MASK: u8 = 0x0F;
pub const REBASE_OPCODE_DONE: u8 = 0x00;
pub const REBASE_OPCODE_SET_TYPE_IMM: u8 = 0x10;
pub const REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x20;
pub const REBASE_OPCODE_ADD_ADDR_ULEB: u8 = 0x30;
pub const REBASE_OPCODE_ADD_ADDR_IMM_SCALED: u8 = 0x40;
pub const REBASE_OPCODE_DO_REBASE_IMM_TIMES: u8 = 0x50;
pub const REBASE_OPCODE_DO_REBASE_ULEB_TIMES: u8 = 0x60;
pub const REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB: u8 = 0x70;
pub const REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB: u8 = 0x80;

/// Bind opcodes
pub const BIND_OPCODE_MASK: u8 = 0xF0;
pub const BIND_IMMEDIATE_MASK: u8 = 0x0F;
pub const BIND_OPCODE_DONE: u8 = 0x00;
pub const BIND_OPCODE_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
pub const BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB: u8 = 0x20;
pub const BIND_OPCODE_SET_DYLIB_SPECIAL_IMM: u8 = 0x30;
pub const BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM: u8 = 0x40;
pub const BIND_OPCODE_SET_TYPE_IMM: u8 = 0x50;
pub const BIND_OPCODE_SET_ADDEND_SLEB: u8 = 0x60;
pub const BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
pub const BIND_OPCODE_ADD_ADDR_ULEB: u8 = 0x80;
pub const BIND_OPCODE_DO_BIND: u8 = 0x90;
pub const BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB: u8 = 0xA0;
pub const BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED: u8 = 0xB0;
pub const BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB: u8 = 0xC0;
pub const BIND_OPCODE_THREADED: u8 = 0xD0;
pub const BIND_SUBOPCODE_THREADED_SET_BIND_ORDINAL_TABLE_SIZE_ULEB: u8 = 0x00;
pub const BIND_SUBOPCODE_THREADED_APPLY: u8 = 0x01;

/// Write kinds shared by bind and rebase (`BIND_TYPE_*` / `REBASE_TYPE_*`)
pub const BIND_TYPE_POINTER: u8 = 1;
pub const BIND_TYPE_TEXT_ABSOLUTE32: u8 = 2;
pub const BIND_TYPE_TEXT_PCREL32: u8 = 3;

/// Special dylib ordinals
pub const BIND_SPECIAL_DYLIB_SELF: i64 = 0;
pub const BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE: i64 = -1;
pub const BIND_SPECIAL_DYLIB_FLAT_LOOKUP: i64 = -2;
pub const BIND_SPECIAL_DYLIB_WEAK_LOOKUP: i64 = -3;

/// Byte order of the image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Endianness {
    Little,
    Big,
}

/// Pointer width of the image, fixed by its magic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum PointerWidth {
    Bits32,
    Bits64,
}

impl PointerWidth {
    /// Size of a pointer slot in bytes
    pub fn bytes(&self) -> u64 {
        match self {
            PointerWidth::Bits32 => 4,
            PointerWidth::Bits64 => 8,
        }
    }

    /// Largest representable address
    pub fn max_address(&self) -> u64 {
        match self {
            PointerWidth::Bits32 => u32::MAX as u64,
            PointerWidth::Bits64 => u64::MAX,
        }
    }
}

/// How a bound or rebased slot is written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum WriteKind {
    Pointer,
    TextAbsolute32,
    TextPcRel32,
    /// Pointer-authenticated slot from a threaded bind chain
    AuthenticatedPointer,
}

impl WriteKind {
    /// Decode a `BIND_TYPE_*`/`REBASE_TYPE_*` immediate
    pub fn from_immediate(imm: u8) -> Option<Self> {
        match imm {
            BIND_TYPE_POINTER => Some(WriteKind::Pointer),
            BIND_TYPE_TEXT_ABSOLUTE32 => Some(WriteKind::TextAbsolute32),
            BIND_TYPE_TEXT_PCREL32 => Some(WriteKind::TextPcRel32),
            _ => None,
        }
    }
}

/// `LC_DYLD_INFO` byte ranges, as file offset and size
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DyldInfo {
    pub rebase_off: u32,
    pub rebase_size: u32,
    pub bind_off: u32,
    pub bind_size: u32,
    pub weak_bind_off: u32,
    pub weak_bind_size: u32,
    pub lazy_bind_off: u32,
    pub lazy_bind_size: u32,
    pub export_off: u32,
    pub export_size: u32,
}

/// The distinct bind streams of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum BindStreamKind {
    Normal,
    Lazy,
    Weak,
}

impl BindStreamKind {
    pub fn name(&self) -> &'static str {
        match self {
            BindStreamKind::Normal => "bind",
            BindStreamKind::Lazy => "lazy_bind",
            BindStreamKind::Weak => "weak_bind",
        }
    }
}
