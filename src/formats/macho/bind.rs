//! Bind opcode interpreter
//!
//! Each byte's high nibble selects an opcode and the low nibble carries an
//! immediate. The interpreter keeps its registers in an
//! [`InterpreterState`] and yields one [`BindAction`] per executed "do bind",
//! resolving every slot through the image's [`SegmentCollection`].

use bitflags::bitflags;
use serde::Serialize;
use std::iter::FusedIterator;
use tracing::{debug, trace};

use crate::formats::macho::opcodes::{Action, InterpreterState, Repeat};
use crate::formats::macho::segments::SegmentCollection;
use crate::formats::macho::types::*;
use crate::formats::macho::utils::{ByteCursor, EndianRead};

const THREADED_BIND: u64 = 1 << 62;
const THREADED_AUTH: u64 = 1 << 63;
const THREADED_DELTA_SHIFT: u32 = 51;
const THREADED_DELTA_MASK: u64 = 0x7ff;
const THREADED_ORDINAL_MASK: u64 = 0xffff;
const THREADED_STRIDE: u64 = 8;

/// Cap on the pre-allocated threaded ordinal table
const MAX_TABLE_RESERVE: u64 = 1 << 16;

bitflags! {
    /// Flags from `SET_SYMBOL_TRAILING_FLAGS_IMM`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BindSymbolFlags: u8 {
        const WEAK_IMPORT = 0x1;
        const NON_WEAK_DEFINITION = 0x8;
    }
}

impl Serialize for BindSymbolFlags {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.bits())
    }
}

/// One bind instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindAction {
    pub segment_index: usize,
    pub segment_offset: u64,
    pub address: u64,
    pub symbol: String,
    /// Library ordinal; non-positive values are the special lookups
    pub ordinal: i64,
    pub kind: WriteKind,
    pub addend: i64,
    pub flags: BindSymbolFlags,
    /// Offset of the emitting opcode within the stream
    pub opcode_offset: usize,
}

impl BindAction {
    pub fn is_weak_import(&self) -> bool {
        self.flags.contains(BindSymbolFlags::WEAK_IMPORT)
    }
}

impl Action for BindAction {
    fn address(&self) -> u64 {
        self.address
    }
}

#[derive(Debug, Clone)]
struct ThreadedEntry<'a> {
    symbol: &'a str,
    ordinal: i64,
    flags: u8,
    addend: i64,
}

#[derive(Debug, Clone, Copy)]
struct ChainWalk {
    opcode_offset: usize,
}

/// Lazy iterator over the actions of one bind stream
#[derive(Debug)]
pub struct BindStream<'a> {
    cursor: ByteCursor<'a>,
    segments: &'a SegmentCollection,
    stream: BindStreamKind,
    state: InterpreterState<'a>,
    image: Option<(&'a [u8], Endianness)>,
    /// Ordinal table, present once the stream switched to threaded binds
    table: Option<Vec<ThreadedEntry<'a>>>,
    chain: Option<ChainWalk>,
    deferred: Option<MachOError>,
    emitted: usize,
    limit: Option<usize>,
    done: bool,
}

impl<'a> BindStream<'a> {
    pub fn new(opcodes: &'a [u8], segments: &'a SegmentCollection, stream: BindStreamKind) -> Self {
        let mut state = InterpreterState::default();
        match stream {
            BindStreamKind::Lazy => state.kind = Some(WriteKind::Pointer),
            BindStreamKind::Weak => state.ordinal = Some(BIND_SPECIAL_DYLIB_WEAK_LOOKUP),
            BindStreamKind::Normal => {}
        }
        Self {
            cursor: ByteCursor::new(opcodes),
            segments,
            stream,
            state,
            image: None,
            table: None,
            chain: None,
            deferred: None,
            emitted: 0,
            limit: None,
            done: false,
        }
    }

    /// Image bytes backing the segments; needed to walk threaded bind chains
    pub fn with_image(mut self, image: &'a [u8], endian: Endianness) -> Self {
        self.image = Some((image, endian));
        self
    }

    /// Fail with `ActionLimitExceeded` once `limit` actions were produced
    pub fn with_action_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn stream_kind(&self) -> BindStreamKind {
        self.stream
    }

    pub fn state(&self) -> &InterpreterState<'a> {
        &self.state
    }

    fn pointer_size(&self) -> u64 {
        self.segments.width().bytes()
    }

    fn emit(&self, opcode_offset: usize) -> Result<BindAction> {
        let ordinal = self.state.ordinal.ok_or(MachOError::NoDylibOrdinal {
            offset: opcode_offset,
        })?;
        let (segment_index, address) = self.state.target(self.segments, opcode_offset)?;
        let kind = self.state.write_kind(opcode_offset)?;
        let symbol = self.state.symbol.ok_or(MachOError::EmptySymbol {
            offset: opcode_offset,
        })?;
        Ok(BindAction {
            segment_index,
            segment_offset: self.state.segment_offset,
            address,
            symbol: symbol.to_string(),
            ordinal,
            kind,
            addend: self.state.addend,
            flags: BindSymbolFlags::from_bits_retain(self.state.symbol_flags),
            opcode_offset,
        })
    }

    /// Emit at the current slot, then advance; an advance failure surfaces on the next call
    fn emit_and_advance(&mut self, delta: Option<u64>, opcode_offset: usize) -> Result<BindAction> {
        let action = self.emit(opcode_offset)?;
        let advanced = delta
            .ok_or(MachOError::OutOfBoundsSegmentAddr {
                offset: opcode_offset,
            })
            .and_then(|delta| self.state.advance(self.segments, delta, opcode_offset));
        if let Err(e) = advanced {
            self.deferred = Some(e);
        }
        Ok(action)
    }

    fn step_repeat(&mut self, repeat: Repeat) -> Result<BindAction> {
        self.state.repeat = (repeat.remaining > 1).then_some(Repeat {
            remaining: repeat.remaining - 1,
            ..repeat
        });
        self.emit_and_advance(Some(repeat.step), repeat.opcode_offset)
    }

    /// Follow a threaded pointer chain to its next bind slot
    fn step_chain(&mut self, walk: ChainWalk) -> Result<Option<BindAction>> {
        let offset = walk.opcode_offset;
        let (image, endian) = self.image.ok_or(MachOError::OutOfBoundsSegmentAddr { offset })?;
        loop {
            let (segment_index, address) = self.state.target(self.segments, offset)?;
            let file_offset = self
                .segments
                .file_location(address)
                .ok()
                .and_then(|o| usize::try_from(o).ok())
                .ok_or(MachOError::OutOfBoundsSegmentAddr { offset })?;
            let value = image.read_u64(file_offset, endian)?;
            let delta = (value >> THREADED_DELTA_SHIFT) & THREADED_DELTA_MASK;

            let action = if value & THREADED_BIND != 0 {
                let index = value & THREADED_ORDINAL_MASK;
                let table = self.table.as_deref().unwrap_or_default();
                let entry = usize::try_from(index)
                    .ok()
                    .and_then(|i| table.get(i))
                    .ok_or(MachOError::InvalidThreadedOrdinal {
                        offset,
                        index,
                        table_len: table.len(),
                    })?;
                let kind = if value & THREADED_AUTH != 0 {
                    WriteKind::AuthenticatedPointer
                } else {
                    WriteKind::Pointer
                };
                Some(BindAction {
                    segment_index,
                    segment_offset: self.state.segment_offset,
                    address,
                    symbol: entry.symbol.to_string(),
                    ordinal: entry.ordinal,
                    kind,
                    addend: entry.addend,
                    flags: BindSymbolFlags::from_bits_retain(entry.flags),
                    opcode_offset: offset,
                })
            } else {
                None
            };

            if delta == 0 {
                self.chain = None;
            } else if let Err(e) = self
                .state
                .advance(self.segments, delta * THREADED_STRIDE, offset)
            {
                self.chain = None;
                return match action {
                    Some(action) => {
                        self.deferred = Some(e);
                        Ok(Some(action))
                    }
                    None => Err(e),
                };
            }
            if action.is_some() || self.chain.is_none() {
                return Ok(action);
            }
        }
    }

    fn is_zero_padding(&self) -> bool {
        self.cursor.rest().iter().all(|&b| b == 0)
    }

    /// Execute opcodes until one produces an action or the stream ends
    fn step(&mut self) -> Result<Option<BindAction>> {
        if let Some(repeat) = self.state.repeat {
            return self.step_repeat(repeat).map(Some);
        }
        if let Some(walk) = self.chain {
            if let Some(action) = self.step_chain(walk)? {
                return Ok(Some(action));
            }
        }

        let ptr = self.pointer_size();
        while !self.cursor.is_at_end() {
            let offset = self.cursor.position();
            let byte = self.cursor.read_u8()?;
            let opcode = byte & BIND_OPCODE_MASK;
            let imm = byte & BIND_IMMEDIATE_MASK;
            trace!(offset, opcode, imm, "bind opcode");

            match opcode {
                BIND_OPCODE_DONE => {
                    if self.stream == BindStreamKind::Lazy {
                        continue;
                    }
                    if !self.is_zero_padding() {
                        return Err(MachOError::TrailingBytes {
                            offset: self.cursor.position(),
                        });
                    }
                    return Ok(None);
                }
                BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => self.state.ordinal = Some(i64::from(imm)),
                BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => {
                    let ordinal = self.cursor.read_uleb128()?;
                    let ordinal = i64::try_from(ordinal)
                        .map_err(|_| MachOError::InvalidUleb128 { offset: offset + 1 })?;
                    self.state.ordinal = Some(ordinal);
                }
                BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                    let ordinal = if imm == 0 {
                        BIND_SPECIAL_DYLIB_SELF
                    } else {
                        i64::from((BIND_OPCODE_MASK | imm) as i8)
                    };
                    if ordinal < BIND_SPECIAL_DYLIB_WEAK_LOOKUP {
                        return Err(MachOError::UnrecognizedSpecialOrdinal {
                            offset,
                            immediate: imm,
                        });
                    }
                    self.state.ordinal = Some(ordinal);
                }
                BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                    let symbol = self.cursor.read_cstr()?;
                    if symbol.is_empty() {
                        return Err(MachOError::EmptySymbol { offset });
                    }
                    self.state.symbol = Some(symbol);
                    self.state.symbol_flags = imm;
                }
                BIND_OPCODE_SET_TYPE_IMM => {
                    let kind = WriteKind::from_immediate(imm).ok_or(
                        MachOError::UnrecognizedBindWriteKind { offset, kind: imm },
                    )?;
                    self.state.kind = Some(kind);
                }
                BIND_OPCODE_SET_ADDEND_SLEB => self.state.addend = self.cursor.read_sleb128()?,
                BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                    let seg_offset = self.cursor.read_uleb128()?;
                    self.state
                        .set_segment(self.segments, imm, seg_offset, offset)?;
                }
                BIND_OPCODE_ADD_ADDR_ULEB => {
                    let delta = self.cursor.read_uleb128()?;
                    self.state.advance(self.segments, delta, offset)?;
                }
                BIND_OPCODE_DO_BIND => {
                    if let Some(table) = self.table.as_mut() {
                        let entry = threaded_entry(&self.state, offset)?;
                        table.push(entry);
                        continue;
                    }
                    return self.emit_and_advance(Some(ptr), offset).map(Some);
                }
                BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                    let extra = self.cursor.read_uleb128()?;
                    return self
                        .emit_and_advance(extra.checked_add(ptr), offset)
                        .map(Some);
                }
                BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
                    let delta = u64::from(imm) * ptr + ptr;
                    return self.emit_and_advance(Some(delta), offset).map(Some);
                }
                BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                    let count = self.cursor.read_uleb128()?;
                    let skip = self.cursor.read_uleb128()?;
                    let step = skip
                        .checked_add(ptr)
                        .ok_or(MachOError::OutOfBoundsSegmentAddr { offset })?;
                    if count == 0 {
                        continue;
                    }
                    return self
                        .step_repeat(Repeat {
                            remaining: count,
                            step,
                            opcode_offset: offset,
                        })
                        .map(Some);
                }
                BIND_OPCODE_THREADED => match imm {
                    BIND_SUBOPCODE_THREADED_SET_BIND_ORDINAL_TABLE_SIZE_ULEB => {
                        let size = self.cursor.read_uleb128()?;
                        let reserve = size.min(MAX_TABLE_RESERVE) as usize;
                        self.table = Some(Vec::with_capacity(reserve));
                    }
                    BIND_SUBOPCODE_THREADED_APPLY => {
                        let walk = ChainWalk {
                            opcode_offset: offset,
                        };
                        self.chain = Some(walk);
                        if let Some(action) = self.step_chain(walk)? {
                            return Ok(Some(action));
                        }
                    }
                    sub_opcode => {
                        return Err(MachOError::UnrecognizedBindSubOpcode { offset, sub_opcode })
                    }
                },
                _ => return Err(MachOError::UnrecognizedBindOpcode { offset, opcode: byte }),
            }
        }
        // Only the lazy stream may run off the end of its range
        if self.stream != BindStreamKind::Lazy && self.cursor.position() > 0 {
            return Err(MachOError::MissingDone {
                offset: self.cursor.position(),
            });
        }
        Ok(None)
    }
}

/// Ordinal table entry captured by `DO_BIND` in threaded mode
fn threaded_entry<'a>(state: &InterpreterState<'a>, offset: usize) -> Result<ThreadedEntry<'a>> {
    Ok(ThreadedEntry {
        symbol: state.symbol.ok_or(MachOError::EmptySymbol { offset })?,
        ordinal: state.ordinal.ok_or(MachOError::NoDylibOrdinal { offset })?,
        flags: state.symbol_flags,
        addend: state.addend,
    })
}

impl Iterator for BindStream<'_> {
    type Item = Result<BindAction>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(e) = self.deferred.take() {
            self.done = true;
            return Some(Err(e));
        }
        if let Some(limit) = self.limit.filter(|&limit| self.emitted >= limit) {
            self.done = true;
            return Some(Err(MachOError::ActionLimitExceeded { limit }));
        }
        match self.step() {
            Ok(Some(action)) => {
                self.emitted += 1;
                Some(Ok(action))
            }
            Ok(None) => {
                debug!(stream = self.stream.name(), actions = self.emitted, "bind stream done");
                self.done = true;
                None
            }
            Err(e) => {
                debug!(stream = self.stream.name(), error = %e, "bind stream failed");
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl FusedIterator for BindStream<'_> {}
