//! Export trie decoding
//!
//! The trie is walked depth-first from offset 0. Every node is
//! `uleb terminal_size, [terminal payload], u8 child_count,
//! { cstr edge_label, uleb child_offset }*`, and a symbol's name is the
//! concatenation of the edge labels on the path to its terminal node.

use bitflags::bitflags;
use serde::Serialize;
use std::collections::BTreeMap;
use std::iter::FusedIterator;
use tracing::trace;

use crate::formats::macho::types::{MachOError, Result};
use crate::formats::macho::utils::ByteCursor;

/// Default nesting ceiling for export tries
pub const DEFAULT_MAX_TRIE_DEPTH: usize = 128;

const EXPORT_SYMBOL_FLAGS_KIND_MASK: u64 = 0x03;
const EXPORT_SYMBOL_FLAGS_KIND_REGULAR: u64 = 0x00;
const EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL: u64 = 0x01;
const EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE: u64 = 0x02;

bitflags! {
    /// Terminal flag bits above the kind field
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExportFlags: u64 {
        const WEAK_DEFINITION = 0x04;
        const REEXPORT = 0x08;
        const STUB_AND_RESOLVER = 0x10;
        const STATIC_RESOLVER = 0x20;
    }
}

impl Serialize for ExportFlags {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.bits())
    }
}

/// Symbol kind of an export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ExportKind {
    Regular,
    ThreadLocal,
    Absolute,
    Reexport,
}

/// Kind-dependent part of an export
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ExportPayload {
    /// Image-relative offset, plus the resolver offset for stub-and-resolver exports
    Offset { offset: u64, resolver: Option<u64> },
    /// Re-exported from dylib `ordinal`, optionally under a different name
    Reexport {
        ordinal: u64,
        imported_name: Option<String>,
    },
}

/// One exported symbol
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportRecord {
    pub name: String,
    pub kind: ExportKind,
    pub flags: ExportFlags,
    pub payload: ExportPayload,
    /// Offset of the terminal node within the trie
    pub node_offset: usize,
}

impl ExportRecord {
    pub fn is_weak(&self) -> bool {
        self.flags.contains(ExportFlags::WEAK_DEFINITION)
    }

    /// Image-relative offset, `None` for re-exports
    pub fn offset(&self) -> Option<u64> {
        match self.payload {
            ExportPayload::Offset { offset, .. } => Some(offset),
            ExportPayload::Reexport { .. } => None,
        }
    }
}

#[derive(Debug)]
struct Frame {
    offset: usize,
    /// Raw name bytes; labels may split a UTF-8 sequence
    prefix: Vec<u8>,
    depth: usize,
}

/// Lazy pre-order iterator over the exports of a trie
///
/// Yields every record reached before a malformed node, then the error,
/// then nothing.
#[derive(Debug)]
pub struct ExportTrie<'a> {
    data: &'a [u8],
    stack: Vec<Frame>,
    /// Visited node ranges, keyed by start offset
    visited: BTreeMap<usize, usize>,
    max_depth: usize,
    done: bool,
}

impl<'a> ExportTrie<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_max_depth(data, DEFAULT_MAX_TRIE_DEPTH)
    }

    pub fn with_max_depth(data: &'a [u8], max_depth: usize) -> Self {
        let stack = if data.is_empty() {
            Vec::new()
        } else {
            vec![Frame {
                offset: 0,
                prefix: Vec::new(),
                depth: 0,
            }]
        };
        Self {
            data,
            stack,
            visited: BTreeMap::new(),
            max_depth,
            done: false,
        }
    }

    fn overlaps_visited(&self, begin: usize, end: usize) -> bool {
        if let Some((_, &prev_end)) = self.visited.range(..=begin).next_back() {
            if prev_end > begin {
                return true;
            }
        }
        self.visited
            .range(begin..)
            .next()
            .is_some_and(|(&next_begin, _)| next_begin < end)
    }

    /// Decode one node, push its children and return its export if terminal
    fn visit(&mut self, frame: Frame) -> Result<Option<ExportRecord>> {
        let start = frame.offset;
        if start >= self.data.len() || self.overlaps_visited(start, start + 1) {
            return Err(MachOError::OverlappingRanges { offset: start });
        }
        if frame.depth > self.max_depth {
            return Err(MachOError::TooDeep {
                offset: start,
                limit: self.max_depth,
            });
        }

        let mut cursor = ByteCursor::at(self.data, start);
        let terminal_size = cursor.read_uleb128()?;
        let terminal_start = cursor.position();
        let record = if terminal_size > 0 {
            let terminal_end = usize::try_from(terminal_size)
                .ok()
                .and_then(|size| terminal_start.checked_add(size))
                .filter(|&end| end <= self.data.len())
                .ok_or(MachOError::InvalidTerminal {
                    offset: terminal_start,
                    reason: "terminal extends past end of trie",
                })?;
            if frame.prefix.is_empty() {
                return Err(MachOError::EmptyExport { offset: start });
            }
            let record = parse_terminal(
                &self.data[..terminal_end],
                terminal_start,
                String::from_utf8_lossy(&frame.prefix).into_owned(),
                start,
            )?;
            cursor = ByteCursor::at(self.data, terminal_end);
            Some(record)
        } else {
            None
        };

        let child_count = cursor.read_u8()?;
        let mut children = Vec::with_capacity(usize::from(child_count));
        for _ in 0..child_count {
            let label = cursor.read_cbytes()?;
            let label_offset = cursor.position();
            let child_offset = usize::try_from(cursor.read_uleb128()?)
                .map_err(|_| MachOError::OverlappingRanges {
                    offset: label_offset,
                })?;
            let mut prefix = Vec::with_capacity(frame.prefix.len() + label.len());
            prefix.extend_from_slice(&frame.prefix);
            prefix.extend_from_slice(label);
            children.push(Frame {
                offset: child_offset,
                prefix,
                depth: frame.depth + 1,
            });
        }

        let end = cursor.position();
        if self.overlaps_visited(start, end) {
            return Err(MachOError::OverlappingRanges { offset: start });
        }
        self.visited.insert(start, end);
        trace!(offset = start, children = child_count, "export trie node");

        self.stack.extend(children.into_iter().rev());
        Ok(record)
    }
}

fn parse_terminal(
    terminal: &[u8],
    start: usize,
    name: String,
    node_offset: usize,
) -> Result<ExportRecord> {
    let invalid = |reason| MachOError::InvalidTerminal {
        offset: start,
        reason,
    };
    let mut cursor = ByteCursor::at(terminal, start);
    let raw_flags = cursor.read_uleb128()?;

    let flags = ExportFlags::from_bits(raw_flags & !EXPORT_SYMBOL_FLAGS_KIND_MASK)
        .ok_or(invalid("unknown export flags"))?;
    let base_kind = match raw_flags & EXPORT_SYMBOL_FLAGS_KIND_MASK {
        EXPORT_SYMBOL_FLAGS_KIND_REGULAR => ExportKind::Regular,
        EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL => ExportKind::ThreadLocal,
        EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE => ExportKind::Absolute,
        _ => return Err(invalid("unknown export kind")),
    };

    let (kind, payload) = if flags.contains(ExportFlags::REEXPORT) {
        if flags.contains(ExportFlags::STUB_AND_RESOLVER) {
            return Err(invalid("re-export with resolver"));
        }
        let ordinal = cursor.read_uleb128()?;
        let imported = cursor.read_cbytes()?;
        let imported_name =
            (!imported.is_empty()).then(|| String::from_utf8_lossy(imported).into_owned());
        (
            ExportKind::Reexport,
            ExportPayload::Reexport {
                ordinal,
                imported_name,
            },
        )
    } else {
        let offset = cursor.read_uleb128()?;
        let resolver = if flags.contains(ExportFlags::STUB_AND_RESOLVER) {
            Some(cursor.read_uleb128()?)
        } else {
            None
        };
        (base_kind, ExportPayload::Offset { offset, resolver })
    };

    if !cursor.is_at_end() {
        return Err(invalid("payload shorter than terminal size"));
    }

    Ok(ExportRecord {
        name,
        kind,
        flags,
        payload,
        node_offset,
    })
}

impl Iterator for ExportTrie<'_> {
    type Item = Result<ExportRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let Some(frame) = self.stack.pop() else {
                self.done = true;
                break;
            };
            match self.visit(frame) {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => continue,
                Err(e) => {
                    self.done = true;
                    self.stack.clear();
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

impl FusedIterator for ExportTrie<'_> {}
