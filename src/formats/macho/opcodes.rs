//! Register file and helpers shared by the bind and rebase interpreters

use std::collections::HashSet;
use std::iter::FusedIterator;

use crate::formats::macho::segments::SegmentCollection;
use crate::formats::macho::types::{MachOError, Result, WriteKind};

/// Anything emitted at one resolved address
pub trait Action {
    fn address(&self) -> u64;
}

/// A "times" opcode still emitting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Repeat {
    pub remaining: u64,
    /// Distance to advance after each emission
    pub step: u64,
    pub opcode_offset: usize,
}

/// Registers of the bind/rebase machines, zeroed at stream start
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterpreterState<'a> {
    pub ordinal: Option<i64>,
    pub symbol: Option<&'a str>,
    pub symbol_flags: u8,
    pub kind: Option<WriteKind>,
    pub addend: i64,
    pub segment_index: Option<usize>,
    pub segment_offset: u64,
    pub repeat: Option<Repeat>,
}

impl<'a> InterpreterState<'a> {
    /// `SET_SEGMENT_AND_OFFSET_ULEB`
    pub fn set_segment(
        &mut self,
        segments: &SegmentCollection,
        index: u8,
        offset: u64,
        opcode_offset: usize,
    ) -> Result<()> {
        let count = segments.len();
        if usize::from(index) >= count {
            return Err(MachOError::InvalidSegmentIndex {
                offset: opcode_offset,
                index,
                count,
            });
        }
        self.segment_index = Some(usize::from(index));
        self.segment_offset = 0;
        self.advance(segments, offset, opcode_offset)
    }

    /// Move the in-segment offset forward by `delta`.
    ///
    /// The offset may run past the segment end (only emission checks that),
    /// but `vmaddr + offset` may never leave the image's address width.
    pub fn advance(
        &mut self,
        segments: &SegmentCollection,
        delta: u64,
        opcode_offset: usize,
    ) -> Result<()> {
        let overflow = MachOError::OutOfBoundsSegmentAddr {
            offset: opcode_offset,
        };
        let next = self.segment_offset.checked_add(delta).ok_or(overflow.clone())?;
        let base = self
            .segment_index
            .and_then(|index| segments.segment_at(index))
            .map_or(0, |segment| segment.vmaddr());
        let limit = u128::from(segments.width().max_address()) + 1;
        if u128::from(base) + u128::from(next) > limit {
            return Err(overflow);
        }
        self.segment_offset = next;
        Ok(())
    }

    /// Segment index and absolute address of the current slot
    pub fn target(&self, segments: &SegmentCollection, opcode_offset: usize) -> Result<(usize, u64)> {
        let index = self.segment_index.ok_or(MachOError::NoSegmentIndex {
            offset: opcode_offset,
        })?;
        let address = segments
            .resolve(index, self.segment_offset)
            .map_err(|_| MachOError::OutOfBoundsSegmentAddr {
                offset: opcode_offset,
            })?;
        Ok((index, address))
    }

    pub fn write_kind(&self, opcode_offset: usize) -> Result<WriteKind> {
        self.kind.ok_or(MachOError::NoWriteKind {
            offset: opcode_offset,
        })
    }
}

/// Iterator adapter failing on the first repeated address
#[derive(Debug)]
pub struct DedupByAddress<I> {
    inner: I,
    seen: HashSet<u64>,
    done: bool,
}

impl<I, A> Iterator for DedupByAddress<I>
where
    I: Iterator<Item = Result<A>>,
    A: Action,
{
    type Item = Result<A>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.inner.next() {
            Some(Ok(action)) => {
                let address = action.address();
                if self.seen.insert(address) {
                    Some(Ok(action))
                } else {
                    self.done = true;
                    Some(Err(MachOError::MultipleBindsForAddress { address }))
                }
            }
            Some(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

impl<I, A> FusedIterator for DedupByAddress<I>
where
    I: Iterator<Item = Result<A>>,
    A: Action,
{
}

/// View of an action stream where every address may appear once
pub fn dedup_by_address<I, A>(actions: I) -> DedupByAddress<I::IntoIter>
where
    I: IntoIterator<Item = Result<A>>,
    A: Action,
{
    DedupByAddress {
        inner: actions.into_iter(),
        seen: HashSet::new(),
        done: false,
    }
}
