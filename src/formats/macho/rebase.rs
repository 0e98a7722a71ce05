//! Rebase opcode interpreter

use serde::Serialize;
use std::iter::FusedIterator;
use tracing::{debug, trace};

use crate::formats::macho::opcodes::{Action, InterpreterState, Repeat};
use crate::formats::macho::segments::SegmentCollection;
use crate::formats::macho::types::*;
use crate::formats::macho::utils::ByteCursor;

/// One slot to slide by the load bias
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RebaseAction {
    pub segment_index: usize,
    pub segment_offset: u64,
    pub address: u64,
    pub kind: WriteKind,
    pub opcode_offset: usize,
}

impl Action for RebaseAction {
    fn address(&self) -> u64 {
        self.address
    }
}

/// Lazy iterator over the actions of a rebase stream
///
/// `DONE` ends the stream; whatever follows it is ignored.
#[derive(Debug)]
pub struct RebaseStream<'a> {
    cursor: ByteCursor<'a>,
    segments: &'a SegmentCollection,
    state: InterpreterState<'a>,
    deferred: Option<MachOError>,
    emitted: usize,
    limit: Option<usize>,
    done: bool,
}

impl<'a> RebaseStream<'a> {
    pub fn new(opcodes: &'a [u8], segments: &'a SegmentCollection) -> Self {
        Self {
            cursor: ByteCursor::new(opcodes),
            segments,
            state: InterpreterState::default(),
            deferred: None,
            emitted: 0,
            limit: None,
            done: false,
        }
    }

    pub fn with_action_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn state(&self) -> &InterpreterState<'a> {
        &self.state
    }

    fn emit_and_advance(&mut self, delta: Option<u64>, opcode_offset: usize) -> Result<RebaseAction> {
        let (segment_index, address) = self.state.target(self.segments, opcode_offset)?;
        let kind = self.state.write_kind(opcode_offset)?;
        let action = RebaseAction {
            segment_index,
            segment_offset: self.state.segment_offset,
            address,
            kind,
            opcode_offset,
        };
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

    fn start_repeat(&mut self, count: u64, step: Option<u64>, offset: usize) -> Result<Option<RebaseAction>> {
        let step = step.ok_or(MachOError::OutOfBoundsSegmentAddr { offset })?;
        if count == 0 {
            return Ok(None);
        }
        self.step_repeat(Repeat {
            remaining: count,
            step,
            opcode_offset: offset,
        })
        .map(Some)
    }

    fn step_repeat(&mut self, repeat: Repeat) -> Result<RebaseAction> {
        self.state.repeat = (repeat.remaining > 1).then_some(Repeat {
            remaining: repeat.remaining - 1,
            ..repeat
        });
        self.emit_and_advance(Some(repeat.step), repeat.opcode_offset)
    }

    fn step(&mut self) -> Result<Option<RebaseAction>> {
        if let Some(repeat) = self.state.repeat {
            return self.step_repeat(repeat).map(Some);
        }

        let ptr = self.segments.width().bytes();
        while !self.cursor.is_at_end() {
            let offset = self.cursor.position();
            let byte = self.cursor.read_u8()?;
            let opcode = byte & REBASE_OPCODE_MASK;
            let imm = byte & REBASE_IMMEDIATE_MASK;
            trace!(offset, opcode, imm, "rebase opcode");

            match opcode {
                REBASE_OPCODE_DONE => return Ok(None),
                REBASE_OPCODE_SET_TYPE_IMM => {
                    let kind = WriteKind::from_immediate(imm).ok_or(
                        MachOError::UnrecognizedRebaseWriteKind { offset, kind: imm },
                    )?;
                    self.state.kind = Some(kind);
                }
                REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                    let seg_offset = self.cursor.read_uleb128()?;
                    self.state
                        .set_segment(self.segments, imm, seg_offset, offset)?;
                }
                REBASE_OPCODE_ADD_ADDR_ULEB => {
                    let delta = self.cursor.read_uleb128()?;
                    self.state.advance(self.segments, delta, offset)?;
                }
                REBASE_OPCODE_ADD_ADDR_IMM_SCALED => {
                    self.state
                        .advance(self.segments, u64::from(imm) * ptr, offset)?;
                }
                REBASE_OPCODE_DO_REBASE_IMM_TIMES => {
                    if let Some(action) = self.start_repeat(u64::from(imm), Some(ptr), offset)? {
                        return Ok(Some(action));
                    }
                }
                REBASE_OPCODE_DO_REBASE_ULEB_TIMES => {
                    let count = self.cursor.read_uleb128()?;
                    if let Some(action) = self.start_repeat(count, Some(ptr), offset)? {
                        return Ok(Some(action));
                    }
                }
                REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB => {
                    let extra = self.cursor.read_uleb128()?;
                    return self
                        .emit_and_advance(extra.checked_add(ptr), offset)
                        .map(Some);
                }
                REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB => {
                    let count = self.cursor.read_uleb128()?;
                    let skip = self.cursor.read_uleb128()?;
                    if let Some(action) = self.start_repeat(count, skip.checked_add(ptr), offset)? {
                        return Ok(Some(action));
                    }
                }
                _ => return Err(MachOError::UnrecognizedRebaseOpcode { offset, opcode: byte }),
            }
        }
        Ok(None)
    }
}

impl Iterator for RebaseStream<'_> {
    type Item = Result<RebaseAction>;

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
                debug!(actions = self.emitted, "rebase stream done");
                self.done = true;
                None
            }
            Err(e) => {
                debug!(error = %e, "rebase stream failed");
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl FusedIterator for RebaseStream<'_> {}
