//! Mach-O parser
//!
//! Decodes headers and load commands, builds the segment address space and
//! exposes the dyld-info streams (export trie, bind and rebase opcodes) as
//! lazy iterators borrowing the image bytes.

pub mod bind;
pub mod exports;
pub mod fat;
pub mod header;
pub mod load_commands;
pub mod opcodes;
pub mod rebase;
pub mod segments;
pub mod types;
pub mod utils;

use tracing::debug;

use crate::error::DecodeBudget;
use bind::BindStream;
use exports::ExportTrie;
use header::{parse_header, MachHeader};
use load_commands::{DylibCommand, DylibKind, LoadCommand, LoadCommandIter, SegmentCommand};
use rebase::RebaseStream;
use segments::{PartialSegments, SegmentCollection};
pub use types::*;

/// Main Mach-O parser
#[derive(Debug)]
pub struct MachOParser<'data> {
    data: &'data [u8],
    header: MachHeader,
    commands: Vec<LoadCommand<'data>>,
    budget: DecodeBudget,
}

impl<'data> MachOParser<'data> {
    /// Parse a thin Mach-O image with the default budget
    pub fn parse(data: &'data [u8]) -> Result<Self> {
        Self::parse_with_budget(data, &DecodeBudget::default())
    }

    pub fn parse_with_budget(data: &'data [u8], budget: &DecodeBudget) -> Result<Self> {
        let header = parse_header(data)?;
        if header.ncmds > budget.max_load_commands {
            return Err(MachOError::InvalidLoadCommand {
                offset: header.size(),
                reason: "too many load commands",
            });
        }

        // Every command takes at least 8 bytes of sizeofcmds
        let capacity = (header.ncmds as usize).min(header.sizeofcmds as usize / 8);
        let mut commands = Vec::with_capacity(capacity);
        for raw in LoadCommandIter::new(data, &header)? {
            commands.push(LoadCommand::parse(&raw?, header.endian)?);
        }
        debug!(
            cpu = ?header.cpu_type(),
            filetype = ?header.file_type(),
            commands = commands.len(),
            "parsed Mach-O header"
        );

        Ok(Self {
            data,
            header,
            commands,
            budget: *budget,
        })
    }

    pub fn header(&self) -> &MachHeader {
        &self.header
    }

    pub fn data(&self) -> &'data [u8] {
        self.data
    }

    pub fn load_commands(&self) -> &[LoadCommand<'data>] {
        &self.commands
    }

    /// Build and validate the segment address space
    pub fn segments(&self) -> std::result::Result<SegmentCollection, PartialSegments> {
        let commands = self.commands.iter().filter_map(|cmd| match cmd {
            LoadCommand::Segment(seg) => Some(seg),
            _ => None,
        });
        SegmentCollection::build(commands, self.header.width, self.data.len() as u64)
    }

    /// Raw segment commands, in load-command order
    pub fn segment_commands(&self) -> impl Iterator<Item = &SegmentCommand> {
        self.commands.iter().filter_map(|cmd| match cmd {
            LoadCommand::Segment(seg) => Some(seg),
            _ => None,
        })
    }

    pub fn dyld_info(&self) -> Option<DyldInfo> {
        self.commands.iter().find_map(|cmd| match cmd {
            LoadCommand::DyldInfo(info) => Some(*info),
            _ => None,
        })
    }

    /// Bytes of one dyld-info range; empty when the image has no dyld info
    fn dyld_range(&self, offset: u32, size: u32) -> Result<&'data [u8]> {
        if size == 0 {
            return Ok(&[]);
        }
        let start = offset as usize;
        start
            .checked_add(size as usize)
            .and_then(|end| self.data.get(start..end))
            .ok_or(MachOError::Truncated {
                offset: start,
                needed: size as usize,
            })
    }

    pub fn export_data(&self) -> Result<&'data [u8]> {
        let info = self.dyld_info().unwrap_or_default();
        self.dyld_range(info.export_off, info.export_size)
    }

    pub fn bind_data(&self, kind: BindStreamKind) -> Result<&'data [u8]> {
        let info = self.dyld_info().unwrap_or_default();
        match kind {
            BindStreamKind::Normal => self.dyld_range(info.bind_off, info.bind_size),
            BindStreamKind::Lazy => self.dyld_range(info.lazy_bind_off, info.lazy_bind_size),
            BindStreamKind::Weak => self.dyld_range(info.weak_bind_off, info.weak_bind_size),
        }
    }

    pub fn rebase_data(&self) -> Result<&'data [u8]> {
        let info = self.dyld_info().unwrap_or_default();
        self.dyld_range(info.rebase_off, info.rebase_size)
    }

    /// Exported symbols, decoded lazily
    pub fn exports(&self) -> Result<ExportTrie<'data>> {
        Ok(ExportTrie::with_max_depth(
            self.export_data()?,
            self.budget.max_trie_depth,
        ))
    }

    /// Actions of one bind stream, resolved through `segments`
    pub fn binds<'s>(
        &self,
        segments: &'s SegmentCollection,
        kind: BindStreamKind,
    ) -> Result<BindStream<'s>>
    where
        'data: 's,
    {
        Ok(BindStream::new(self.bind_data(kind)?, segments, kind)
            .with_image(self.data, self.header.endian)
            .with_action_limit(self.budget.max_actions))
    }

    pub fn rebases<'s>(&self, segments: &'s SegmentCollection) -> Result<RebaseStream<'s>>
    where
        'data: 's,
    {
        Ok(RebaseStream::new(self.rebase_data()?, segments)
            .with_action_limit(self.budget.max_actions))
    }

    /// Imported libraries; a bind ordinal `n > 0` names `dylibs()[n - 1]`
    pub fn dylibs(&self) -> Vec<&DylibCommand> {
        self.commands
            .iter()
            .filter_map(|cmd| match cmd {
                LoadCommand::Dylib(dylib) if dylib.kind != DylibKind::Id => Some(dylib),
                _ => None,
            })
            .collect()
    }

    /// Install name from `LC_ID_DYLIB`
    pub fn install_name(&self) -> Option<&str> {
        self.commands.iter().find_map(|cmd| match cmd {
            LoadCommand::Dylib(dylib) if dylib.kind == DylibKind::Id => Some(dylib.name.as_str()),
            _ => None,
        })
    }

    /// Human-readable name for a bind ordinal
    pub fn ordinal_name(&self, ordinal: i64) -> Option<&str> {
        match ordinal {
            BIND_SPECIAL_DYLIB_SELF => Some("this-image"),
            BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE => Some("main-executable"),
            BIND_SPECIAL_DYLIB_FLAT_LOOKUP => Some("flat-namespace"),
            BIND_SPECIAL_DYLIB_WEAK_LOOKUP => Some("weak"),
            n if n > 0 => {
                let index = usize::try_from(n - 1).ok()?;
                self.dylibs().get(index).map(|d| d.name.as_str())
            }
            _ => None,
        }
    }

    pub fn uuid(&self) -> Option<[u8; 16]> {
        self.commands.iter().find_map(|cmd| match cmd {
            LoadCommand::Uuid(uuid) => Some(*uuid),
            _ => None,
        })
    }

    pub fn rpaths(&self) -> Vec<&str> {
        self.commands
            .iter()
            .filter_map(|cmd| match cmd {
                LoadCommand::Rpath(path) => Some(path.as_str()),
                _ => None,
            })
            .collect()
    }

    /// `LC_MAIN` entry offset
    pub fn entry_offset(&self) -> Option<u64> {
        self.commands.iter().find_map(|cmd| match cmd {
            LoadCommand::Main { entryoff, .. } => Some(*entryoff),
            _ => None,
        })
    }
}
