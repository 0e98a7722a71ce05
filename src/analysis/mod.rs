//! One-call image summaries.
//!
//! Runs every decoder over an image and condenses the results into a
//! serializable [`ImageSummary`]. A failing stream does not abort the
//! summary: its count stops at the failure and the error is recorded as text.

use rayon::prelude::*;
use serde::Serialize;
use std::path::Path;
use tracing::{debug, warn};

use crate::config::DecodeConfig;
use crate::error::{MachscopeError, Result};
use crate::formats::macho::fat::{is_fat, FatArch, FatArchive};
use crate::formats::macho::header::{parse_magic, CpuType, FileType};
use crate::formats::macho::utils::EndianRead;
use crate::formats::macho::{
    BindStreamKind, Endianness, MachOError, MachOParser, PointerWidth,
};
use crate::io::MappedFile;
use crate::{log_error, span_trace};

/// Outcome of draining one decoder
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamSummary {
    /// Items produced before the stream ended or failed
    pub count: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentSummary {
    pub name: String,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub sections: usize,
}

/// Decoded overview of one thin image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageSummary {
    pub cpu: CpuType,
    pub file_type: FileType,
    pub width: PointerWidth,
    pub endian: Endianness,
    pub load_commands: usize,
    pub uuid: Option<String>,
    pub install_name: Option<String>,
    pub dylibs: Vec<String>,
    pub rpaths: Vec<String>,
    pub segments: Vec<SegmentSummary>,
    /// Why the address space could not be built, if it could not
    pub segment_error: Option<String>,
    pub exports: StreamSummary,
    pub binds: StreamSummary,
    pub lazy_binds: StreamSummary,
    pub weak_binds: StreamSummary,
    pub rebases: StreamSummary,
}

/// One slice of a fat archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SliceSummary {
    pub arch: FatArch,
    pub summary: std::result::Result<ImageSummary, String>,
}

/// Summary of any supported input
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputSummary {
    Thin { image: ImageSummary },
    Fat { slices: Vec<SliceSummary> },
}

fn drain<T, I>(stream: &str, items: I) -> StreamSummary
where
    I: Iterator<Item = std::result::Result<T, MachOError>>,
{
    let mut summary = StreamSummary::default();
    for item in items {
        match item {
            Ok(_) => summary.count += 1,
            Err(e) => {
                let e = log_error!(e, stream);
                summary.error = Some(e.to_string());
                break;
            }
        }
    }
    summary
}

fn failed(error: impl ToString) -> StreamSummary {
    StreamSummary {
        count: 0,
        error: Some(error.to_string()),
    }
}

fn format_uuid(uuid: [u8; 16]) -> String {
    uuid.iter().enumerate().fold(String::with_capacity(36), |mut out, (i, b)| {
        if matches!(i, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        out.push_str(&format!("{b:02X}"));
        out
    })
}

/// Summarize a thin Mach-O image
pub fn summarize(data: &[u8], config: &DecodeConfig) -> std::result::Result<ImageSummary, MachOError> {
    let parser = MachOParser::parse_with_budget(data, &config.decode)?;
    let header = parser.header();

    let exports = match parser.exports() {
        Ok(trie) => drain("exports", trie),
        Err(e) => failed(e),
    };

    let (segments, segment_error) = match parser.segments() {
        Ok(segments) => (Some(segments), None),
        Err(partial) => {
            warn!(error = %partial.error, "segment validation failed");
            (None, Some(partial.error.to_string()))
        }
    };

    let bind_summary = |kind: BindStreamKind| match &segments {
        Some(segs) => match parser.binds(segs, kind) {
            Ok(stream) => drain(kind.name(), stream),
            Err(e) => failed(e),
        },
        None => failed("no valid segments"),
    };
    let binds = bind_summary(BindStreamKind::Normal);
    let lazy_binds = bind_summary(BindStreamKind::Lazy);
    let weak_binds = bind_summary(BindStreamKind::Weak);
    let rebases = match &segments {
        Some(segs) => match parser.rebases(segs) {
            Ok(stream) => drain("rebase", stream),
            Err(e) => failed(e),
        },
        None => failed("no valid segments"),
    };

    let summary = ImageSummary {
        cpu: header.cpu_type(),
        file_type: header.file_type(),
        width: header.width,
        endian: header.endian,
        load_commands: parser.load_commands().len(),
        uuid: parser.uuid().map(format_uuid),
        install_name: parser.install_name().map(str::to_string),
        dylibs: parser.dylibs().iter().map(|d| d.name.clone()).collect(),
        rpaths: parser.rpaths().into_iter().map(str::to_string).collect(),
        segments: parser
            .segment_commands()
            .map(|seg| SegmentSummary {
                name: seg.segname.clone(),
                vmaddr: seg.vmaddr,
                vmsize: seg.vmsize,
                fileoff: seg.fileoff,
                filesize: seg.filesize,
                sections: seg.sections.len(),
            })
            .collect(),
        segment_error,
        exports,
        binds,
        lazy_binds,
        weak_binds,
        rebases,
    };
    debug!(
        exports = summary.exports.count,
        binds = summary.binds.count,
        rebases = summary.rebases.count,
        "summarized image"
    );
    Ok(summary)
}

/// Summarize every slice of a fat archive in parallel
pub fn summarize_fat(
    data: &[u8],
    config: &DecodeConfig,
) -> std::result::Result<Vec<SliceSummary>, MachOError> {
    let fat = FatArchive::parse(data)?;
    Ok(fat
        .arches()
        .par_iter()
        .map(|arch| {
            let summary = fat
                .slice_data(arch)
                .and_then(|slice| summarize(slice, config))
                .map_err(|e| e.to_string());
            SliceSummary {
                arch: *arch,
                summary,
            }
        })
        .collect())
}

/// Summarize an in-memory input, thin or fat
pub fn summarize_bytes(data: &[u8], config: &DecodeConfig) -> Result<InputSummary> {
    if is_fat(data) {
        let slices = summarize_fat(data, config)?;
        return Ok(InputSummary::Fat { slices });
    }
    if parse_magic(data).is_ok() {
        let image = summarize(data, config)?;
        return Ok(InputSummary::Thin { image });
    }
    let magic = data.read_u32(0, Endianness::Big).unwrap_or(0);
    Err(MachscopeError::UnrecognizedFormat { magic })
}

/// Map a file and summarize it
pub fn summarize_path<P: AsRef<Path>>(path: P, config: &DecodeConfig) -> Result<InputSummary> {
    config.validate()?;
    let path = path.as_ref();
    let span = span_trace!("summarize", path = %path.display());
    let _guard = span.enter();
    let mapped = MappedFile::open(path, &config.io.limits())?;
    summarize_bytes(mapped.data(), config)
}
