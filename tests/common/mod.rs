//! Common test utilities and helpers.
//!
//! `ImageBuilder` assembles small synthetic Mach-O images: a header, the
//! requested load commands, a zero-filled body and the dyld-info blobs
//! appended after it.

#![allow(dead_code)]

use std::io::Write;
use tempfile::NamedTempFile;

pub const MH_MAGIC: u32 = 0xfeedface;
pub const MH_MAGIC_64: u32 = 0xfeedfacf;
pub const LC_SEGMENT: u32 = 0x1;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_ID_DYLIB: u32 = 0xd;
pub const LC_LOAD_DYLIB: u32 = 0xc;
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x8000_0018;
pub const LC_UUID: u32 = 0x1b;
pub const LC_RPATH: u32 = 0x8000_001c;
pub const LC_DYLD_INFO_ONLY: u32 = 0x8000_0022;

pub const CPU_TYPE_ARM64: u32 = 0x0100_000c;
pub const CPU_TYPE_X86_64: u32 = 0x0100_0007;
pub const MH_EXECUTE: u32 = 0x2;
pub const MH_DYLIB: u32 = 0x6;

#[derive(Debug, Clone)]
pub struct Section {
    pub name: &'static str,
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub flags: u32,
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub name: &'static str,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub sections: Vec<Section>,
}

impl Segment {
    pub fn new(name: &'static str, vmaddr: u64, vmsize: u64, fileoff: u64, filesize: u64) -> Self {
        Self {
            name,
            vmaddr,
            vmsize,
            fileoff,
            filesize,
            sections: Vec::new(),
        }
    }

    pub fn with_section(mut self, section: Section) -> Self {
        self.sections.push(section);
        self
    }
}

struct Writer {
    buf: Vec<u8>,
    big: bool,
    is_32: bool,
}

impl Writer {
    fn new(big: bool, is_32: bool) -> Self {
        Self {
            buf: Vec::new(),
            big,
            is_32,
        }
    }

    fn u32(&mut self, v: u32) {
        let bytes = if self.big { v.to_be_bytes() } else { v.to_le_bytes() };
        self.buf.extend_from_slice(&bytes);
    }

    fn u64(&mut self, v: u64) {
        let bytes = if self.big { v.to_be_bytes() } else { v.to_le_bytes() };
        self.buf.extend_from_slice(&bytes);
    }

    fn word(&mut self, v: u64) {
        if self.is_32 {
            self.u32(v as u32);
        } else {
            self.u64(v);
        }
    }

    fn name16(&mut self, name: &str) {
        let mut raw = [0u8; 16];
        raw[..name.len()].copy_from_slice(name.as_bytes());
        self.buf.extend_from_slice(&raw);
    }

    /// NUL-terminated string padded so the command ends 8-byte aligned
    fn padded_str(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        while self.buf.len() % 8 != 0 {
            self.buf.push(0);
        }
    }
}

fn align8(v: usize) -> usize {
    (v + 7) & !7
}

/// Builder for synthetic thin images
#[derive(Debug, Clone, Default)]
pub struct ImageBuilder {
    pub is_32: bool,
    pub big_endian: bool,
    pub cputype: u32,
    pub filetype: u32,
    pub segments: Vec<Segment>,
    pub install_name: Option<String>,
    pub dylibs: Vec<(u32, String)>,
    pub uuid: Option<[u8; 16]>,
    pub rpaths: Vec<String>,
    pub dyld_info: bool,
    pub rebase: Vec<u8>,
    pub bind: Vec<u8>,
    pub weak_bind: Vec<u8>,
    pub lazy_bind: Vec<u8>,
    pub exports: Vec<u8>,
    pub body_size: usize,
    pub patches: Vec<(usize, Vec<u8>)>,
}

impl ImageBuilder {
    /// 64-bit little-endian arm64 executable
    pub fn new() -> Self {
        Self {
            cputype: CPU_TYPE_ARM64,
            filetype: MH_EXECUTE,
            dyld_info: true,
            ..Self::default()
        }
    }

    pub fn segment(mut self, segment: Segment) -> Self {
        self.segments.push(segment);
        self
    }

    pub fn dylib(mut self, name: &str) -> Self {
        self.dylibs.push((LC_LOAD_DYLIB, name.to_string()));
        self
    }

    pub fn weak_dylib(mut self, name: &str) -> Self {
        self.dylibs.push((LC_LOAD_WEAK_DYLIB, name.to_string()));
        self
    }

    pub fn body_size(mut self, size: usize) -> Self {
        self.body_size = size;
        self
    }

    pub fn patch(mut self, offset: usize, bytes: &[u8]) -> Self {
        self.patches.push((offset, bytes.to_vec()));
        self
    }

    fn load_commands(&self) -> (u32, Vec<u8>) {
        let mut w = Writer::new(self.big_endian, self.is_32);
        let mut ncmds = 0;

        for seg in &self.segments {
            let (cmd, header, section) = if self.is_32 {
                (LC_SEGMENT, 56, 68)
            } else {
                (LC_SEGMENT_64, 72, 80)
            };
            w.u32(cmd);
            w.u32((header + section * seg.sections.len()) as u32);
            w.name16(seg.name);
            w.word(seg.vmaddr);
            w.word(seg.vmsize);
            w.word(seg.fileoff);
            w.word(seg.filesize);
            w.u32(7);
            w.u32(3);
            w.u32(seg.sections.len() as u32);
            w.u32(0);
            for sect in &seg.sections {
                w.name16(sect.name);
                w.name16(seg.name);
                w.word(sect.addr);
                w.word(sect.size);
                w.u32(sect.offset);
                w.u32(3);
                w.u32(0);
                w.u32(0);
                w.u32(sect.flags);
                w.u32(0);
                w.u32(0);
                if !self.is_32 {
                    w.u32(0);
                }
            }
            ncmds += 1;
        }

        let dylib_cmds = self
            .install_name
            .iter()
            .map(|name| (LC_ID_DYLIB, name.clone()))
            .chain(self.dylibs.iter().cloned());
        for (cmd, name) in dylib_cmds {
            let size = align8(24 + name.len() + 1);
            w.u32(cmd);
            w.u32(size as u32);
            w.u32(24);
            w.u32(2);
            w.u32(0x0001_0000);
            w.u32(0x0001_0000);
            w.padded_str(&name);
            ncmds += 1;
        }

        if let Some(uuid) = self.uuid {
            w.u32(LC_UUID);
            w.u32(24);
            w.buf.extend_from_slice(&uuid);
            ncmds += 1;
        }

        for path in &self.rpaths {
            let size = align8(12 + path.len() + 1);
            w.u32(LC_RPATH);
            w.u32(size as u32);
            w.u32(12);
            w.padded_str(path);
            ncmds += 1;
        }

        (ncmds, w.buf)
    }

    pub fn build(&self) -> Vec<u8> {
        let header_size = if self.is_32 { 28 } else { 32 };
        let (mut ncmds, mut cmds) = self.load_commands();
        let dyld_size = if self.dyld_info { 48 } else { 0 };
        let cmds_end = header_size + cmds.len() + dyld_size;

        let mut offset = align8(self.body_size.max(cmds_end));
        let mut blobs = Vec::new();
        let mut ranges = Vec::new();
        for blob in [&self.rebase, &self.bind, &self.weak_bind, &self.lazy_bind, &self.exports] {
            ranges.push((offset as u32, blob.len() as u32));
            blobs.push((offset, blob.clone()));
            offset = align8(offset + blob.len());
        }

        if self.dyld_info {
            let mut w = Writer::new(self.big_endian, self.is_32);
            w.u32(LC_DYLD_INFO_ONLY);
            w.u32(48);
            for (off, size) in &ranges {
                w.u32(if *size == 0 { 0 } else { *off });
                w.u32(*size);
            }
            cmds.extend_from_slice(&w.buf);
            ncmds += 1;
        }

        let mut w = Writer::new(self.big_endian, self.is_32);
        w.u32(if self.is_32 { MH_MAGIC } else { MH_MAGIC_64 });
        w.u32(self.cputype);
        w.u32(0);
        w.u32(self.filetype);
        w.u32(ncmds);
        w.u32(cmds.len() as u32);
        w.u32(0x0020_0085);
        if !self.is_32 {
            w.u32(0);
        }

        let mut image = w.buf;
        image.extend_from_slice(&cmds);
        image.resize(offset, 0);
        for (off, blob) in blobs {
            image[off..off + blob.len()].copy_from_slice(&blob);
        }
        for (off, bytes) in &self.patches {
            image[*off..*off + bytes.len()].copy_from_slice(bytes);
        }
        image
    }
}

/// Typical two-segment executable: `__TEXT` at 0x1_0000_0000 and `__DATA` right after
pub fn basic_image() -> ImageBuilder {
    ImageBuilder::new()
        .segment(Segment::new("__PAGEZERO", 0, 0x1_0000_0000, 0, 0))
        .segment(Segment::new("__TEXT", 0x1_0000_0000, 0x4000, 0, 0x4000))
        .segment(
            Segment::new("__DATA", 0x1_0000_4000, 0x4000, 0x4000, 0x4000).with_section(Section {
                name: "__got",
                addr: 0x1_0000_4000,
                size: 0x100,
                offset: 0x4000,
                flags: 0x6,
            }),
        )
        .dylib("/usr/lib/libSystem.B.dylib")
        .body_size(0x8000)
}

pub fn uleb(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

/// Trie with one root edge per symbol, each leading to a regular export
pub fn flat_trie(exports: &[(&str, u64)]) -> Vec<u8> {
    let terminals: Vec<Vec<u8>> = exports
        .iter()
        .map(|(_, offset)| {
            let mut payload = vec![0x00];
            payload.extend(uleb(*offset));
            let mut node = uleb(payload.len() as u64);
            node.extend(payload);
            node.push(0x00);
            node
        })
        .collect();

    // child offsets depend on the root's size, which depends on their encodings
    let mut root_len = 0;
    loop {
        let mut root = vec![0x00, exports.len() as u8];
        let mut next = root_len;
        for ((name, _), node) in exports.iter().zip(&terminals) {
            root.extend_from_slice(name.as_bytes());
            root.push(0);
            root.extend(uleb(next as u64));
            next += node.len();
        }
        if root.len() == root_len {
            for node in &terminals {
                root.extend_from_slice(node);
            }
            return root;
        }
        root_len = root.len();
    }
}

pub fn temp_file_with(content: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content).unwrap();
    file
}
