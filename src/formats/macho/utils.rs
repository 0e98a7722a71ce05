//! Utility functions for Mach-O parsing

use crate::formats::macho::types::{Endianness, MachOError, PointerWidth, Result};

/// Trait for reading values with endianness support
pub trait EndianRead {
    fn read_u16(&self, offset: usize, endian: Endianness) -> Result<u16>;
    fn read_u32(&self, offset: usize, endian: Endianness) -> Result<u32>;
    fn read_u64(&self, offset: usize, endian: Endianness) -> Result<u64>;
}

fn fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N]> {
    offset
        .checked_add(N)
        .and_then(|end| data.get(offset..end))
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(MachOError::Truncated { offset, needed: N })
}

impl EndianRead for [u8] {
    fn read_u16(&self, offset: usize, endian: Endianness) -> Result<u16> {
        let bytes = fixed::<2>(self, offset)?;
        Ok(match endian {
            Endianness::Little => u16::from_le_bytes(bytes),
            Endianness::Big => u16::from_be_bytes(bytes),
        })
    }

    fn read_u32(&self, offset: usize, endian: Endianness) -> Result<u32> {
        let bytes = fixed::<4>(self, offset)?;
        Ok(match endian {
            Endianness::Little => u32::from_le_bytes(bytes),
            Endianness::Big => u32::from_be_bytes(bytes),
        })
    }

    fn read_u64(&self, offset: usize, endian: Endianness) -> Result<u64> {
        let bytes = fixed::<8>(self, offset)?;
        Ok(match endian {
            Endianness::Little => u64::from_le_bytes(bytes),
            Endianness::Big => u64::from_be_bytes(bytes),
        })
    }
}

/// Read an address-sized field based on pointer width
pub fn read_addr(
    data: &[u8],
    offset: usize,
    width: PointerWidth,
    endian: Endianness,
) -> Result<u64> {
    match width {
        PointerWidth::Bits32 => data.read_u32(offset, endian).map(u64::from),
        PointerWidth::Bits64 => data.read_u64(offset, endian),
    }
}

/// Read a fixed 16-byte name field (segname/sectname), stopping at the first NUL
pub fn read_fixed_name(data: &[u8], offset: usize) -> Result<String> {
    let raw = fixed::<16>(data, offset)?;
    let len = memchr::memchr(0, &raw).unwrap_or(raw.len());
    std::str::from_utf8(&raw[..len])
        .map(str::to_owned)
        .map_err(|_| MachOError::InvalidString { offset })
}

/// Read a null-terminated string from `data[offset..end]`
pub fn read_cstring(data: &[u8], offset: usize, end: usize) -> Result<&str> {
    let end = end.min(data.len());
    if offset >= end {
        return Err(MachOError::UnterminatedString { offset });
    }
    let slice = &data[offset..end];
    let len = memchr::memchr(0, slice).ok_or(MachOError::UnterminatedString { offset })?;
    std::str::from_utf8(&slice[..len]).map_err(|_| MachOError::InvalidString { offset })
}

/// Forward-only reader over a byte range with bounds-checked LEB128 decoding.
///
/// Offsets reported in errors are relative to the start of the range.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Unread bytes
    pub fn rest(&self) -> &'a [u8] {
        self.data.get(self.pos..).unwrap_or_default()
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let byte = *self.data.get(self.pos).ok_or(MachOError::Truncated {
            offset: self.pos,
            needed: 1,
        })?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_uleb128(&mut self) -> Result<u64> {
        let start = self.pos;
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = *self
                .data
                .get(self.pos)
                .ok_or(MachOError::InvalidUleb128 { offset: start })?;
            self.pos += 1;
            let payload = u64::from(byte & 0x7f);
            if shift >= 64 || (shift == 63 && payload > 1) {
                return Err(MachOError::InvalidUleb128 { offset: start });
            }
            result |= payload << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
    }

    pub fn read_sleb128(&mut self) -> Result<i64> {
        let start = self.pos;
        let mut result: i64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = *self
                .data
                .get(self.pos)
                .ok_or(MachOError::InvalidSleb128 { offset: start })?;
            self.pos += 1;
            if shift >= 64 {
                return Err(MachOError::InvalidSleb128 { offset: start });
            }
            result |= i64::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
        }
    }

    /// Read the bytes of a null-terminated string, without the terminator
    pub fn read_cbytes(&mut self) -> Result<&'a [u8]> {
        let start = self.pos;
        let rest = self.rest();
        let len = memchr::memchr(0, rest).ok_or(MachOError::UnterminatedString { offset: start })?;
        self.pos = start + len + 1;
        Ok(&rest[..len])
    }

    /// Read a null-terminated string and step past its terminator
    pub fn read_cstr(&mut self) -> Result<&'a str> {
        let start = self.pos;
        let s = read_cstring(self.data, start, self.data.len())?;
        self.pos = start + s.len() + 1;
        Ok(s)
    }
}
