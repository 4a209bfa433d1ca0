//! Just enough of the WebAssembly binary format to find a module's imports.
//!
//! The harness never validates modules; it only needs to know which
//! registered modules a binary imports from so it can decide how to host it.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

const MAGIC: &[u8; 4] = b"\0asm";
const VERSION: u32 = 1;

const SECTION_CUSTOM: u8 = 0;
const SECTION_IMPORT: u8 = 2;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BinaryError {
    #[error("bad magic number")]
    BadMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u32),
    #[error("unexpected end of module")]
    UnexpectedEof,
    #[error("integer too large")]
    IntegerTooLarge,
    #[error("malformed utf-8 name")]
    BadName,
    #[error("unknown import kind 0x{0:02x}")]
    UnknownImportKind(u8),
}

/// Cursor over a module's bytes.
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Reader<'a> {
        Reader { bytes, pos: 0 }
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    pub fn read_byte(&mut self) -> Result<u8, BinaryError> {
        let byte = *self.bytes.get(self.pos).ok_or(BinaryError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], BinaryError> {
        let end = self.pos.checked_add(len).ok_or(BinaryError::UnexpectedEof)?;
        let slice = self.bytes.get(self.pos..end).ok_or(BinaryError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    /// Unsigned LEB128, up to 64 bits.
    pub fn read_vu64(&mut self) -> Result<u64, BinaryError> {
        let mut result: u64 = 0;
        let mut shift = 0;
        loop {
            let b = self.read_byte()?;
            if shift >= 64 {
                return Err(BinaryError::IntegerTooLarge);
            }
            result |= u64::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    pub fn read_vu32(&mut self) -> Result<u32, BinaryError> {
        u32::try_from(self.read_vu64()?).map_err(|_| BinaryError::IntegerTooLarge)
    }

    pub fn read_name(&mut self) -> Result<&'a str, BinaryError> {
        let len = self.read_vu32()? as usize;
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes).map_err(|_| BinaryError::BadName)
    }
}

/// A raw section: id and payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section<'a> {
    pub id: u8,
    pub payload: &'a [u8],
}

/// Split a module into its sections after checking the preamble.
pub fn sections(bytes: &[u8]) -> Result<Vec<Section<'_>>, BinaryError> {
    let mut reader = Reader::new(bytes);
    if reader.read_bytes(4).map_err(|_| BinaryError::BadMagic)? != MAGIC {
        return Err(BinaryError::BadMagic);
    }
    let version = LittleEndian::read_u32(reader.read_bytes(4)?);
    if version != VERSION {
        return Err(BinaryError::UnsupportedVersion(version));
    }

    let mut out = Vec::new();
    while !reader.at_end() {
        let id = reader.read_byte()?;
        let len = reader.read_vu32()? as usize;
        let payload = reader.read_bytes(len)?;
        out.push(Section { id, payload });
    }
    Ok(out)
}

/// Payload of the first custom section called `name`, without its name.
pub fn custom_section<'a>(bytes: &'a [u8], name: &str) -> Result<Option<&'a [u8]>, BinaryError> {
    for section in sections(bytes)? {
        if section.id != SECTION_CUSTOM {
            continue;
        }
        let mut reader = Reader::new(section.payload);
        if reader.read_name()? == name {
            return Ok(Some(&section.payload[reader.pos..]));
        }
    }
    Ok(None)
}

/// Names of the modules `bytes` imports from, deduplicated, in order of
/// first appearance.
pub fn import_modules(bytes: &[u8]) -> Result<Vec<String>, BinaryError> {
    let mut modules: Vec<String> = Vec::new();
    for section in sections(bytes)? {
        if section.id != SECTION_IMPORT {
            continue;
        }
        let mut reader = Reader::new(section.payload);
        let count = reader.read_vu32()?;
        for _ in 0..count {
            let module = reader.read_name()?;
            let _field = reader.read_name()?;
            skip_import_desc(&mut reader)?;
            if !modules.iter().any(|m| m == module) {
                modules.push(module.to_string());
            }
        }
    }
    Ok(modules)
}

fn skip_import_desc(reader: &mut Reader<'_>) -> Result<(), BinaryError> {
    match reader.read_byte()? {
        // func: type index
        0x00 => {
            reader.read_vu32()?;
        }
        // table: reftype + limits
        0x01 => {
            skip_reftype(reader)?;
            skip_limits(reader)?;
        }
        // memory
        0x02 => skip_limits(reader)?,
        // global: valtype + mutability
        0x03 => {
            skip_reftype(reader)?;
            reader.read_byte()?;
        }
        // tag: attribute + type index
        0x04 => {
            reader.read_byte()?;
            reader.read_vu32()?;
        }
        kind => return Err(BinaryError::UnknownImportKind(kind)),
    }
    Ok(())
}

fn skip_reftype(reader: &mut Reader<'_>) -> Result<(), BinaryError> {
    // (ref ht) and (ref null ht) carry a heap type as an s33
    if let 0x63 | 0x64 = reader.read_byte()? {
        reader.read_vu64()?;
    }
    Ok(())
}

fn skip_limits(reader: &mut Reader<'_>) -> Result<(), BinaryError> {
    let flags = reader.read_byte()?;
    reader.read_vu64()?;
    if flags & 0x01 != 0 {
        reader.read_vu64()?;
    }
    if flags & 0x08 != 0 {
        // custom page size, log2
        reader.read_vu32()?;
    }
    Ok(())
}
