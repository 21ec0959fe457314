//! Canonical on-disk layout: header, then section header table, then section contents in
//! section-header order, each aligned to its declared alignment. Mirrors how the teacher's
//! `orthrus_jsystem::rarc::ResourceArchive::read_header` reads a magic, validates it with
//! `ensure!(... InvalidMagicSnafu)`, then walks fixed fields in order.

use basm_core::data::{DataCursor, Endian};
use snafu::prelude::*;

use crate::types::{Binding, FileType, ObjectHeader, RelocKind, Relocation, Section, SectionFlags, SectionKind, Symbol, MAGIC};
use crate::ObjectFile;

#[derive(Debug, Snafu, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Bad magic: expected {MAGIC:?}, found {found:?}"))]
    BadMagic { found: [u8; 4] },
    #[snafu(display("File is truncated: {source}"))]
    Truncated { source: basm_core::data::Error },
    #[snafu(display("Unsupported ABI version {version}"))]
    VersionMismatch { version: u8 },
    #[snafu(display("Unknown file type tag {tag}"))]
    UnknownFileType { tag: u8 },
    #[snafu(display("Unknown section kind tag {tag}"))]
    UnknownSectionKind { tag: u8 },
    #[snafu(display("Unknown symbol binding tag {tag}"))]
    UnknownBinding { tag: u8 },
    #[snafu(display("Unknown relocation kind tag {tag}"))]
    UnknownRelocKind { tag: u8 },
    #[snafu(display("String table offset {offset} is out of range"))]
    BadStringOffset { offset: u32 },
}
pub type Result<T> = core::result::Result<T, Error>;

impl From<basm_core::data::Error> for Error {
    fn from(source: basm_core::data::Error) -> Self {
        Error::Truncated { source }
    }
}

const SUPPORTED_ABI_VERSION: u8 = 1;

fn align_up(value: u32, align: u32) -> u32 {
    if align <= 1 {
        value
    } else {
        (value + align - 1) / align * align
    }
}

fn read_cstr_at(strtab: &[u8], offset: u32) -> Result<String> {
    let start = offset as usize;
    let end = strtab[start..].iter().position(|&b| b == 0).map(|p| start + p).ok_or(Error::BadStringOffset { offset })?;
    Ok(String::from_utf8_lossy(&strtab[start..end]).into_owned())
}

/// Interns strings into a growable `.strtab` buffer, returning each string's byte offset.
#[derive(Default)]
struct StringTableBuilder {
    bytes: Vec<u8>,
}

impl StringTableBuilder {
    fn intern(&mut self, s: &str) -> u32 {
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(s.as_bytes());
        self.bytes.push(0);
        offset
    }
}

impl ObjectFile {
    /// Serializes this object into its canonical byte representation.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut strtab = StringTableBuilder::default();

        let mut symtab_bytes = Vec::new();
        for sym in &self.symbols {
            let name_ofs = strtab.intern(&sym.name);
            symtab_bytes.extend_from_slice(&name_ofs.to_le_bytes());
            symtab_bytes.extend_from_slice(&sym.value.to_le_bytes());
            symtab_bytes.extend_from_slice(&sym.section.map(|s| s as i16).unwrap_or(-1).to_le_bytes());
            symtab_bytes.push(sym.binding.raw());
            symtab_bytes.extend_from_slice(&sym.scope_id.unwrap_or(-1).to_le_bytes());
        }

        let reloc_bytes = |relocs: &[Relocation]| -> Vec<u8> {
            let mut buf = Vec::new();
            for r in relocs {
                buf.extend_from_slice(&r.offset.to_le_bytes());
                buf.extend_from_slice(&r.symbol.to_le_bytes());
                buf.push(r.kind.raw());
                buf.extend_from_slice(&r.addend.to_le_bytes());
            }
            buf
        };

        let mut sections = self.sections.clone();
        sections.push(Section::new(SectionKind::SymTab, SectionFlags::empty(), symtab_bytes, 4));
        sections.push(Section::new(SectionKind::RelText, SectionFlags::empty(), reloc_bytes(&self.rel_text), 4));
        sections.push(Section::new(SectionKind::RelData, SectionFlags::empty(), reloc_bytes(&self.rel_data), 4));
        // The string table's own name must be interned into itself, so its placeholder (with
        // empty data) goes in before the name-interning pass runs over every section.
        sections.push(Section::new(SectionKind::StrTab, SectionFlags::empty(), Vec::new(), 1));
        let strtab_index = sections.len() - 1;
        let section_name_offsets: Vec<u32> = sections.iter().map(|s| strtab.intern(&s.name)).collect();
        sections[strtab_index].data = strtab.bytes;

        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC);
        out.push(match self.header.endian {
            Endian::Little => 0,
            Endian::Big => 1,
        });
        out.push(self.header.abi_version);
        out.push(self.header.arch);
        out.push(self.header.file_type as u8);
        out.extend_from_slice(&(sections.len() as u16).to_le_bytes());

        let header_len = out.len();
        let table_len = sections.len() * 19; // name_ofs:4 + kind:1 + flags:2 + align:4 + offset:4 + size:4
        let mut offset = align_up((header_len + table_len) as u32, 4);
        let mut headers = Vec::new();
        let mut bodies = Vec::new();
        for (i, section) in sections.iter().enumerate() {
            let aligned = align_up(offset, section.align.max(1));
            let pad = aligned - offset;
            bodies.extend(std::iter::repeat(0u8).take(pad as usize));
            bodies.extend_from_slice(&section.data);

            headers.extend_from_slice(&section_name_offsets[i].to_le_bytes());
            headers.push(section.kind.raw());
            headers.extend_from_slice(&section.flags.bits().to_le_bytes());
            headers.extend_from_slice(&section.align.to_le_bytes());
            headers.extend_from_slice(&aligned.to_le_bytes());
            headers.extend_from_slice(&(section.data.len() as u32).to_le_bytes());

            offset = aligned + section.data.len() as u32;
        }

        out.extend_from_slice(&headers);
        let body_start = out.len() as u32;
        let wanted_start = align_up(out.len() as u32, 4);
        out.extend(std::iter::repeat(0u8).take((wanted_start - body_start) as usize));
        out.extend_from_slice(&bodies);
        out
    }

    /// Parses an object from its canonical byte representation.
    ///
    /// # Errors
    /// See [`Error`] for every rejection kind: bad magic, unsupported ABI version, truncation, or
    /// an unrecognized tag for file type / section kind / binding / relocation kind.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = DataCursor::new(bytes.to_vec().into_boxed_slice(), Endian::Little);
        let mut magic = [0u8; 4];
        for byte in &mut magic {
            *byte = reader.read_u8()?;
        }
        ensure!(magic == MAGIC, BadMagicSnafu { found: magic });

        let endian_tag = reader.read_u8()?;
        let endian = if endian_tag == 0 { Endian::Little } else { Endian::Big };
        let abi_version = reader.read_u8()?;
        ensure!(abi_version == SUPPORTED_ABI_VERSION, VersionMismatchSnafu { version: abi_version });
        let arch = reader.read_u8()?;
        let file_type_tag = reader.read_u8()?;
        let file_type = FileType::from_raw(file_type_tag).ok_or(Error::UnknownFileType { tag: file_type_tag })?;
        let section_count = reader.read_u16()?;

        struct RawHeader {
            name_ofs: u32,
            kind: SectionKind,
            flags: SectionFlags,
            align: u32,
            offset: u32,
            size: u32,
        }
        let mut raw_headers = Vec::with_capacity(section_count as usize);
        for _ in 0..section_count {
            let name_ofs = reader.read_u32()?;
            let kind_tag = reader.read_u8()?;
            let kind = SectionKind::from_raw(kind_tag).ok_or(Error::UnknownSectionKind { tag: kind_tag })?;
            let flags = SectionFlags::from_bits_truncate(reader.read_u16()?);
            let align = reader.read_u32()?;
            let offset = reader.read_u32()?;
            let size = reader.read_u32()?;
            raw_headers.push(RawHeader { name_ofs, kind, flags, align, offset, size });
        }

        let strtab_raw = raw_headers
            .iter()
            .find(|h| h.kind == SectionKind::StrTab)
            .ok_or(Error::Truncated { source: basm_core::data::Error::EndOfFile })?;
        let strtab_bytes = &bytes[strtab_raw.offset as usize..(strtab_raw.offset + strtab_raw.size) as usize];

        let mut sections = Vec::new();
        let mut symbols = Vec::new();
        let mut rel_text = Vec::new();
        let mut rel_data = Vec::new();
        for raw in &raw_headers {
            let body = &bytes[raw.offset as usize..(raw.offset + raw.size) as usize];
            let name = read_cstr_at(strtab_bytes, raw.name_ofs)?;
            match raw.kind {
                SectionKind::SymTab => {
                    let mut cursor = DataCursorRefHelper::new(body);
                    while cursor.remaining() >= 15 {
                        let name_ofs = cursor.read_u32();
                        let value = cursor.read_u32();
                        let section_idx = cursor.read_i16();
                        let binding_tag = cursor.read_u8();
                        let scope_id = cursor.read_i32();
                        let binding = Binding::from_raw(binding_tag).ok_or(Error::UnknownBinding { tag: binding_tag })?;
                        symbols.push(Symbol {
                            name: read_cstr_at(strtab_bytes, name_ofs)?,
                            binding,
                            section: if section_idx < 0 { None } else { Some(section_idx as u16) },
                            value,
                            scope_id: if scope_id < 0 { None } else { Some(scope_id) },
                        });
                    }
                }
                SectionKind::RelText | SectionKind::RelData => {
                    let mut cursor = DataCursorRefHelper::new(body);
                    let target = if raw.kind == SectionKind::RelText { &mut rel_text } else { &mut rel_data };
                    while cursor.remaining() >= 13 {
                        let offset = cursor.read_u32();
                        let symbol = cursor.read_u32();
                        let kind_tag = cursor.read_u8();
                        let addend = cursor.read_i32();
                        let kind = RelocKind::from_raw(kind_tag).ok_or(Error::UnknownRelocKind { tag: kind_tag })?;
                        target.push(Relocation { offset, symbol, kind, addend });
                    }
                }
                SectionKind::StrTab => {}
                _ => {
                    sections.push(Section { name, kind: raw.kind, flags: raw.flags, data: body.to_vec(), align: raw.align });
                }
            }
        }

        Ok(ObjectFile {
            header: ObjectHeader { endian, abi_version, arch, file_type },
            sections,
            symbols,
            rel_text,
            rel_data,
        })
    }
}

/// Minimal forward-only byte reader over a borrowed slice, used for the fixed-width records
/// packed inside `.symtab`/`.rel.*` section bodies (kept separate from `DataCursor` since these
/// records are read as flat repeating structs, not a general seekable stream).
struct DataCursorRefHelper<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> DataCursorRefHelper<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn read_u8(&mut self) -> u8 {
        let v = self.bytes[self.pos];
        self.pos += 1;
        v
    }

    fn read_u32(&mut self) -> u32 {
        let v = u32::from_le_bytes(self.bytes[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        v
    }

    fn read_i32(&mut self) -> i32 {
        self.read_u32() as i32
    }

    fn read_i16(&mut self) -> i16 {
        let v = i16::from_le_bytes(self.bytes[self.pos..self.pos + 2].try_into().unwrap());
        self.pos += 2;
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Binding, Section, SectionFlags, SectionKind};
    use crate::ObjectFile;

    #[test]
    fn round_trips_a_minimal_object() {
        let object = ObjectFile {
            header: ObjectHeader::default(),
            sections: vec![
                Section::new(SectionKind::Text, SectionFlags::ALLOC | SectionFlags::EXEC, vec![1, 2, 3, 4], 4),
                Section::new(SectionKind::Data, SectionFlags::ALLOC | SectionFlags::WRITE, vec![9, 9], 4),
            ],
            symbols: vec![Symbol {
                name: "main".into(),
                binding: Binding::Global,
                section: Some(0),
                value: 0,
                scope_id: None,
            }],
            rel_text: vec![Relocation { offset: 0, symbol: 0, kind: RelocKind::PcRel24, addend: 0 }],
            rel_data: vec![],
        };

        let bytes = object.to_bytes();
        let parsed = ObjectFile::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.header.file_type, object.header.file_type);
        assert_eq!(parsed.sections, object.sections);
        assert_eq!(parsed.symbols, object.symbols);
        assert_eq!(parsed.rel_text, object.rel_text);
        assert_eq!(parsed.rel_data, object.rel_data);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = ObjectFile {
            header: ObjectHeader::default(),
            sections: vec![],
            symbols: vec![],
            rel_text: vec![],
            rel_data: vec![],
        }
        .to_bytes();
        bytes[0] = b'X';
        assert!(matches!(ObjectFile::from_bytes(&bytes), Err(Error::BadMagic { .. })));
    }
}
