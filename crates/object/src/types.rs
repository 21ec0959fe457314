//! In-memory representation of a relocatable object, static library, or executable.

use bitflags::bitflags;

/// `"BSMO"`: the 4-byte magic distinguishing this object format.
pub const MAGIC: [u8; 4] = *b"BSMO";

/// Distinguishes the purpose of an object file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileType {
    Relocatable = 0,
    StaticLibrary = 1,
    Executable = 2,
}

impl FileType {
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(FileType::Relocatable),
            1 => Some(FileType::StaticLibrary),
            2 => Some(FileType::Executable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    pub endian: basm_core::data::Endian,
    pub abi_version: u8,
    pub arch: u8,
    pub file_type: FileType,
}

impl Default for ObjectHeader {
    fn default() -> Self {
        Self { endian: basm_core::data::Endian::Little, abi_version: 1, arch: 0, file_type: FileType::Relocatable }
    }
}

bitflags! {
    /// Per-section attributes, mirroring the teacher's `orthrus_jsystem::rarc::Flags` pattern.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u16 {
        const ALLOC = 0b0001;
        const WRITE = 0b0010;
        const EXEC  = 0b0100;
    }
}

/// A canonical section kind. `.symtab`/`.strtab`/`.rel.*` sections carry structured data that
/// [`crate::ObjectFile`] knows how to interpret; `.text`/`.data`/`.bss` are opaque bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Text,
    Data,
    Bss,
    SymTab,
    StrTab,
    RelText,
    RelData,
}

impl SectionKind {
    #[must_use]
    pub const fn canonical_name(self) -> &'static str {
        match self {
            SectionKind::Text => ".text",
            SectionKind::Data => ".data",
            SectionKind::Bss => ".bss",
            SectionKind::SymTab => ".symtab",
            SectionKind::StrTab => ".strtab",
            SectionKind::RelText => ".rel.text",
            SectionKind::RelData => ".rel.data",
        }
    }

    #[must_use]
    pub const fn raw(self) -> u8 {
        match self {
            SectionKind::Text => 0,
            SectionKind::Data => 1,
            SectionKind::Bss => 2,
            SectionKind::SymTab => 3,
            SectionKind::StrTab => 4,
            SectionKind::RelText => 5,
            SectionKind::RelData => 6,
        }
    }

    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(SectionKind::Text),
            1 => Some(SectionKind::Data),
            2 => Some(SectionKind::Bss),
            3 => Some(SectionKind::SymTab),
            4 => Some(SectionKind::StrTab),
            5 => Some(SectionKind::RelText),
            6 => Some(SectionKind::RelData),
            _ => None,
        }
    }
}

/// A section as it appears on disk: a name, a kind, flags, raw bytes, and an alignment.
/// `.bss` stores its length via `data.len()` without occupying file space for zero bytes (the
/// serializer still walks it like any other section; only its *contents* are conceptually absent
/// at runtime, materialized as zeroes by the loader).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub kind: SectionKind,
    pub flags: SectionFlags,
    pub data: Vec<u8>,
    pub align: u32,
}

impl Section {
    #[must_use]
    pub fn new(kind: SectionKind, flags: SectionFlags, data: Vec<u8>, align: u32) -> Self {
        Self { name: kind.canonical_name().to_string(), kind, flags, data, align }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Local,
    Weak,
    Global,
}

impl Binding {
    #[must_use]
    pub const fn raw(self) -> u8 {
        match self {
            Binding::Local => 0,
            Binding::Weak => 1,
            Binding::Global => 2,
        }
    }

    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Binding::Local),
            1 => Some(Binding::Weak),
            2 => Some(Binding::Global),
            _ => None,
        }
    }
}

/// A symbol table entry. `section` is `None` for an undefined (external) symbol, matching the
/// on-disk sentinel section index of `-1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub binding: Binding,
    pub section: Option<u16>,
    pub value: u32,
    pub scope_id: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    Abs32,
    Abs16,
    Abs8,
    PcRel24,
}

impl RelocKind {
    #[must_use]
    pub const fn raw(self) -> u8 {
        match self {
            RelocKind::Abs32 => 0,
            RelocKind::Abs16 => 1,
            RelocKind::Abs8 => 2,
            RelocKind::PcRel24 => 3,
        }
    }

    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(RelocKind::Abs32),
            1 => Some(RelocKind::Abs16),
            2 => Some(RelocKind::Abs8),
            3 => Some(RelocKind::PcRel24),
            _ => None,
        }
    }
}

/// A relocation entry: patch `kind`-width bits at `offset` within its owning section, computed
/// from the resolved symbol `S`, the stored `addend` `A`, and (for PC-relative kinds) the patch
/// site's final address `P`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub offset: u32,
    pub symbol: u32,
    pub kind: RelocKind,
    pub addend: i32,
}
