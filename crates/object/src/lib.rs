//! Relocatable object, static library, and executable file format for the `basm` toolchain.

pub mod archive;
pub mod prelude;
pub mod serialize;
pub mod types;

pub use archive::StaticLibrary;
pub use types::{Binding, FileType, ObjectHeader, RelocKind, Relocation, Section, SectionFlags, SectionKind, Symbol};

/// A single `.bo`/`.bexe` image: header, loadable sections, symbol table, and per-target-section
/// relocation lists. `.symtab`/`.strtab`/`.rel.*` are represented as first-class fields rather
/// than opaque sections in memory (the assembler and linker work with `Symbol`/`Relocation`
/// values directly); [`serialize`] re-expands them into sections only at the on-disk boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectFile {
    pub header: ObjectHeader,
    pub sections: Vec<Section>,
    pub symbols: Vec<Symbol>,
    pub rel_text: Vec<Relocation>,
    pub rel_data: Vec<Relocation>,
}

impl ObjectFile {
    /// Finds an existing section by kind.
    #[must_use]
    pub fn section(&self, kind: SectionKind) -> Option<&Section> {
        self.sections.iter().find(|s| s.kind == kind)
    }

    #[must_use]
    pub fn section_mut(&mut self, kind: SectionKind) -> Option<&mut Section> {
        self.sections.iter_mut().find(|s| s.kind == kind)
    }
}
