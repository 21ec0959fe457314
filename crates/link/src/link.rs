//! Static linker: pulls in archive members that satisfy undefined externs, lays out a flat
//! text/data/bss image, resolves every symbol reference, and applies relocations in place.

use hashbrown::HashMap;
use snafu::prelude::*;

use basm_cpu::encoding;
use basm_object::{
    Binding, FileType, ObjectFile, ObjectHeader, RelocKind, Relocation, Section, SectionFlags, SectionKind, StaticLibrary,
};

#[derive(Debug, Snafu, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("symbol '{name}' is defined more than once"))]
    DuplicateSymbol { name: String },
    #[snafu(display("undefined reference to '{name}'"))]
    Unresolved { name: String },
    #[snafu(display("relocation for '{name}' ({kind:?}) does not fit in its field"))]
    RelocOverflow { name: String, kind: RelocKind },
}
pub type Result<T> = core::result::Result<T, Error>;

/// Default load address of `.text`: one page in, leaving page 0 an always-faulting guard page.
pub const DEFAULT_ENTRY: u32 = 0x0000_1000;

fn align_up(value: u32, align: u32) -> u32 {
    if align <= 1 {
        value
    } else {
        (value + align - 1) / align * align
    }
}

#[derive(Debug, Clone, Copy)]
struct ResolvedSymbol {
    address: u32,
}

struct Placement {
    text_offset: u32,
    data_offset: u32,
    bss_offset: u32,
}

fn section_bytes(object: &ObjectFile, kind: SectionKind) -> &[u8] {
    object.section(kind).map(|s| s.data.as_slice()).unwrap_or(&[])
}

/// Expands `objects` with whichever archive members resolve an outstanding undefined global,
/// repeating to a fixed point the way a classic `ar`-style archive search does.
fn expand_libraries(mut objects: Vec<ObjectFile>, libraries: &[StaticLibrary]) -> Vec<ObjectFile> {
    loop {
        let mut undefined: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut defined: std::collections::HashSet<String> = std::collections::HashSet::new();
        for object in &objects {
            for symbol in &object.symbols {
                if symbol.section.is_some() && symbol.binding == Binding::Global {
                    defined.insert(symbol.name.clone());
                } else if symbol.section.is_none() {
                    undefined.insert(symbol.name.clone());
                }
            }
        }
        undefined.retain(|name| !defined.contains(name));
        if undefined.is_empty() {
            break;
        }

        let mut pulled_any = false;
        for lib in libraries {
            for member in &lib.members {
                let provides = member
                    .symbols
                    .iter()
                    .any(|s| s.binding == Binding::Global && s.section.is_some() && undefined.contains(&s.name));
                if provides {
                    log::debug!(
                        "pulling in archive member defining one of {:?}",
                        member.symbols.iter().filter(|s| s.binding == Binding::Global).map(|s| &s.name).collect::<Vec<_>>()
                    );
                    objects.push(member.clone());
                    pulled_any = true;
                }
            }
        }
        if !pulled_any {
            break;
        }
    }
    objects
}

/// Links `objects` (plus whatever `libraries` members are needed to satisfy undefined externs)
/// into a single executable image starting at `entry_default`.
///
/// # Errors
/// Returns every accumulated [`Error`] without writing any partial output, per the toolchain's
/// fail-fast linking policy.
pub fn link(objects: Vec<ObjectFile>, libraries: Vec<StaticLibrary>, entry_default: u32) -> Result<ObjectFile> {
    let objects = expand_libraries(objects, &libraries);

    let max_align = objects
        .iter()
        .flat_map(|o| o.sections.iter())
        .map(|s| s.align.max(1))
        .max()
        .unwrap_or(4);

    let mut merged_text = Vec::new();
    let mut merged_data = Vec::new();
    let mut merged_bss_size: u32 = 0;
    let mut placements = Vec::with_capacity(objects.len());

    for object in &objects {
        let text = section_bytes(object, SectionKind::Text);
        let data = section_bytes(object, SectionKind::Data);
        let bss_size = object.section(SectionKind::Bss).map(|s| s.data.len() as u32).unwrap_or(0);

        let text_offset = merged_text.len() as u32;
        merged_text.extend_from_slice(text);
        while merged_text.len() % 4 != 0 {
            merged_text.push(0);
        }

        let data_offset = merged_data.len() as u32;
        merged_data.extend_from_slice(data);
        while merged_data.len() as u32 % max_align != 0 {
            merged_data.push(0);
        }

        let bss_offset = merged_bss_size;
        merged_bss_size += bss_size;
        merged_bss_size = align_up(merged_bss_size, max_align);

        placements.push(Placement { text_offset, data_offset, bss_offset });
    }

    let text_base = entry_default;
    let data_base = align_up(text_base + merged_text.len() as u32, max_align);
    let bss_base = align_up(data_base + merged_data.len() as u32, max_align);

    let section_base = |kind: u16| -> u32 {
        match kind {
            0 => text_base,
            1 => data_base,
            2 => bss_base,
            _ => 0,
        }
    };
    let object_offset = |placement: &Placement, kind: u16| -> u32 {
        match kind {
            0 => placement.text_offset,
            1 => placement.data_offset,
            2 => placement.bss_offset,
            _ => 0,
        }
    };

    let mut errors = Vec::new();
    let mut globals: HashMap<String, ResolvedSymbol> = HashMap::new();
    for (object, placement) in objects.iter().zip(&placements) {
        for symbol in &object.symbols {
            let Some(section_idx) = symbol.section else { continue };
            if symbol.binding != Binding::Global {
                continue;
            }
            let address = section_base(section_idx) + object_offset(placement, section_idx) + symbol.value;
            if globals.insert(symbol.name.clone(), ResolvedSymbol { address }).is_some() {
                errors.push(Error::DuplicateSymbol { name: symbol.name.clone() });
            }
        }
    }

    for (object, placement) in objects.iter().zip(&placements) {
        for reloc in object.rel_text.iter() {
            if let Err(e) = apply(object, placement, reloc, &globals, &section_base, &object_offset, &mut merged_text, SectionKind::Text, text_base) {
                errors.push(e);
            }
        }
        for reloc in object.rel_data.iter() {
            if let Err(e) = apply(object, placement, reloc, &globals, &section_base, &object_offset, &mut merged_data, SectionKind::Data, data_base) {
                errors.push(e);
            }
        }
    }

    if !errors.is_empty() {
        return Err(errors.into_iter().next().unwrap());
    }

    let mut symbols: Vec<_> = globals
        .into_iter()
        .map(|(name, resolved)| basm_object::Symbol {
            name,
            binding: Binding::Global,
            section: Some(0),
            value: resolved.address,
            scope_id: None,
        })
        .collect();
    symbols.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(ObjectFile {
        header: ObjectHeader { file_type: FileType::Executable, ..ObjectHeader::default() },
        sections: vec![
            Section { name: ".text".into(), kind: SectionKind::Text, flags: SectionFlags::ALLOC | SectionFlags::EXEC, data: merged_text, align: 4 },
            Section { name: ".data".into(), kind: SectionKind::Data, flags: SectionFlags::ALLOC | SectionFlags::WRITE, data: merged_data, align: max_align },
            Section { name: ".bss".into(), kind: SectionKind::Bss, flags: SectionFlags::ALLOC | SectionFlags::WRITE, data: vec![0u8; merged_bss_size as usize], align: max_align },
        ],
        symbols,
        rel_text: Vec::new(),
        rel_data: Vec::new(),
    })
}

#[allow(clippy::too_many_arguments)]
fn apply(
    object: &ObjectFile,
    placement: &Placement,
    reloc: &Relocation,
    globals: &HashMap<String, ResolvedSymbol>,
    section_base: &impl Fn(u16) -> u32,
    object_offset: &impl Fn(&Placement, u16) -> u32,
    buf: &mut [u8],
    target_kind: SectionKind,
    target_base: u32,
) -> Result<()> {
    let symbol = &object.symbols[reloc.symbol as usize];
    let resolved_address = match symbol.section {
        Some(section_idx) => section_base(section_idx) + object_offset(placement, section_idx) + symbol.value,
        None => globals
            .get(&symbol.name)
            .map(|r| r.address)
            .context(UnresolvedSnafu { name: symbol.name.clone() })?,
    };

    let field_addr = target_base + object_offset(placement, target_kind as u16) + reloc.offset;
    let pos = (field_addr - target_base) as usize;
    let s = resolved_address as i64;
    let a = reloc.addend as i64;
    log::debug!("applying {:?} to '{}' at {field_addr:#010x} (symbol = {s:#010x})", reloc.kind, symbol.name);

    match reloc.kind {
        RelocKind::Abs32 => {
            let value = (s + a) as u32;
            buf[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
        }
        RelocKind::Abs16 => {
            let value = s + a;
            if !(0..=0xFFFF).contains(&value) && !(-0x8000..0).contains(&value) {
                return Err(Error::RelocOverflow { name: symbol.name.clone(), kind: reloc.kind });
            }
            buf[pos..pos + 2].copy_from_slice(&(value as u16).to_le_bytes());
        }
        RelocKind::Abs8 => {
            let value = s + a;
            if !(-0x80..=0xFF).contains(&value) {
                return Err(Error::RelocOverflow { name: symbol.name.clone(), kind: reloc.kind });
            }
            buf[pos] = value as u8;
        }
        RelocKind::PcRel24 => {
            let p = field_addr as i64 + 4;
            let delta = s + a - p;
            if delta % 4 != 0 {
                return Err(Error::RelocOverflow { name: symbol.name.clone(), kind: reloc.kind });
            }
            let word_offset = delta / 4;
            if !(-(1 << 23)..(1 << 23)).contains(&word_offset) {
                return Err(Error::RelocOverflow { name: symbol.name.clone(), kind: reloc.kind });
            }
            let existing = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
            let op = match encoding::decode(existing) {
                Ok(encoding::Instruction::Branch { op, .. }) => op,
                _ => return Err(Error::RelocOverflow { name: symbol.name.clone(), kind: reloc.kind }),
            };
            let patched = encoding::format_branch(op, word_offset as i32);
            buf[pos..pos + 4].copy_from_slice(&patched.to_le_bytes());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use basm_object::{Symbol, SectionFlags as SF};

    fn obj_with_branch_to_extern() -> ObjectFile {
        let mut text = encoding::format_branch(encoding::Opcode::Branch, 0).to_le_bytes().to_vec();
        text.extend_from_slice(&encoding::format_halt().to_le_bytes());
        ObjectFile {
            header: ObjectHeader::default(),
            sections: vec![
                Section { name: ".text".into(), kind: SectionKind::Text, flags: SF::ALLOC | SF::EXEC, data: text, align: 4 },
                Section { name: ".data".into(), kind: SectionKind::Data, flags: SF::ALLOC | SF::WRITE, data: vec![], align: 4 },
                Section { name: ".bss".into(), kind: SectionKind::Bss, flags: SF::ALLOC | SF::WRITE, data: vec![], align: 4 },
            ],
            symbols: vec![Symbol { name: "target".into(), binding: Binding::Local, section: None, value: 0, scope_id: None }],
            rel_text: vec![Relocation { offset: 0, symbol: 0, kind: RelocKind::PcRel24, addend: 0 }],
            rel_data: vec![],
        }
    }

    fn obj_defining_target() -> ObjectFile {
        let text = encoding::format_halt().to_le_bytes().to_vec();
        ObjectFile {
            header: ObjectHeader::default(),
            sections: vec![
                Section { name: ".text".into(), kind: SectionKind::Text, flags: SF::ALLOC | SF::EXEC, data: text, align: 4 },
                Section { name: ".data".into(), kind: SectionKind::Data, flags: SF::ALLOC | SF::WRITE, data: vec![], align: 4 },
                Section { name: ".bss".into(), kind: SectionKind::Bss, flags: SF::ALLOC | SF::WRITE, data: vec![], align: 4 },
            ],
            symbols: vec![Symbol { name: "target".into(), binding: Binding::Global, section: Some(0), value: 0, scope_id: None }],
            rel_text: vec![],
            rel_data: vec![],
        }
    }

    #[test]
    fn resolves_cross_object_branch() {
        let result = link(vec![obj_with_branch_to_extern(), obj_defining_target()], vec![], DEFAULT_ENTRY).unwrap();
        let text = &result.section(SectionKind::Text).unwrap().data;
        let word = u32::from_le_bytes(text[0..4].try_into().unwrap());
        match encoding::decode(word).unwrap() {
            encoding::Instruction::Branch { offset, .. } => {
                // target is 2 words after the branch instruction (branch + halt + halt).
                assert_eq!(offset, 1);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn unresolved_extern_is_reported() {
        let err = link(vec![obj_with_branch_to_extern()], vec![], DEFAULT_ENTRY).unwrap_err();
        assert_eq!(err, Error::Unresolved { name: "target".into() });
    }

    #[test]
    fn duplicate_global_definition_is_reported() {
        let err = link(vec![obj_defining_target(), obj_defining_target()], vec![], DEFAULT_ENTRY).unwrap_err();
        assert_eq!(err, Error::DuplicateSymbol { name: "target".into() });
    }
}
