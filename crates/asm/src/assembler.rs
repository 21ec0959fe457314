//! Two-pass assembler: pass 1 lays out sections and records labels, pass 2 resolves operands and
//! emits instruction/data bytes plus relocations for anything still unresolved.

use hashbrown::HashMap;

use basm_cpu::encoding::{self, AddrMode, MemOperand, Opcode, ShiftAmount, ShiftType};
use basm_object::{Binding, ObjectFile, ObjectHeader, RelocKind, Relocation, Section, SectionFlags, SectionKind, Symbol};

use crate::lexer::{self, IntRadix, Token, TokenKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Syntax,
    UndefDirective,
    WrongSection,
    BadAlign,
    DuplicateLabel,
    UnmatchedScend,
    ExprOverflow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub kind: ErrorKind,
    pub message: String,
    pub line: u32,
    pub column: u32,
}

impl Diagnostic {
    fn new(kind: ErrorKind, message: impl Into<String>, line: u32, column: u32) -> Self {
        Self { kind, message: message.into(), line, column }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CurrentSection {
    None,
    Text,
    Data,
    Bss,
}

impl CurrentSection {
    fn kind(self) -> Option<SectionKind> {
        match self {
            CurrentSection::None => None,
            CurrentSection::Text => Some(SectionKind::Text),
            CurrentSection::Data => Some(SectionKind::Data),
            CurrentSection::Bss => Some(SectionKind::Bss),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LabelInfo {
    section: Option<CurrentSection>,
    offset: u32,
    scope_id: Option<i32>,
}

/// One `key, value` operand pair parsed from a source line: the label/directive head plus the
/// remaining significant tokens (whitespace, comments, and the trailing newline stripped).
struct Line<'t> {
    label: Option<&'t Token>,
    head: Option<&'t Token>,
    rest: Vec<&'t Token>,
    line: u32,
}

fn split_lines<'t>(tokens: &'t [Token]) -> Vec<Line<'t>> {
    let significant: Vec<&Token> =
        tokens.iter().filter(|t| !matches!(t.kind, TokenKind::Whitespace | TokenKind::Comment)).collect();

    let mut lines = Vec::new();
    let mut current: Vec<&Token> = Vec::new();
    for tok in significant {
        if tok.kind == TokenKind::Newline {
            if !current.is_empty() {
                lines.push(build_line(std::mem::take(&mut current)));
            }
        } else {
            current.push(tok);
        }
    }
    if !current.is_empty() {
        lines.push(build_line(current));
    }
    lines
}

fn build_line(mut toks: Vec<&Token>) -> Line<'_> {
    let line_no = toks[0].line;
    let mut label = None;
    // `identifier :` at the start of a line is a label definition.
    if toks.len() >= 2 && toks[0].kind == TokenKind::Identifier && is_punct(toks[1], b":") {
        label = Some(toks[0]);
        toks.drain(0..2);
    }
    let head = toks.first().copied();
    let rest = if toks.is_empty() { Vec::new() } else { toks[1..].to_vec() };
    Line { label, head, rest, line: line_no }
}

fn is_punct(tok: &Token, text: &[u8]) -> bool {
    tok.kind == TokenKind::Punctuator && tok.lexeme.len() == text.len()
}

fn tok_text<'a>(src: &'a [u8], tok: &Token) -> &'a [u8] {
    tok.text(src)
}

fn tok_eq_ci(src: &[u8], tok: &Token, word: &str) -> bool {
    let text = tok_text(src, tok);
    text.eq_ignore_ascii_case(word.as_bytes())
}

fn parse_int_literal(src: &[u8], tok: &Token) -> Option<i64> {
    let TokenKind::IntLiteral(radix) = tok.kind else { return None };
    let text = tok_text(src, tok);
    let (digits, radix_num): (&[u8], u32) = match radix {
        IntRadix::Decimal => (text, 10),
        IntRadix::Hex => {
            if text.starts_with(b"0x") || text.starts_with(b"0X") {
                (&text[2..], 16)
            } else {
                (&text[1..], 16) // `$...`
            }
        }
        IntRadix::Binary => {
            if text.starts_with(b"0b") || text.starts_with(b"0B") {
                (&text[2..], 2)
            } else {
                (&text[1..], 2) // `%...`
            }
        }
        IntRadix::Octal => (text, 8),
    };
    let s = std::str::from_utf8(digits).ok()?;
    i64::from_str_radix(s, radix_num).ok()
}

fn parse_register(src: &[u8], tok: &Token) -> Option<u8> {
    if tok.kind != TokenKind::Register {
        return None;
    }
    let text = tok_text(src, tok);
    std::str::from_utf8(&text[1..]).ok()?.parse().ok()
}

/// Strictly left-to-right `+ - * /` evaluation over a flat token slice, per the expression rule:
/// precedence is explicitly not implemented, matching the source toolchain's own documented
/// shortcut.
fn eval_expr(src: &[u8], toks: &[&Token]) -> Option<i64> {
    if toks.is_empty() {
        return None;
    }
    let mut acc = parse_int_literal(src, toks[0])?;
    let mut i = 1;
    while i + 1 < toks.len() + 1 && i < toks.len() {
        let op = toks[i];
        if op.kind != TokenKind::Operator {
            break;
        }
        let rhs = parse_int_literal(src, *toks.get(i + 1)?)?;
        let op_byte = tok_text(src, op)[0];
        acc = match op_byte {
            b'+' => acc.wrapping_add(rhs),
            b'-' => acc.wrapping_sub(rhs),
            b'*' => acc.wrapping_mul(rhs),
            b'/' if rhs != 0 => acc / rhs,
            _ => return None,
        };
        i += 2;
    }
    Some(acc)
}

const TEXT_ALIGN: u32 = 4;

struct Assembler<'a> {
    src: &'a [u8],
    diagnostics: Vec<Diagnostic>,
    text: Vec<u8>,
    data: Vec<u8>,
    bss_size: u32,
    labels: HashMap<String, LabelInfo>,
    scope_stack: Vec<i32>,
    next_scope_id: i32,
}

impl<'a> Assembler<'a> {
    fn error(&mut self, kind: ErrorKind, message: impl Into<String>, line: u32) {
        self.diagnostics.push(Diagnostic::new(kind, message, line, 0));
    }

    fn current_scope(&self) -> Option<i32> {
        self.scope_stack.last().copied()
    }
}

fn log_and_return(diagnostics: Vec<Diagnostic>) -> Vec<Diagnostic> {
    for d in &diagnostics {
        log::info!("{:?} at line {}: {}", d.kind, d.line, d.message);
    }
    diagnostics
}

fn directive_name(name: &str) -> &str {
    // `.sbyte`/`.sdbyte`/`.sword`/`.sdword` are preserved as synonyms for the unsigned forms;
    // the core only ever stores raw little-endian bytes, so the signedness distinction is
    // purely a source-level convenience.
    match name {
        ".sbyte" => ".byte",
        ".sdbyte" => ".dbyte",
        ".sword" => ".word",
        ".sdword" => ".dword",
        other => other,
    }
}

/// Assembles a complete `.basm` source buffer into a relocatable [`ObjectFile`].
///
/// # Errors
/// Returns every accumulated [`Diagnostic`] if assembly failed; per spec's fail-soft policy,
/// pass 1 and pass 2 both keep going after an error to surface as many as possible in one run.
pub fn assemble(src: &[u8]) -> Result<ObjectFile, Vec<Diagnostic>> {
    let tokens = match lexer::tokenize(src) {
        Ok(tokens) => tokens,
        Err(e) => return Err(vec![Diagnostic::new(ErrorKind::Syntax, e.to_string(), 1, 0)]),
    };
    let lines = split_lines(&tokens);

    let mut asm = Assembler {
        src,
        diagnostics: Vec::new(),
        text: Vec::new(),
        data: Vec::new(),
        bss_size: 0,
        labels: HashMap::new(),
        scope_stack: Vec::new(),
        next_scope_id: 1,
    };

    layout_pass(&mut asm, &lines);
    let (rel_text, rel_data, global_names) = emit_pass(&mut asm, &lines);

    if !asm.diagnostics.is_empty() {
        return Err(log_and_return(asm.diagnostics));
    }

    let mut symbols: Vec<Symbol> = asm
        .labels
        .iter()
        .map(|(name, info)| Symbol {
            name: name.clone(),
            binding: if global_names.contains(name) { Binding::Global } else { Binding::Local },
            section: info.section.and_then(CurrentSection::kind).map(|k| match k {
                SectionKind::Text => 0,
                SectionKind::Data => 1,
                SectionKind::Bss => 2,
                _ => unreachable!(),
            }),
            value: info.offset,
            scope_id: info.scope_id,
        })
        .collect();
    symbols.sort_by(|a, b| a.name.cmp(&b.name));

    let (rel_text, rel_data) = {
        let symbol_index: HashMap<&str, u32> =
            symbols.iter().enumerate().map(|(i, s)| (s.name.as_str(), i as u32)).collect();
        let resolve_pending = |asm: &mut Assembler, pending: Vec<PendingReloc>| -> Vec<Relocation> {
            pending
                .into_iter()
                .filter_map(|p| match symbol_index.get(p.symbol_name.as_str()) {
                    Some(&symbol) => Some(Relocation { offset: p.offset, symbol, kind: p.kind, addend: p.addend }),
                    None => {
                        asm.error(ErrorKind::Syntax, format!("undefined symbol '{}'", p.symbol_name), 0);
                        None
                    }
                })
                .collect()
        };
        let rel_text = resolve_pending(&mut asm, rel_text);
        let rel_data = resolve_pending(&mut asm, rel_data);
        (rel_text, rel_data)
    };

    if !asm.diagnostics.is_empty() {
        return Err(log_and_return(asm.diagnostics));
    }

    Ok(ObjectFile {
        header: ObjectHeader::default(),
        sections: vec![
            Section::new(SectionKind::Text, SectionFlags::ALLOC | SectionFlags::EXEC, asm.text, TEXT_ALIGN),
            Section::new(SectionKind::Data, SectionFlags::ALLOC | SectionFlags::WRITE, asm.data, 4),
            Section::new(SectionKind::Bss, SectionFlags::ALLOC | SectionFlags::WRITE, vec![0u8; asm.bss_size as usize], 4),
        ],
        symbols,
        rel_text,
        rel_data,
    })
}

fn layout_pass(asm: &mut Assembler, lines: &[Line]) {
    let mut section = CurrentSection::None;
    let mut text_ptr = 0u32;
    let mut data_ptr = 0u32;
    let mut bss_ptr = 0u32;

    for line in lines {
        if let Some(label) = line.label {
            let name = String::from_utf8_lossy(tok_text(asm.src, label)).into_owned();
            if asm.labels.contains_key(&name) {
                asm.error(ErrorKind::DuplicateLabel, format!("label '{name}' redefined"), line.line);
            } else {
                let offset = match section {
                    CurrentSection::None => 0,
                    CurrentSection::Text => text_ptr,
                    CurrentSection::Data => data_ptr,
                    CurrentSection::Bss => bss_ptr,
                };
                asm.labels.insert(
                    name,
                    LabelInfo {
                        section: if section == CurrentSection::None { None } else { Some(section) },
                        offset,
                        scope_id: asm.current_scope(),
                    },
                );
            }
        }

        let Some(head) = line.head else { continue };
        match head.kind {
            TokenKind::Directive => {
                let raw_name = String::from_utf8_lossy(tok_text(asm.src, head)).to_lowercase();
                let name = directive_name(&raw_name).to_string();
                match name.as_str() {
                    ".global" | ".extern" => {}
                    ".text" => section = CurrentSection::Text,
                    ".data" => section = CurrentSection::Data,
                    ".bss" => section = CurrentSection::Bss,
                    ".scope" => {
                        let id = asm.next_scope_id;
                        asm.next_scope_id += 1;
                        asm.scope_stack.push(id);
                    }
                    ".scend" => {
                        if asm.scope_stack.pop().is_none() {
                            asm.error(ErrorKind::UnmatchedScend, "'.scend' with no matching '.scope'", line.line);
                        }
                    }
                    ".org" | ".advance" => {
                        if section == CurrentSection::None {
                            asm.error(ErrorKind::WrongSection, format!("'{name}' outside any section"), line.line);
                            continue;
                        }
                        let Some(value) = eval_expr(asm.src, &line.rest) else {
                            asm.error(ErrorKind::Syntax, format!("'{name}' expects a constant expression"), line.line);
                            continue;
                        };
                        let ptr = match section {
                            CurrentSection::Text => &mut text_ptr,
                            CurrentSection::Data => &mut data_ptr,
                            CurrentSection::Bss => &mut bss_ptr,
                            CurrentSection::None => unreachable!(),
                        };
                        let target = if name == ".org" { value as u32 } else { ptr.wrapping_add(value as u32) };
                        if target < *ptr {
                            asm.error(ErrorKind::BadAlign, format!("'{name}' may not move the section pointer backward"), line.line);
                            continue;
                        }
                        if section == CurrentSection::Text && target % TEXT_ALIGN != 0 {
                            asm.error(ErrorKind::BadAlign, "'.text' must remain 4-byte aligned", line.line);
                            continue;
                        }
                        *ptr = target;
                    }
                    ".align" => {
                        if section == CurrentSection::None {
                            asm.error(ErrorKind::WrongSection, "'.align' outside any section", line.line);
                            continue;
                        }
                        let Some(value) = eval_expr(asm.src, &line.rest) else {
                            asm.error(ErrorKind::Syntax, "'.align' expects a constant expression", line.line);
                            continue;
                        };
                        let n = value as u32;
                        if n == 0 || (n & (n - 1)) != 0 {
                            if section == CurrentSection::Text {
                                asm.error(ErrorKind::BadAlign, "'.align' in '.text' requires a power of two", line.line);
                                continue;
                            }
                        }
                        let ptr = match section {
                            CurrentSection::Text => &mut text_ptr,
                            CurrentSection::Data => &mut data_ptr,
                            CurrentSection::Bss => &mut bss_ptr,
                            CurrentSection::None => unreachable!(),
                        };
                        *ptr = (*ptr + n - 1) / n * n;
                    }
                    ".byte" | ".dbyte" | ".word" | ".dword" => {
                        if section != CurrentSection::Data {
                            asm.error(ErrorKind::WrongSection, format!("'{name}' is only valid in '.data'"), line.line);
                            continue;
                        }
                        let width = directive_width(&name);
                        let count = count_operands(&line.rest).max(1);
                        data_ptr += width * count as u32;
                    }
                    ".ascii" | ".asciz" => {
                        if section != CurrentSection::Data {
                            asm.error(ErrorKind::WrongSection, format!("'{name}' is only valid in '.data'"), line.line);
                            continue;
                        }
                        if let Some(tok) = line.rest.first() {
                            let len = tok.lexeme.len().saturating_sub(2);
                            data_ptr += len as u32 + if name == ".asciz" { 1 } else { 0 };
                        }
                    }
                    ".stop" => break,
                    _ => asm.error(ErrorKind::UndefDirective, format!("unknown directive '{name}'"), line.line),
                }
            }
            TokenKind::Identifier => {
                if section != CurrentSection::Text {
                    asm.error(ErrorKind::WrongSection, "instructions are only valid in '.text'", line.line);
                    continue;
                }
                text_ptr += 4;
            }
            _ => {}
        }
    }
}

fn directive_width(name: &str) -> u32 {
    match name {
        ".byte" => 1,
        ".dbyte" => 2,
        ".word" => 4,
        ".dword" => 8,
        _ => 0,
    }
}

fn count_operands(toks: &[&Token]) -> usize {
    if toks.is_empty() {
        return 0;
    }
    1 + toks.iter().filter(|t| is_punct(t, b",")).count()
}

fn split_operands<'t>(toks: &[&'t Token]) -> Vec<Vec<&'t Token>> {
    let mut groups = Vec::new();
    let mut current = Vec::new();
    for tok in toks {
        if is_punct(tok, b",") {
            groups.push(std::mem::take(&mut current));
        } else {
            current.push(*tok);
        }
    }
    groups.push(current);
    groups
}

/// A relocation whose target symbol is still named rather than indexed; the symbol table only
/// gets its final, sorted order once every label in the source has been seen.
struct PendingReloc {
    offset: u32,
    symbol_name: String,
    kind: RelocKind,
    addend: i32,
}

struct RelocSink {
    rel_text: Vec<PendingReloc>,
    rel_data: Vec<PendingReloc>,
}

fn emit_pass(asm: &mut Assembler, lines: &[Line]) -> (Vec<PendingReloc>, Vec<PendingReloc>, std::collections::HashSet<String>) {
    let mut section = CurrentSection::None;
    let mut global_names = std::collections::HashSet::new();
    let mut sink = RelocSink { rel_text: Vec::new(), rel_data: Vec::new() };

    for line in lines {
        let Some(head) = line.head else { continue };
        match head.kind {
            TokenKind::Directive => {
                let raw_name = String::from_utf8_lossy(tok_text(asm.src, head)).to_lowercase();
                let name = directive_name(&raw_name).to_string();
                match name.as_str() {
                    ".global" => {
                        if let Some(tok) = line.rest.first() {
                            global_names.insert(String::from_utf8_lossy(tok_text(asm.src, tok)).into_owned());
                        }
                    }
                    ".extern" => {
                        if let Some(tok) = line.rest.first() {
                            let name = String::from_utf8_lossy(tok_text(asm.src, tok)).into_owned();
                            asm.labels.entry(name).or_insert(LabelInfo { section: None, offset: 0, scope_id: None });
                        }
                    }
                    ".text" => section = CurrentSection::Text,
                    ".data" => section = CurrentSection::Data,
                    ".bss" => section = CurrentSection::Bss,
                    ".org" | ".advance" | ".align" => { /* pointer bookkeeping already validated in pass 1 */ }
                    ".byte" | ".dbyte" | ".word" | ".dword" => {
                        let width = directive_width(&name);
                        for group in split_operands(&line.rest) {
                            if group.is_empty() {
                                continue;
                            }
                            if group.len() == 1 && group[0].kind == TokenKind::Identifier {
                                // `.word label`: zero placeholder + ABS32 relocation.
                                let label_name = String::from_utf8_lossy(tok_text(asm.src, group[0])).into_owned();
                                let offset = asm.data.len() as u32;
                                asm.data.extend(std::iter::repeat(0u8).take(width as usize));
                                sink.rel_data.push(PendingReloc {
                                    offset,
                                    symbol_name: label_name,
                                    kind: RelocKind::Abs32,
                                    addend: 0,
                                });
                            } else if let Some(value) = eval_expr(asm.src, &group) {
                                asm.data.extend_from_slice(&value.to_le_bytes()[..width as usize]);
                            } else {
                                asm.error(ErrorKind::Syntax, "could not evaluate data directive operand", line.line);
                            }
                        }
                    }
                    ".ascii" | ".asciz" => {
                        if let Some(tok) = line.rest.first() {
                            if tok.kind == TokenKind::StringLiteral {
                                let raw = tok_text(asm.src, tok);
                                let inner = &raw[1..raw.len() - 1];
                                asm.data.extend_from_slice(inner);
                                if name == ".asciz" {
                                    asm.data.push(0);
                                }
                            }
                        }
                    }
                    ".scope" | ".scend" | ".stop" => {
                        if name == ".stop" {
                            break;
                        }
                    }
                    _ => {}
                }
            }
            TokenKind::Identifier => {
                if section == CurrentSection::Text {
                    emit_instruction(asm, &mut sink, head, &line.rest, line.line);
                }
            }
            _ => {}
        }
    }

    (sink.rel_text, sink.rel_data, global_names)
}

fn resolve_label_value(asm: &Assembler, name: &str) -> Option<u32> {
    asm.labels.get(name).and_then(|info| {
        let base = match info.section? {
            CurrentSection::Text => 0,
            CurrentSection::Data => 0,
            CurrentSection::Bss => 0,
            CurrentSection::None => return None,
        };
        Some(base + info.offset)
    })
}

fn emit_instruction(asm: &mut Assembler, sink: &mut RelocSink, mnemonic_tok: &Token, operands: &[&Token], line: u32) {
    let raw = String::from_utf8_lossy(tok_text(asm.src, mnemonic_tok)).to_lowercase();
    let (base_name, s_flag) = if let Some(stripped) = raw.strip_suffix('s') {
        if matches!(stripped, "add" | "adc" | "sub" | "sbc" | "rsb" | "rsc" | "and" | "orr" | "eor" | "bic" | "lsl" | "lsr" | "asr" | "ror" | "mul" | "umull" | "smull") {
            (stripped.to_string(), true)
        } else {
            (raw.clone(), false)
        }
    } else {
        (raw.clone(), false)
    };

    let groups = split_operands(operands);
    let word = match base_name.as_str() {
        "add" | "adc" | "sub" | "sbc" | "rsb" | "rsc" | "and" | "orr" | "eor" | "bic" => {
            let op = match base_name.as_str() {
                "add" => Opcode::Add, "adc" => Opcode::Adc, "sub" => Opcode::Sub, "sbc" => Opcode::Sbc,
                "rsb" => Opcode::Rsb, "rsc" => Opcode::Rsc, "and" => Opcode::And, "orr" => Opcode::Orr,
                "eor" => Opcode::Eor, "bic" => Opcode::Bic, _ => unreachable!(),
            };
            encode_data_processing(asm, op, s_flag, &groups, line)
        }
        "tst" | "teq" | "cmp" | "cmn" => {
            let op = match base_name.as_str() {
                "tst" => Opcode::Tst, "teq" => Opcode::Teq, "cmp" => Opcode::Cmp, "cmn" => Opcode::Cmn, _ => unreachable!(),
            };
            encode_compare(asm, op, &groups, line)
        }
        "lsl" | "lsr" | "asr" | "ror" => {
            let op = match base_name.as_str() {
                "lsl" => Opcode::Lsl, "lsr" => Opcode::Lsr, "asr" => Opcode::Asr, "ror" => Opcode::Ror, _ => unreachable!(),
            };
            encode_shift(asm, op, s_flag, &groups, line)
        }
        "mul" => encode_mul(asm, &groups, line, s_flag),
        "umull" | "smull" => {
            let op = if base_name == "umull" { Opcode::Umull } else { Opcode::Smull };
            encode_mull(asm, op, &groups, line, s_flag)
        }
        "ldr" | "str" | "ldrb" | "strb" | "ldrh" | "strh" => {
            let op = match base_name.as_str() {
                "ldr" => Opcode::Ldr, "str" => Opcode::Str, "ldrb" => Opcode::Ldrb,
                "strb" => Opcode::Strb, "ldrh" => Opcode::Ldrh, "strh" => Opcode::Strh, _ => unreachable!(),
            };
            encode_memory(asm, op, &groups, line)
        }
        "b" | "branch" | "call" | "ret" => {
            let op = match base_name.as_str() {
                "b" | "branch" => Opcode::Branch,
                "call" => Opcode::Call,
                "ret" => Opcode::Ret,
                _ => unreachable!(),
            };
            encode_branch(asm, sink, op, &groups, line)
        }
        "halt" => Some(encoding::format_halt()),
        other => {
            asm.error(ErrorKind::Syntax, format!("unknown mnemonic '{other}'"), line);
            None
        }
    };

    if let Some(word) = word {
        asm.text.extend_from_slice(&word.to_le_bytes());
    } else {
        // Keep section pointer/byte-count symmetry with pass 1 even on an encoding error.
        asm.text.extend_from_slice(&[0, 0, 0, 0]);
    }
}

fn reg_operand(asm: &mut Assembler, group: &[&Token], line: u32) -> Option<u8> {
    let tok = group.first()?;
    let reg = parse_register(asm.src, tok);
    if reg.is_none() {
        asm.error(ErrorKind::Syntax, "expected a register operand", line);
    }
    reg
}

fn operand2_from_group(asm: &mut Assembler, group: &[&Token], line: u32) -> Option<encoding::Operand2> {
    if group.is_empty() {
        asm.error(ErrorKind::Syntax, "missing operand", line);
        return None;
    }
    if group[0].kind == TokenKind::Register {
        let rm = parse_register(asm.src, group[0])?;
        if group.len() == 1 {
            return Some(encoding::Operand2::Reg { rm, shift_type: ShiftType::Lsl, shift_amt: 0 });
        }
        // `rm, LSL #n` style shift suffix.
        if group.len() >= 3 && group[1].kind == TokenKind::Identifier {
            let shift_type = match tok_text(asm.src, group[1]).to_ascii_lowercase().as_slice() {
                b"lsl" => ShiftType::Lsl,
                b"lsr" => ShiftType::Lsr,
                b"asr" => ShiftType::Asr,
                b"ror" => ShiftType::Ror,
                _ => {
                    asm.error(ErrorKind::Syntax, "expected a shift mnemonic", line);
                    return None;
                }
            };
            let amt_tok = group.iter().find(|t| t.kind == TokenKind::IntLiteral(IntRadix::Decimal) || matches!(t.kind, TokenKind::IntLiteral(_)));
            let amt = amt_tok.and_then(|t| parse_int_literal(asm.src, t)).unwrap_or(0) as u8;
            return Some(encoding::Operand2::Reg { rm, shift_type, shift_amt: amt });
        }
        Some(encoding::Operand2::Reg { rm, shift_type: ShiftType::Lsl, shift_amt: 0 })
    } else {
        let value = eval_expr(asm.src, group)?;
        Some(encoding::Operand2::Imm(value as u16))
    }
}

fn encode_data_processing(asm: &mut Assembler, op: Opcode, s: bool, groups: &[Vec<&Token>], line: u32) -> Option<u32> {
    let rd = reg_operand(asm, groups.first()?, line)?;
    let rn = reg_operand(asm, groups.get(1)?, line)?;
    let operand2 = operand2_from_group(asm, groups.get(2)?, line)?;
    Some(match operand2 {
        encoding::Operand2::Imm(imm) => encoding::format_o_imm(op, s, rd, rn, imm),
        encoding::Operand2::Reg { rm, shift_type, shift_amt } => encoding::format_o_reg(op, s, rd, rn, rm, shift_type, shift_amt),
    })
}

fn encode_compare(asm: &mut Assembler, op: Opcode, groups: &[Vec<&Token>], line: u32) -> Option<u32> {
    let rn = reg_operand(asm, groups.first()?, line)?;
    let operand2 = operand2_from_group(asm, groups.get(1)?, line)?;
    Some(match operand2 {
        encoding::Operand2::Imm(imm) => encoding::format_o_imm(op, true, 0, rn, imm),
        encoding::Operand2::Reg { rm, shift_type, shift_amt } => encoding::format_o_reg(op, true, 0, rn, rm, shift_type, shift_amt),
    })
}

fn encode_shift(asm: &mut Assembler, op: Opcode, s: bool, groups: &[Vec<&Token>], line: u32) -> Option<u32> {
    let rd = reg_operand(asm, groups.first()?, line)?;
    let rn = reg_operand(asm, groups.get(1)?, line)?;
    let last = groups.get(2)?;
    let amount = if last.first().map(|t| t.kind) == Some(TokenKind::Register) {
        ShiftAmount::Reg(parse_register(asm.src, last[0])?)
    } else {
        ShiftAmount::Imm(eval_expr(asm.src, last)? as u8)
    };
    Some(encoding::format_o1(op, s, rd, rn, amount))
}

fn encode_mul(asm: &mut Assembler, groups: &[Vec<&Token>], line: u32, s: bool) -> Option<u32> {
    let rd = reg_operand(asm, groups.first()?, line)?;
    let rn = reg_operand(asm, groups.get(1)?, line)?;
    let rm = reg_operand(asm, groups.get(2)?, line)?;
    Some(encoding::format_o2(Opcode::Mul, s, rd, 0, rn, rm))
}

fn encode_mull(asm: &mut Assembler, op: Opcode, groups: &[Vec<&Token>], line: u32, s: bool) -> Option<u32> {
    let rd_lo = reg_operand(asm, groups.first()?, line)?;
    let rd_hi = reg_operand(asm, groups.get(1)?, line)?;
    let rn = reg_operand(asm, groups.get(2)?, line)?;
    let rm = reg_operand(asm, groups.get(3)?, line)?;
    Some(encoding::format_o2(op, s, rd_lo, rd_hi, rn, rm))
}

fn encode_memory(asm: &mut Assembler, op: Opcode, groups: &[Vec<&Token>], line: u32) -> Option<u32> {
    let rd = reg_operand(asm, groups.first()?, line)?;
    let addr_tokens = groups.get(1)?;
    // Addressing syntax: `[rn, #imm]`, `[rn, #imm]!`, `[rn], #imm`, `[rn, rm]`.
    let bracket_close = addr_tokens.iter().position(|t| is_punct(t, b"]"))?;
    let rn_tok = addr_tokens.iter().find(|t| t.kind == TokenKind::Register)?;
    let rn = parse_register(asm.src, rn_tok)?;
    let post_indexed = bracket_close + 1 < addr_tokens.len() || groups.len() > 2;
    let pre_indexed = addr_tokens.last().is_some_and(|t| is_punct(t, b"!"));

    let offset_group: Vec<&Token> = if post_indexed && groups.len() > 2 {
        groups[2].clone()
    } else {
        addr_tokens[1..bracket_close].iter().filter(|t| **t != *rn_tok).copied().collect()
    };

    let mode = if pre_indexed {
        AddrMode::PreIndexed
    } else if post_indexed {
        AddrMode::PostIndexed
    } else {
        AddrMode::Offset
    };

    let offset = if offset_group.first().map(|t| t.kind) == Some(TokenKind::Register) {
        MemOperand::Reg(parse_register(asm.src, offset_group[0])?)
    } else if offset_group.is_empty() {
        MemOperand::Imm(0)
    } else {
        MemOperand::Imm(eval_expr(asm.src, &offset_group)? as i16)
    };

    Some(encoding::format_m(op, rd, rn, offset, mode))
}

fn encode_branch(asm: &mut Assembler, sink: &mut RelocSink, op: Opcode, groups: &[Vec<&Token>], line: u32) -> Option<u32> {
    if op == Opcode::Ret {
        return Some(encoding::format_branch(op, 0));
    }
    let target_tok = groups.first()?.first()?;
    if target_tok.kind != TokenKind::Identifier {
        asm.error(ErrorKind::Syntax, "branch target must be a label", line);
        return None;
    }
    let name = String::from_utf8_lossy(tok_text(asm.src, target_tok)).into_owned();
    if let Some(target) = resolve_label_value(asm, &name) {
        let next_pc = asm.text.len() as u32 + 4;
        let offset = (target as i64 - next_pc as i64) / 4;
        Some(encoding::format_branch(op, offset as i32))
    } else {
        let offset_in_section = asm.text.len() as u32;
        sink.rel_text.push(PendingReloc { offset: offset_in_section, symbol_name: name, kind: RelocKind::PcRel24, addend: 0 });
        Some(encoding::format_branch(op, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_a_single_adc_instruction() {
        let src = b".text\nadc r0, r1, #9\nhalt\n";
        let object = assemble(src).unwrap();
        let text = &object.section(SectionKind::Text).unwrap().data;
        assert_eq!(text.len(), 8);
        let word = u32::from_le_bytes(text[0..4].try_into().unwrap());
        assert_eq!(
            encoding::decode(word).unwrap(),
            basm_cpu::encoding::Instruction::DataProcessing {
                op: Opcode::Adc, s: false, rd: 0, rn: 1, operand2: encoding::Operand2::Imm(9)
            }
        );
    }

    #[test]
    fn resolves_local_labels_for_branches() {
        let src = b".text\nstart:\nb start\nhalt\n";
        let object = assemble(src).unwrap();
        let text = &object.section(SectionKind::Text).unwrap().data;
        let word = u32::from_le_bytes(text[0..4].try_into().unwrap());
        match encoding::decode(word).unwrap() {
            basm_cpu::encoding::Instruction::Branch { offset, .. } => assert_eq!(offset, -1),
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn data_directives_pack_little_endian() {
        let src = b".data\n.word 0x01020304\n";
        let object = assemble(src).unwrap();
        let data = &object.section(SectionKind::Data).unwrap().data;
        assert_eq!(&data[0..4], &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn duplicate_labels_are_reported() {
        let src = b".text\nfoo:\nfoo:\nhalt\n";
        let err = assemble(src).unwrap_err();
        assert!(err.iter().any(|d| d.kind == ErrorKind::DuplicateLabel));
    }

    #[test]
    fn directives_outside_data_section_are_rejected() {
        let src = b".text\n.word 1\n";
        let err = assemble(src).unwrap_err();
        assert!(err.iter().any(|d| d.kind == ErrorKind::WrongSection));
    }

    #[test]
    fn unmatched_scend_is_reported() {
        let src = b".text\n.scend\nhalt\n";
        let err = assemble(src).unwrap_err();
        assert!(err.iter().any(|d| d.kind == ErrorKind::UnmatchedScend));
    }
}
