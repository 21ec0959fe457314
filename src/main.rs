#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[cfg(not(target_env = "musl"))]
use mimalloc as _;

use std::{io::prelude::*, path::Path};

use anyhow::{bail, Context, Result};
use basm_core::prelude::*;
use basm_core::util::format_size;
use basm_cpu::prelude::*;
use basm_link::prelude as link;
use basm_memory::prelude::*;
use basm_object::prelude::*;
use env_logger::Builder;
use log::{Level, LevelFilter};
use owo_colors::OwoColorize;

mod menu;
use menu::{AsmOptions, LinkOptions, Modules, RunOptions};

fn color_level(level: Level) -> String {
    match level {
        Level::Error => level.red().to_string(),
        Level::Warn => level.yellow().to_string(),
        Level::Info => level.green().to_string(),
        Level::Debug => level.blue().to_string(),
        Level::Trace => level.purple().to_string(),
    }
}

const fn level_filter(verbose: usize) -> LevelFilter {
    match verbose {
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        5 => LevelFilter::Trace,
        _ => LevelFilter::Off,
    }
}

fn main() -> Result<()> {
    let args: menu::Basm = argp::parse_args_or_exit(argp::DEFAULT);

    if args.verbose != 0 {
        Builder::new()
            .format(|buf, record| writeln!(buf, "[{}] {}", color_level(record.level()), record.args()))
            .filter(None, level_filter(args.verbose))
            .init();
    }

    match args.nested {
        Modules::Asm(options) => run_asm(options),
        Modules::Link(options) => run_link(options),
        Modules::Run(options) => run_run(options),
    }
}

fn run_asm(options: AsmOptions) -> Result<()> {
    if options.inputs.is_empty() {
        bail!("no source files given");
    }

    let outdir = options.outdir.as_deref().map(Path::new);
    log_inert_flags(&options);
    let mut objects = Vec::new();

    for input in &options.inputs {
        let source = std::fs::read(input).with_context(|| format!("reading {input}"))?;
        let object = basm_asm::assembler::assemble(&source).map_err(|diagnostics| {
            for d in &diagnostics {
                log::error!("{input}:{}: {:?}: {}", d.line, d.kind, d.message);
            }
            anyhow::anyhow!("assembly of {input} failed with {} error(s)", diagnostics.len())
        })?;
        objects.push((input.clone(), object));
    }

    if options.makelib {
        let library = StaticLibrary { members: objects.into_iter().map(|(_, o)| o).collect() };
        let bytes = library.to_bytes();
        let output = resolve_output(options.output.as_deref(), &options.inputs[0], "ba", outdir);
        log::info!("writing {} ({})", output, format_size(bytes.len()));
        std::fs::write(output, bytes)?;
        return Ok(());
    }

    for (input, object) in objects {
        let bytes = object.to_bytes();
        let output = resolve_output(options.output.as_deref(), &input, "bo", outdir);
        log::info!("writing {} ({})", output, format_size(bytes.len()));
        std::fs::write(output, bytes)?;
    }
    Ok(())
}

/// Logs, rather than silently dropping, every recognized flag this toolchain doesn't yet act on:
/// optimization levels (identity transform), warning selection, and preprocessor-adjacent flags
/// (`-I`/`-D`/`-kp`) whose expansion stage is out of scope.
fn log_inert_flags(options: &AsmOptions) {
    if let Some(level) = options.optimize {
        log::debug!("-O{level} recognized, optimization is currently an identity transform");
    }
    if options.oall {
        log::debug!("-oall recognized, optimization is currently an identity transform");
    }
    if options.wall {
        log::debug!("-wall: all warning classes enabled");
    }
    for warning in &options.warning {
        log::debug!("-W{warning}: warning class enabled");
    }
    for include in &options.include {
        log::debug!("-I{include}: accepted, no preprocessing stage runs in this toolchain");
    }
    for library in &options.library {
        log::debug!("-l{library}: accepted, one-step assemble+link is not implemented");
    }
    for libdir in &options.libdir {
        log::debug!("-L{libdir}: accepted, one-step assemble+link is not implemented");
    }
    for define in &options.define {
        log::debug!("-D{define}: accepted, no preprocessing stage runs in this toolchain");
    }
    if options.kp {
        log::debug!("-kp: no-op, this toolchain has no preprocessing pass to keep output from");
    }
    if options.compile {
        log::debug!("-c: this is the assembler's only mode today");
    }
}

fn resolve_output(explicit: Option<&str>, input: &str, extension: &str, outdir: Option<&Path>) -> String {
    let base = explicit.map(str::to_string).unwrap_or_else(|| {
        let mut path = std::path::PathBuf::from(input);
        path.set_extension(extension);
        path.to_string_lossy().into_owned()
    });
    match outdir {
        Some(dir) => dir.join(base).to_string_lossy().into_owned(),
        None => base,
    }
}

fn run_link(options: LinkOptions) -> Result<()> {
    if options.inputs.is_empty() {
        bail!("no input files given");
    }

    let entry = match &options.entry {
        Some(text) => parse_u32(text).context("invalid --entry value")?,
        None => link::DEFAULT_ENTRY,
    };

    let mut objects = Vec::new();
    let mut libraries = Vec::new();
    for input in &options.inputs {
        let bytes = std::fs::read(input).with_context(|| format!("reading {input}"))?;
        if input.ends_with(".ba") {
            libraries.push(StaticLibrary::from_bytes(&bytes).with_context(|| format!("parsing {input}"))?);
        } else {
            objects.push(ObjectFile::from_bytes(&bytes).with_context(|| format!("parsing {input}"))?);
        }
    }

    let linked = link::link(objects, libraries, entry)
        .map_err(|e| anyhow::anyhow!("link failed: {e}"))?;

    let bytes = linked.to_bytes();
    let output = options.output.unwrap_or_else(|| "a.bexe".to_string());
    log::info!("writing {} ({})", output, format_size(bytes.len()));
    std::fs::write(output, bytes)?;
    Ok(())
}

fn parse_u32(text: &str) -> Result<u32> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Ok(u32::from_str_radix(hex, 16)?)
    } else {
        Ok(text.parse()?)
    }
}

fn run_run(options: RunOptions) -> Result<()> {
    let bytes = std::fs::read(&options.input).with_context(|| format!("reading {}", options.input))?;
    let object = ObjectFile::from_bytes(&bytes).context("parsing executable")?;

    let frame_count = (options.ram as u32 / PAGE_SIZE).max(1);
    let mut bus = SystemBus::new(frame_count);

    let text_base = link::DEFAULT_ENTRY;
    let text = object.section(SectionKind::Text).map(|s| s.data.as_slice()).unwrap_or(&[]);
    let data = object.section(SectionKind::Data).map(|s| s.data.as_slice()).unwrap_or(&[]);
    let bss = object.section(SectionKind::Bss).map(|s| s.data.len()).unwrap_or(0);
    let max_align = object.sections.iter().map(|s| s.align.max(1)).max().unwrap_or(4);
    let data_base = align_up(text_base + text.len() as u32, max_align);
    let bss_base = align_up(data_base + data.len() as u32, max_align);

    for (i, byte) in text.iter().enumerate() {
        bus.write_byte(text_base + i as u32, *byte, true)?;
    }
    for (i, byte) in data.iter().enumerate() {
        bus.write_byte(data_base + i as u32, *byte, true)?;
    }
    let _ = (bss_base, bss); // bss is already zero-filled by first-touch semantics

    let mut cpu = Cpu::default();
    cpu.regs.pc = text_base;

    log::info!("loaded {} ({}), entry {text_base:#010x}", options.input, format_size(bytes.len()));
    let exception = cpu.run(&mut bus, if options.max_instructions == 0 { u64::MAX } else { options.max_instructions });

    println!("stopped: {exception:?}");
    println!("registers: {:?}", cpu.regs);

    match exception {
        Exception::Halt | Exception::Ok => Ok(()),
        other => bail!("execution stopped abnormally: {other:?}"),
    }
}

fn align_up(value: u32, align: u32) -> u32 {
    if align <= 1 {
        value
    } else {
        (value + align - 1) / align * align
    }
}
