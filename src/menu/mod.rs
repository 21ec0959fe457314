use argp::FromArgs;

mod asm;
mod link;
mod run;
pub use asm::AsmOptions;
pub use link::LinkOptions;
pub use run::RunOptions;

/// Top-level command.
#[derive(FromArgs, PartialEq, Debug)]
#[argp(description = "Assembler, linker, and emulator for a 32-bit load/store architecture.")]
pub struct Basm {
    #[argp(option, short = 'v', global, default = "0")]
    #[argp(description = "Logging level (0 = Off, 1 = Error, 2 = Warn, 3 = Info, 4 = Debug, 5 = Trace)")]
    pub verbose: usize,

    #[argp(subcommand)]
    pub nested: Modules,
}

/// The three entry points the toolchain supports via the command line.
#[derive(FromArgs, PartialEq, Debug)]
#[argp(subcommand)]
#[non_exhaustive]
pub enum Modules {
    Asm(AsmOptions),
    Link(LinkOptions),
    Run(RunOptions),
}
