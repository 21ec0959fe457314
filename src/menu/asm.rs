use argp::FromArgs;

/// Assemble one or more source files into a relocatable object file (or a static library).
#[derive(FromArgs, PartialEq, Debug)]
#[argp(subcommand, name = "asm")]
pub struct AsmOptions {
    /// stop after producing a `.bo` file (this is currently the assembler's only mode, kept as a
    /// named flag so scripts written against the flag table don't need special-casing)
    #[argp(switch, short = 'c')]
    pub compile: bool,

    /// produce a `.ba` static library from the assembled inputs instead of a single object
    #[argp(switch)]
    pub makelib: bool,

    /// output file base name
    #[argp(option, short = 'o')]
    pub output: Option<String>,

    /// output directory
    #[argp(option)]
    pub outdir: Option<String>,

    /// optimization level 0..3 (recognized and threaded through; identity transform today)
    #[argp(option, short = 'O')]
    pub optimize: Option<u8>,

    /// enable all optimizations (also identity today)
    #[argp(switch)]
    pub oall: bool,

    /// enable a named warning class
    #[argp(option, short = 'W')]
    pub warning: Vec<String>,

    /// enable all warnings
    #[argp(switch)]
    pub wall: bool,

    /// add a system-include search directory (preprocessing is out of scope; accepted for
    /// command-line compatibility and ignored)
    #[argp(option, short = 'I')]
    pub include: Vec<String>,

    /// link against a named static library when producing an executable in one step
    #[argp(option, short = 'l')]
    pub library: Vec<String>,

    /// add a library search directory
    #[argp(option, short = 'L')]
    pub libdir: Vec<String>,

    /// preprocessor define `k[=v]` (preprocessing is out of scope; accepted and ignored)
    #[argp(option, short = 'D')]
    pub define: Vec<String>,

    /// keep processed `.bi` files (no-op: this toolchain does not run a preprocessing pass)
    #[argp(switch)]
    pub kp: bool,

    /// source files to assemble
    #[argp(positional)]
    pub inputs: Vec<String>,
}
