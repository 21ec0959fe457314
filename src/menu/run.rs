use argp::FromArgs;

/// Load an executable image and run it on the emulator.
#[derive(FromArgs, PartialEq, Debug)]
#[argp(subcommand, name = "run")]
pub struct RunOptions {
    /// executable (`.bexe`) to load
    #[argp(positional)]
    pub input: String,

    /// total physical RAM given to the machine, in bytes
    #[argp(option, default = "1 << 20")]
    pub ram: usize,

    /// maximum instructions to execute before giving up (0 = unbounded)
    #[argp(option, default = "1_000_000")]
    pub max_instructions: u64,
}
