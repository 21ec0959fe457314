use argp::FromArgs;

/// Link relocatable objects and static libraries into an executable image.
#[derive(FromArgs, PartialEq, Debug)]
#[argp(subcommand, name = "link")]
pub struct LinkOptions {
    /// output file name
    #[argp(option, short = 'o')]
    pub output: Option<String>,

    /// add a library search directory
    #[argp(option, short = 'L')]
    pub libdir: Vec<String>,

    /// override the default load address of `.text` (default `0x1000`)
    #[argp(option)]
    pub entry: Option<String>,

    /// object files and static libraries to link
    #[argp(positional)]
    pub inputs: Vec<String>,
}
