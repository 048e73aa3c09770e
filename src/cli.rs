use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    author, version, about = "Coverage tracks and per-position mutation tallies from aligned reads", long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Genome-wide coverage track.
    Coverage(CoverageArgs),
    /// Per-position base-tally mutation report.
    Mutation(MutationArgs),
}

#[derive(clap::Args, Debug)]
pub struct CoverageArgs {
    /// Aligned reads (BAM). Default: stdin.
    #[arg(long = "bam", value_name = "BAM", default_value = "-", value_parser(check_input_exists))]
    pub bam: String,

    /// Output coverage track. Default: stdout.
    #[arg(long = "bw", value_name = "OUT", default_value = "-")]
    pub bw: String,

    #[arg(long = "library-type", value_enum, default_value_t = LibraryTypeArg::Unstranded)]
    pub library_type: LibraryTypeArg,

    #[arg(long = "strand", value_enum, default_value_t = StrandArg::All)]
    pub strand: StrandArg,

    /// Positions per output bin. Only 1 is supported.
    #[arg(long = "bin-size", value_name = "N", default_value_t = 1)]
    pub bin_size: u32,

    #[arg(short = 't', long = "threads", value_name = "P", default_value_t = 1)]
    pub threads: usize,
}

#[derive(clap::Args, Debug)]
pub struct MutationArgs {
    /// Aligned reads (BAM). Default: stdin.
    #[arg(long = "bam", value_name = "BAM", default_value = "-", value_parser(check_input_exists))]
    pub bam: String,

    /// Output mutation report. Default: stdout.
    #[arg(long = "out", value_name = "OUT", default_value = "-")]
    pub out: String,

    /// Indexed reference FASTA. Omitted: modal-base fallback.
    #[arg(long = "fa", value_name = "REF", value_parser(check_input_exists))]
    pub fa: Option<String>,

    /// BED mask: bypasses the threshold filter entirely.
    #[arg(long = "bed", value_name = "MASK", value_parser(check_input_exists))]
    pub bed: Option<String>,

    #[arg(long = "library-type", value_enum, default_value_t = LibraryTypeArg::Unstranded)]
    pub library_type: LibraryTypeArg,

    #[arg(long = "count", value_name = "C", default_value_t = 1.0)]
    pub count: f64,

    #[arg(long = "prop", value_name = "E", default_value_t = 0.0)]
    pub prop: f64,

    #[arg(short = 't', long = "threads", value_name = "P", default_value_t = 1)]
    pub threads: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LibraryTypeArg {
    Unstranded,
    FrFirststrand,
    FrSecondstrand,
}

impl From<LibraryTypeArg> for crate::cigar::LibraryType {
    fn from(v: LibraryTypeArg) -> Self {
        match v {
            LibraryTypeArg::Unstranded => crate::cigar::LibraryType::Unstranded,
            LibraryTypeArg::FrFirststrand => crate::cigar::LibraryType::FrFirstStrand,
            LibraryTypeArg::FrSecondstrand => crate::cigar::LibraryType::FrSecondStrand,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StrandArg {
    All,
    Forward,
    Reverse,
}

impl From<StrandArg> for crate::cigar::RequestedStrand {
    fn from(v: StrandArg) -> Self {
        match v {
            StrandArg::All => crate::cigar::RequestedStrand::All,
            StrandArg::Forward => crate::cigar::RequestedStrand::Forward,
            StrandArg::Reverse => crate::cigar::RequestedStrand::Reverse,
        }
    }
}

fn check_input_exists(s: &str) -> Result<String, String> {
    if s == "-" {
        return Ok(s.to_string());
    }
    if std::path::Path::new(s).exists() {
        Ok(s.to_string())
    } else {
        Err(format!("File does not exist: {}", s))
    }
}
